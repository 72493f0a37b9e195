pub mod cli;
pub mod config;
pub mod cpu;
pub mod daemon;
pub mod errors;
pub mod installer;
pub mod logs;
pub mod program;
pub mod registry;
pub mod snapshot;
pub mod spawn;
pub mod state;
pub mod supervisor;
pub mod web;
