//! progman: a lightweight process supervisor with an embedded HTTP dashboard.
//!
//! The daemon owns the lifecycle of a fleet of long-running child programs on
//! a single host: it spawns them detached into their own sessions, attaches
//! their output to rotating log files, restarts them on crash with bounded
//! retry, installs uploaded program bundles in the background, and persists
//! enough state to reattach to still-running children across its own restarts.

pub mod pm;
