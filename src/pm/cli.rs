use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "progman",
    version,
    about = "process supervisor with an embedded HTTP dashboard"
)]
pub struct Args {
    /// Path to the settings YAML. Its directory becomes the state base dir
    /// (progs.yaml, pids.json, log/, uploaded_programs/).
    #[arg(short = 'c', long = "config", default_value = "manager.yaml")]
    pub config: PathBuf,
}
