use std::io;

use thiserror::Error;

/// Control-plane error taxonomy. Each kind maps onto the HTTP status the web
/// layer answers with; asynchronous failures (install, crash) never surface
/// here — they land in the program's log and its `error` state instead.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("program already exists: {0}")]
    NameConflict(String),
    #[error("unknown program: {0}")]
    NotFound(String),
    #[error("program '{name}' is {state}; operation not allowed in this state")]
    Busy { name: String, state: &'static str },
    #[error("bad declaration: {0}")]
    BadDeclaration(String),
    #[error("script not found: {0}")]
    ScriptNotFound(String),
    #[error("script is not executable: {0}")]
    NotExecutable(String),
    #[error("unsafe path in archive: {0}")]
    UnsafePath(String),
    #[error("archive too large: {size} bytes (limit {limit})")]
    ArchiveTooLarge { size: u64, limit: u64 },
    #[error("install step timed out after {0} seconds")]
    InstallTimeout(u64),
    #[error("failed to spawn child: {0}")]
    SpawnFailed(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ControlError {
    pub fn http_status(&self) -> u16 {
        match self {
            ControlError::NameConflict(_) | ControlError::Busy { .. } => 409,
            ControlError::NotFound(_) => 404,
            ControlError::BadDeclaration(_)
            | ControlError::ScriptNotFound(_)
            | ControlError::NotExecutable(_)
            | ControlError::UnsafePath(_) => 400,
            ControlError::ArchiveTooLarge { .. } => 413,
            ControlError::InstallTimeout(_)
            | ControlError::SpawnFailed(_)
            | ControlError::Io(_)
            | ControlError::Other(_) => 500,
        }
    }
}

/// Distinguished startup failure so the binary can exit with code 2.
#[derive(Debug, Error)]
#[error("web port already in use: {0}")]
pub struct PortInUse(pub String);
