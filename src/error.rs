use std::path::PathBuf;

use thiserror::Error;

use crate::instance::InstanceId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("instance lock {path} is held by another process")]
    LockUnavailable { path: PathBuf },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Delete(#[from] DeleteError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("runtime config not found at {path}")]
    NotFound { path: PathBuf },

    #[error("runtime config {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {command}: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {timeout_secs}s")]
    TimedOut { command: String, timeout_secs: u64 },

    #[error("{command} exited with code {code:?}: {output}")]
    Failed {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

/// Why one stop attempt was considered failed.
#[derive(Error, Debug)]
pub enum StopFailure {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("output contained stop error marker {marker:?}")]
    Marker { marker: String },
}

/// Surfaced by delete only when the primary and the fallback stop both fail.
#[derive(Error, Debug)]
#[error("failed to stop instance {id}: cvd stop: {primary}; stop_cvd: {fallback}")]
pub struct DeleteError {
    pub id: InstanceId,
    pub primary: StopFailure,
    pub fallback: StopFailure,
}
