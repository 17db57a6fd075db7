use std::path::PathBuf;
use thiserror::Error;

/// Failures reported before any child process exists.
///
/// Everything that can go wrong once a process has been (or failed to be)
/// started is an [`Outcome`](crate::runner::Outcome) instead, so callers can
/// always render a terminal result.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a generation job is already running in this session")]
    AlreadyRunning,
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
