use camino::Utf8PathBuf;
use jobmon_core::{ErrorKind, JobValidationError};
use jobmon_engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(i64),

    #[error("Job {0} already exists")]
    AlreadyExists(i64),

    #[error("Job {0} is already stopped")]
    AlreadyStopped(i64),

    #[error("Job {0} is still running")]
    StillRunning(i64),

    #[error(transparent)]
    Invalid(#[from] JobValidationError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Could not compute metric summaries: {0}")]
    Enrichment(#[from] EngineError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) | Self::AlreadyStopped(_) | Self::StillRunning(_) => {
                ErrorKind::StateConflict
            }
            Self::Invalid(_) => ErrorKind::Validation,
            Self::Io { .. } | Self::Json(_) | Self::Sqlx(_) => ErrorKind::BackendUnavailable,
            Self::Enrichment(e) => e.kind(),
        }
    }
}
