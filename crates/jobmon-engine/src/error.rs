use jobmon_core::ErrorKind;
use jobmon_flux::FluxError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Job {0} is still running")]
    JobRunning(i64),

    #[error("Job {id} has an empty time range ({start}..{stop})")]
    InvalidTimeRange { id: i64, start: i64, stop: i64 },

    #[error("Unknown metric {0:?}")]
    UnknownMetric(String),

    #[error("No metric data could be fetched for job {0}")]
    NoData(i64),

    #[error(transparent)]
    Flux(#[from] FluxError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::JobRunning(_) | Self::InvalidTimeRange { .. } => ErrorKind::StateConflict,
            Self::UnknownMetric(_) => ErrorKind::NotFound,
            Self::NoData(_) => ErrorKind::BackendUnavailable,
            Self::Flux(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(EngineError::JobRunning(1).kind(), ErrorKind::StateConflict);
        assert_eq!(
            EngineError::from(FluxError::UnknownAggFn("median".into())).kind(),
            ErrorKind::Validation
        );
        assert_eq!(EngineError::NoData(1).kind(), ErrorKind::BackendUnavailable);
    }
}
