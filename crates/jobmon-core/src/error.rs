//! Error taxonomy shared across crates.
//!
//! Every crate keeps its own error enum; each of them maps onto an
//! [`ErrorKind`] so the API layer can translate failures into status codes
//! without knowing the concrete type.

use std::fmt;
use thiserror::Error;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request, rejected before touching any subsystem
    Validation,
    /// Unknown job, tag or user
    NotFound,
    /// Time-series or relational backend could not be reached
    BackendUnavailable,
    /// Operation not allowed in the current lifecycle state
    StateConflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::BackendUnavailable => "backend_unavailable",
            Self::StateConflict => "state_conflict",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Invariant violations detected on a job record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobValidationError {
    #[error("job {id}: node list has {actual} nodes but NumNodes is {expected}")]
    NodeCountMismatch { id: i64, expected: u32, actual: usize },
    #[error("job {id}: stop time {stop} is before start time {start}")]
    StopBeforeStart { id: i64, start: i64, stop: i64 },
    #[error("job {id}: negative TTL {ttl}")]
    NegativeTtl { id: i64, ttl: i64 },
}
