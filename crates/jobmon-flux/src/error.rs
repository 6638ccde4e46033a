use jobmon_core::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FluxError {
    #[error("Invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("Unknown aggregation function {0:?}")]
    UnknownAggFn(String),

    #[error("Invalid clause {0:?}")]
    InvalidClause(String),

    #[error("Invalid quantile {0:?}")]
    InvalidQuantile(String),

    #[error("At most 26 quantiles are supported, got {0}")]
    TooManyQuantiles(usize),

    #[error("Node filter is empty")]
    EmptyNodeFilter,

    #[error("Request to {url} failed: {source}")]
    RequestError {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Backend returned {status} for {url}: {body}")]
    StatusError {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Query failed: {0}")]
    QueryError(String),

    #[error("Malformed CSV at line {line}: {message}")]
    CsvError { line: usize, message: String },

    #[error("Record has no column {0:?}")]
    MissingColumn(String),

    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },
}

impl FluxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidIdentifier(_)
            | Self::UnknownAggFn(_)
            | Self::InvalidClause(_)
            | Self::InvalidQuantile(_)
            | Self::TooManyQuantiles(_)
            | Self::EmptyNodeFilter => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::RequestError { .. }
            | Self::StatusError { .. }
            | Self::QueryError(_)
            | Self::CsvError { .. }
            | Self::MissingColumn(_) => ErrorKind::BackendUnavailable,
        }
    }
}
