//! Time-series query engine for jobmon.
//!
//! Translates metric requests for a job into Flux queries, runs them
//! concurrently (one task per metric), computes per-metric summaries with
//! change points, serves live datapoints and keeps the backend's
//! aggregation tasks in sync with the metric catalog.

pub mod engine;
pub mod error;
pub mod live;
pub mod plan;
pub mod source;
pub mod tasks;

pub use engine::{EngineSettings, TimeSeriesEngine};
pub use error::EngineError;
pub use live::LiveSession;
pub use source::MetricsSource;
