//! Flux integration for jobmon.
//!
//! Builds Flux queries from metric configuration, parses the annotated CSV
//! the backend answers with, and talks to the InfluxDB v2 HTTP API.

pub mod client;
pub mod csv;
pub mod error;
pub mod expr;
pub mod query;
pub mod result;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{Bucket, FluxBackend, InfluxClient, Organization, Task};
pub use error::FluxError;
pub use expr::{AggFn, Clause, Ident, NodeFilter};
pub use query::{MeasurementQuery, QueryBuilder, Synthesized};
pub use result::group_by_key;
