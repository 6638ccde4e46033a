//! Core types for jobmon.
//!
//! Job metadata, metric configuration, served datasets and the error
//! taxonomy shared by the engine, store and cache crates.

pub mod catalog;
pub mod config;
pub mod data;
pub mod duration;
pub mod error;
pub mod filter;
pub mod job;

pub use catalog::{CatalogHandle, FALLBACK_MAX_TIME, MetricCatalog};
pub use config::{
    ALLOWED_AGG_FNS, BasePartitionConfig, ConfigError, Configuration, DbConfig, JobStoreConfig,
    MetricConfig, PartitionConfig, VirtualPartitionConfig,
};
pub use data::{FluxValue, JobData, MetricData, QuantileData, QueryResult, SeriesMap};
pub use duration::{format_flux_duration, parse_duration};
pub use error::{ErrorKind, JobValidationError};
pub use filter::{JobFilter, RangeFilter};
pub use job::{Job, MetricSummary, NewTag, StopJob, Tag};
