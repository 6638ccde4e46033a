//! Result cache for jobmon.
//!
//! Datasets of finished jobs are immutable apart from their metadata, so
//! they are kept in a strict-capacity LRU keyed by job id.

pub mod cache;

pub use cache::{CacheError, ResultCache};
