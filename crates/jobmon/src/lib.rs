//! The jobmon service.
//!
//! [`AppContext`] wires the engine, the job store and the result cache
//! together; the janitor and the configuration watcher run beside it.

pub mod context;
pub mod janitor;
pub mod logging;
pub mod watcher;

pub use context::{AppContext, ContextError, DataRequest};
pub use janitor::JanitorService;
pub use watcher::{ConfigWatcher, WatcherEvent};
