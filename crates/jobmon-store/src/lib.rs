//! Job metadata storage for jobmon.
//!
//! [`JobStore`] is implemented by [`MemoryStore`] (a map behind one mutex,
//! optionally persisted to a JSON file) and [`SqliteStore`]. Lifecycle
//! rules that hold for every backend (stop with enrichment, reaping,
//! overtime finishing) live in [`JobLifecycle`].

pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use error::StoreError;
pub use lifecycle::{JanitorReport, JobLifecycle, OVERTIME_EXIT_CODE};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{JobStore, SessionStore, open_store};
