//! Persistence layer: libSQL-backed progress records and the reset-all queue.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use model::{JobStatus, ProgressRecord, ResetAllEntry, ResetAllQueue, StartOutcome, percentage};
pub use traits::ProgressStore;
