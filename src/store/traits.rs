//! `ProgressStore` trait: the durable state machine behind every job run.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::jobs::settings::Settings;
use crate::store::model::{JobStatus, ProgressRecord, ResetAllQueue, StartOutcome};

/// Backend-agnostic persistence for progress records and the reset-all queue.
///
/// Every mutating operation is a single logical unit on its job key; `start`
/// in particular is a compare-and-set on the `running` singleton.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    // ── Progress records ────────────────────────────────────────────

    /// Create or overwrite the record for `key` in `running`, unless a
    /// different key already holds the running slot.
    async fn start(
        &self,
        key: &str,
        total: u64,
        batch_size: u64,
        settings: &Settings,
    ) -> Result<StartOutcome, DatabaseError>;

    /// Record progress. Returns `false` when no record exists.
    ///
    /// A cancelled record only has `processed` updated. Otherwise reaching
    /// `total` moves it to `completed`.
    async fn update_progress(&self, key: &str, processed: u64) -> Result<bool, DatabaseError>;

    /// Move the record to `error` with a message. Returns `false` when absent.
    async fn set_error(&self, key: &str, message: &str) -> Result<bool, DatabaseError>;

    /// Move a `running` record to `cancelled`. Returns `false` when the record
    /// is absent or not running.
    async fn cancel(&self, key: &str) -> Result<bool, DatabaseError>;

    /// Get the record for a key.
    async fn get(&self, key: &str) -> Result<Option<ProgressRecord>, DatabaseError>;

    /// Get the single record currently in `running`, if any.
    async fn get_running(&self) -> Result<Option<ProgressRecord>, DatabaseError>;

    /// List records ordered by key, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<ProgressRecord>, DatabaseError>;

    /// Delete the record for a key. Absent records count as success.
    async fn reset(&self, key: &str) -> Result<(), DatabaseError>;

    /// Delete every record.
    async fn reset_all(&self) -> Result<(), DatabaseError>;

    /// Move every `running` record to `cancelled`. Returns how many were touched.
    async fn abandon_running(&self) -> Result<u64, DatabaseError>;

    // ── Reset-all queue ─────────────────────────────────────────────

    /// Load the reset-all worklist, if one exists.
    async fn load_reset_queue(&self) -> Result<Option<ResetAllQueue>, DatabaseError>;

    /// Persist the worklist, replacing any previous one.
    async fn save_reset_queue(&self, queue: &ResetAllQueue) -> Result<(), DatabaseError>;

    /// Move the worklist cursor.
    async fn set_reset_cursor(&self, index: usize) -> Result<(), DatabaseError>;

    /// Delete the worklist.
    async fn clear_reset_queue(&self) -> Result<(), DatabaseError>;
}
