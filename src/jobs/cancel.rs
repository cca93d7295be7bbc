//! Cooperative cancellation signal handed to job capabilities.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::store::{JobStatus, ProgressStore};

/// Checks whether the run a batch belongs to has been cancelled.
///
/// Capabilities poll this between items. Cancellation is requested through
/// the progress store by another request, so each check reads the stored
/// status; once observed, the signal stays tripped.
#[derive(Clone)]
pub struct CancelSignal {
    job_key: String,
    store: Option<Arc<dyn ProgressStore>>,
    tripped: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new(job_key: impl Into<String>, store: Arc<dyn ProgressStore>) -> Self {
        Self {
            job_key: job_key.into(),
            store: Some(store),
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A signal that never fires (reset and reset-all batches).
    pub fn never(job_key: impl Into<String>) -> Self {
        Self {
            job_key: job_key.into(),
            store: None,
            tripped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Store read failures count as "not cancelled"; the batch finishes normally.
    pub async fn is_cancelled(&self) -> bool {
        if self.tripped.load(Ordering::Acquire) {
            return true;
        }
        let Some(store) = &self.store else {
            return false;
        };
        match store.get(&self.job_key).await {
            Ok(Some(record)) if record.status == JobStatus::Cancelled => {
                self.tripped.store(true, Ordering::Release);
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(job_key = %self.job_key, error = %e, "Cancel check failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("job_key", &self.job_key)
            .field("tripped", &self.tripped.load(Ordering::Relaxed))
            .finish()
    }
}
