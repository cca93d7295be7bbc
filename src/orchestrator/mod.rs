//! Server-side orchestration of job runs, resets and reset-all runs.
//!
//! The orchestrator keeps no cross-request memory of its own: everything
//! resumable lives in the [`ProgressStore`]. Each public operation is one
//! request/response cycle driven by a client polling loop.

mod batch;
mod reset;
mod reset_all;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::DEFAULT_RESET_BATCH_SIZE;
use crate::error::{CapabilityError, JobError};
use crate::jobs::registry::JobRegistry;
use crate::store::{ProgressRecord, ProgressStore};

pub use types::{
    GlobalStatus, JobStatusView, JobSummary, MessageResponse, ResetAllStep, ResetCheck,
    StartJobResponse, StartResetAllResponse, StartResetResponse, StepResponse,
};

const RESET_SUFFIX: &str = "_reset";
const RESET_ALL_SUFFIX: &str = "_reset_all";
/// Lock key serializing reset-all steps.
const RESET_ALL_LOCK: &str = "\0reset_all";

/// Progress key of a single-job reset run.
pub fn reset_key(key: &str) -> String {
    format!("{key}{RESET_SUFFIX}")
}

/// Progress key of one job's slice of a reset-all run.
pub fn reset_all_key(key: &str) -> String {
    format!("{key}{RESET_ALL_SUFFIX}")
}

/// The job key a progress key belongs to (`users_reset` -> `users`).
pub fn base_key(key: &str) -> &str {
    key.strip_suffix(RESET_ALL_SUFFIX)
        .or_else(|| key.strip_suffix(RESET_SUFFIX))
        .unwrap_or(key)
}

/// The next slice of work for a record: starts at `processed`, at most
/// `batch_size` long, never past `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchWindow {
    pub offset: u64,
    pub limit: u64,
}

impl BatchWindow {
    pub fn of(record: &ProgressRecord) -> Self {
        Self {
            offset: record.processed,
            limit: record.batch_size.min(record.remaining()),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.limit == 0
    }
}

/// Runs jobs, resets and reset-all sequences against a registry and a store.
pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    store: Arc<dyn ProgressStore>,
    reset_batch_size: u64,
    key_locks: KeyLocks,
}

type KeyLocks = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Holds one key's step lock. On drop the key's map entry is removed once
/// no other request holds or waits on it.
pub(crate) struct KeyGuard<'a> {
    key: String,
    locks: &'a KeyLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters hold a clone of the Arc, so a count of one means idle.
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

impl Orchestrator {
    pub fn new(registry: Arc<JobRegistry>, store: Arc<dyn ProgressStore>) -> Self {
        Self {
            registry,
            store,
            reset_batch_size: DEFAULT_RESET_BATCH_SIZE,
            key_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Items deleted per step of a reset or reset-all run.
    pub fn with_reset_batch_size(mut self, size: u64) -> Self {
        self.reset_batch_size = size.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ProgressStore> {
        &self.store
    }

    /// Serialize read-modify-write on one key within this process.
    async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            key: key.to_string(),
            locks: &self.key_locks,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Display name for a progress key, resolving derived reset keys to
    /// their job.
    async fn display_name(&self, key: &str) -> String {
        let suffix = if key.ends_with(RESET_ALL_SUFFIX) {
            " (reset all)"
        } else if key.ends_with(RESET_SUFFIX) {
            " (reset)"
        } else {
            ""
        };

        match self.registry.get(base_key(key)).await {
            Some(job) => format!("{}{}", job.name(), suffix),
            None => key.to_string(),
        }
    }
}

fn batch_failure(key: &str, e: CapabilityError) -> JobError {
    JobError::Batch {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

fn not_found(key: &str) -> JobError {
    JobError::NotFound {
        key: key.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted job descriptors shared by the orchestrator tests.

    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::jobs::cancel::CancelSignal;
    use crate::jobs::descriptor::{BatchOutcome, JobDescriptor};
    use crate::jobs::settings::Settings;
    use crate::store::LibSqlBackend;

    /// In-memory job whose produced items are a counter.
    pub struct FakeJob {
        pub key: String,
        pub name: String,
        pub items: AtomicU64,
        pub dependents: Vec<String>,
        pub after_complete_calls: AtomicUsize,
        pub fail_produce: StdMutex<Option<String>>,
        pub fail_after_complete: bool,
        /// Produce this many items then report cancellation.
        pub cancel_after: StdMutex<Option<u64>>,
        /// Delete batches report zero processed.
        pub stall_deletes: bool,
        pub fail_deletes: bool,
        pub batched_reset: bool,
        /// Pause before producing each item.
        pub item_delay: Option<std::time::Duration>,
    }

    impl FakeJob {
        pub fn new(key: &str, name: &str) -> Self {
            Self {
                key: key.to_string(),
                name: name.to_string(),
                items: AtomicU64::new(0),
                dependents: Vec::new(),
                after_complete_calls: AtomicUsize::new(0),
                fail_produce: StdMutex::new(None),
                fail_after_complete: false,
                cancel_after: StdMutex::new(None),
                stall_deletes: false,
                fail_deletes: false,
                batched_reset: true,
                item_delay: None,
            }
        }

        pub fn with_items(self, n: u64) -> Self {
            self.items.store(n, Ordering::SeqCst);
            self
        }

        pub fn with_dependents(mut self, deps: &[&str]) -> Self {
            self.dependents = deps.iter().map(|d| d.to_string()).collect();
            self
        }

        pub fn items(&self) -> u64 {
            self.items.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobDescriptor for FakeJob {
        fn key(&self) -> &str {
            &self.key
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn default_total(&self) -> u64 {
            10
        }

        fn default_batch_size(&self) -> u64 {
            4
        }

        fn dependents(&self) -> Vec<String> {
            self.dependents.clone()
        }

        async fn after_complete(&self, _settings: &Settings) -> Result<(), CapabilityError> {
            self.after_complete_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after_complete {
                return Err(CapabilityError::failed("cache flush failed"));
            }
            Ok(())
        }

        async fn produce(
            &self,
            _offset: u64,
            limit: u64,
            _settings: &Settings,
            cancel: &CancelSignal,
        ) -> Result<BatchOutcome, CapabilityError> {
            let failure = self.fail_produce.lock().unwrap().clone();
            if let Some(reason) = failure {
                return Err(CapabilityError::failed(reason));
            }
            let cancel_after = *self.cancel_after.lock().unwrap();
            if let Some(n) = cancel_after {
                let n = n.min(limit);
                self.items.fetch_add(n, Ordering::SeqCst);
                return Ok(BatchOutcome::cancelled(n));
            }
            let mut made = 0;
            for _ in 0..limit {
                if cancel.is_cancelled().await {
                    return Ok(BatchOutcome::cancelled(made));
                }
                if let Some(delay) = self.item_delay {
                    tokio::time::sleep(delay).await;
                }
                self.items.fetch_add(1, Ordering::SeqCst);
                made += 1;
            }
            Ok(BatchOutcome::done(made))
        }

        fn supports_batched_reset(&self) -> bool {
            self.batched_reset
        }

        async fn count_remaining(&self) -> Result<u64, CapabilityError> {
            Ok(self.items())
        }

        async fn delete_batch(
            &self,
            _offset: u64,
            limit: u64,
            _cancel: &CancelSignal,
        ) -> Result<BatchOutcome, CapabilityError> {
            if self.fail_deletes {
                return Err(CapabilityError::failed("permission denied"));
            }
            if self.stall_deletes {
                return Ok(BatchOutcome::done(0));
            }
            let current = self.items();
            let deleted = limit.min(current);
            self.items.store(current - deleted, Ordering::SeqCst);
            Ok(BatchOutcome::done(deleted))
        }

        async fn reset(&self) -> Result<(), CapabilityError> {
            self.items.store(0, Ordering::SeqCst);
            Ok(())
        }
    }

    pub async fn orchestrator(jobs: Vec<Arc<FakeJob>>) -> Orchestrator {
        let registry = Arc::new(JobRegistry::new());
        for job in jobs {
            registry.register(job).await;
        }
        let store: Arc<dyn ProgressStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Orchestrator::new(registry, store)
    }

    pub fn settings(count: u64, batch_size: u64) -> Settings {
        let mut s = Settings::new();
        s.insert("count".into(), count.into());
        s.insert("batch_size".into(), batch_size.into());
        s
    }
}
