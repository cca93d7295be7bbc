//! Job registry for managing available job types.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::jobs::descriptor::JobDescriptor;

/// Registry of job descriptors, kept in registration order.
pub struct JobRegistry {
    jobs: RwLock<Vec<Arc<dyn JobDescriptor>>>,
}

impl JobRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(Vec::new()),
        }
    }

    /// Register a job. Returns `false` (and registers nothing) for an empty
    /// key. Re-registering a key replaces the descriptor in place.
    pub async fn register(&self, job: Arc<dyn JobDescriptor>) -> bool {
        let key = job.key().to_string();
        if key.trim().is_empty() {
            tracing::warn!(name = %job.name(), "Rejected job registration: empty key");
            return false;
        }

        let mut jobs = self.jobs.write().await;
        if let Some(slot) = jobs.iter_mut().find(|j| j.key() == key) {
            *slot = job;
            tracing::debug!("Replaced job: {}", key);
        } else {
            jobs.push(job);
            tracing::debug!("Registered job: {}", key);
        }
        true
    }

    /// Unregister a job.
    pub async fn unregister(&self, key: &str) -> Option<Arc<dyn JobDescriptor>> {
        let mut jobs = self.jobs.write().await;
        let index = jobs.iter().position(|j| j.key() == key)?;
        Some(jobs.remove(index))
    }

    /// Get a job by key.
    pub async fn get(&self, key: &str) -> Option<Arc<dyn JobDescriptor>> {
        self.jobs
            .read()
            .await
            .iter()
            .find(|j| j.key() == key)
            .cloned()
    }

    /// Check if a job exists.
    pub async fn has(&self, key: &str) -> bool {
        self.jobs.read().await.iter().any(|j| j.key() == key)
    }

    /// All jobs in registration order.
    pub async fn list(&self) -> Vec<Arc<dyn JobDescriptor>> {
        self.jobs.read().await.clone()
    }

    /// Get the number of registered jobs.
    pub fn count(&self) -> usize {
        self.jobs.try_read().map(|j| j.len()).unwrap_or(0)
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
