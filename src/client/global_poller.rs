//! Fixed-interval poller that mirrors the single-flight lock.
//!
//! Independent of any per-job loop, it asks the server which job (if any)
//! is running and publishes a [`LockState`] whenever that changes, so a
//! front end can disable every other job's start control.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::api::SeederApi;
use super::controller::ControllerEvent;
use crate::orchestrator::{GlobalStatus, base_key};

/// Which job holds the lock and which jobs it blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockState {
    /// `(progress key, display name)` of the running job.
    pub running: Option<(String, String)>,
    /// Jobs whose start controls should be disabled.
    pub locked_jobs: Vec<String>,
}

impl LockState {
    pub fn from_status(status: &GlobalStatus, job_keys: &[String]) -> Self {
        let Some(running_key) = status.job_key.as_ref().filter(|_| status.is_running) else {
            return Self::default();
        };
        let owner = base_key(running_key);
        let name = status
            .job_name
            .clone()
            .unwrap_or_else(|| running_key.clone());

        Self {
            running: Some((running_key.clone(), name)),
            locked_jobs: job_keys
                .iter()
                .filter(|k| k.as_str() != owner)
                .cloned()
                .collect(),
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locked_jobs.iter().any(|k| k == key)
    }

    /// Message shown on locked jobs.
    pub fn lock_message(&self) -> Option<String> {
        self.running
            .as_ref()
            .map(|(_, name)| format!("Another job ({name}) is currently running."))
    }
}

/// Spawn the lock poller.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_global_poller(
    api: Arc<dyn SeederApi>,
    job_keys: Vec<String>,
    interval: Duration,
    events: broadcast::Sender<ControllerEvent>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Global status poller started");
        let mut tick = tokio::time::interval(interval);
        let mut last: Option<LockState> = None;

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Global status poller shutting down");
                return;
            }

            let status = match api.get_global_status().await {
                Ok(status) => status,
                Err(e) => {
                    warn!(error = %e, "Global status poll failed");
                    continue;
                }
            };

            let state = LockState::from_status(&status, &job_keys);
            if last.as_ref() != Some(&state) {
                debug!(running = ?state.running, "Lock state changed");
                // Send fails only when nobody is subscribed.
                let _ = events.send(ControllerEvent::LockChanged(state.clone()));
                last = Some(state);
            }
        }
    });

    (handle, shutdown_flag)
}
