//! Client-side polling loops for job runs, resets and reset-all runs.
//!
//! Each loop issues one step request, applies the result, and schedules the
//! next step after a short delay until the server reports completion or
//! cancellation. Only one loop runs per progress key. A stop request is
//! raised before the cancel call goes out, so no further step is scheduled
//! while it is pending; the loop only reports `Cancelled` once the server
//! has accepted the cancel, and resumes stepping if it refused.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::api::SeederApi;
use super::global_poller::{LockState, spawn_global_poller};
use crate::config::SeederConfig;
use crate::error::ClientError;
use crate::jobs::settings::Settings;
use crate::orchestrator::{StepResponse, reset_key};

/// Loop key used for reset-all runs.
pub const RESET_ALL_LOOP: &str = "reset_all";

const EVENT_CAPACITY: usize = 256;

/// How a loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Failed(String),
    /// A reset refused because dependents still hold data.
    Blocked {
        blocking: Vec<String>,
        message: String,
    },
}

/// Everything a front end needs to render.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Progress {
        key: String,
        status: String,
        processed: u64,
        total: u64,
        percentage: f64,
        message: String,
    },
    Finished {
        key: String,
        outcome: RunOutcome,
    },
    LockChanged(LockState),
}

/// Where a loop's stop request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopState {
    Idle,
    /// Cancel call in flight.
    Requested,
    /// Server accepted the cancel.
    Confirmed,
}

type StopReceiver = watch::Receiver<StopState>;

/// Whether the loop should end as cancelled. Waits out a pending request.
async fn stop_confirmed(stop: &mut StopReceiver) -> bool {
    match stop.wait_for(|state| *state != StopState::Requested).await {
        Ok(state) => *state == StopState::Confirmed,
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Job,
    Reset,
}

impl LoopKind {
    fn progress_key(self, key: &str) -> String {
        match self {
            Self::Job => key.to_string(),
            Self::Reset => reset_key(key),
        }
    }
}

/// Drives jobs to completion through a [`SeederApi`].
pub struct Controller {
    api: Arc<dyn SeederApi>,
    step_delay: Duration,
    reset_all_step_delay: Duration,
    global_poll_interval: Duration,
    events: broadcast::Sender<ControllerEvent>,
    /// Stop channels of the loops currently running, by progress key.
    active: Mutex<HashMap<String, Arc<watch::Sender<StopState>>>>,
}

impl Controller {
    pub fn new(api: Arc<dyn SeederApi>, config: &SeederConfig) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            api,
            step_delay: config.step_delay,
            reset_all_step_delay: config.reset_all_step_delay,
            global_poll_interval: config.global_poll_interval,
            events,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Start the lock poller publishing on this controller's event channel.
    pub fn spawn_global_poller(&self, job_keys: Vec<String>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        spawn_global_poller(
            Arc::clone(&self.api),
            job_keys,
            self.global_poll_interval,
            self.events.clone(),
        )
    }

    // ── Jobs ────────────────────────────────────────────────────────

    /// Start a job and poll it until it finishes.
    pub async fn run_job(&self, key: &str, settings: Settings) -> Result<RunOutcome, ClientError> {
        let stop = self.claim(key).await?;
        let started = match self.api.start_job(key, settings).await {
            Ok(started) => started,
            Err(e) => {
                self.release(key).await;
                return Err(e);
            }
        };
        info!(job_key = %key, total = started.total, batch_size = started.batch_size, "Job started");
        self.emit(ControllerEvent::Progress {
            key: key.to_string(),
            status: "running".to_string(),
            processed: 0,
            total: started.total,
            percentage: 0.0,
            message: started.message,
        });
        Ok(self.poll(LoopKind::Job, key, stop).await)
    }

    /// Re-enter the loop for a job the server still reports as running.
    /// Returns `None` when the job is not running.
    pub async fn resume(&self, key: &str) -> Result<Option<RunOutcome>, ClientError> {
        let status = self.api.get_status(key).await?;
        if status.status != "running" {
            return Ok(None);
        }
        let stop = self.claim(key).await?;
        debug!(job_key = %key, processed = status.processed, "Resuming job loop");
        self.emit(ControllerEvent::Progress {
            key: key.to_string(),
            status: status.status,
            processed: status.processed,
            total: status.total,
            percentage: status.percentage,
            message: format!("Processed {} of {}", status.processed, status.total),
        });
        Ok(Some(self.poll(LoopKind::Job, key, stop).await))
    }

    /// Stop a job's loop and ask the server to cancel it.
    pub async fn stop(&self, key: &str) -> Result<(), ClientError> {
        self.request_stop(key, self.api.cancel_job(key)).await
    }

    // ── Resets ──────────────────────────────────────────────────────

    /// Reset a job's data in batches, if its dependents allow it.
    pub async fn run_reset(&self, key: &str) -> Result<RunOutcome, ClientError> {
        let progress_key = reset_key(key);

        let check = self.api.can_reset(key).await?;
        if !check.can_reset {
            let outcome = RunOutcome::Blocked {
                message: check.message.unwrap_or_default(),
                blocking: check.blocking_dependents,
            };
            self.emit(ControllerEvent::Finished {
                key: progress_key,
                outcome: outcome.clone(),
            });
            return Ok(outcome);
        }

        let stop = self.claim(&progress_key).await?;
        let started = match self.api.start_reset(key).await {
            Ok(started) => started,
            Err(e) => {
                self.release(&progress_key).await;
                return Err(e);
            }
        };

        if started.completed {
            self.release(&progress_key).await;
            self.emit(ControllerEvent::Finished {
                key: progress_key,
                outcome: RunOutcome::Completed,
            });
            return Ok(RunOutcome::Completed);
        }

        self.emit(ControllerEvent::Progress {
            key: progress_key,
            status: "running".to_string(),
            processed: 0,
            total: started.total.unwrap_or(0),
            percentage: 0.0,
            message: started.message,
        });
        Ok(self.poll(LoopKind::Reset, key, stop).await)
    }

    pub async fn stop_reset(&self, key: &str) -> Result<(), ClientError> {
        let progress_key = reset_key(key);
        self.request_stop(&progress_key, self.api.cancel_job(&progress_key))
            .await
    }

    /// Reset every job with data, one job at a time.
    pub async fn run_reset_all(&self) -> Result<RunOutcome, ClientError> {
        let stop = self.claim(RESET_ALL_LOOP).await?;
        let started = match self.api.start_reset_all().await {
            Ok(started) => started,
            Err(e) => {
                self.release(RESET_ALL_LOOP).await;
                return Err(e);
            }
        };

        let outcome = if started.completed {
            RunOutcome::Completed
        } else {
            info!(total_jobs = started.total_jobs, "Reset-all started");
            self.poll_reset_all(stop).await
        };

        self.release(RESET_ALL_LOOP).await;
        self.emit(ControllerEvent::Finished {
            key: RESET_ALL_LOOP.to_string(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    pub async fn stop_reset_all(&self) -> Result<(), ClientError> {
        self.request_stop(RESET_ALL_LOOP, self.api.cancel_reset_all())
            .await
    }

    /// Hold the loop for `key` while `cancel` runs. A refused cancel lets the
    /// loop carry on and is reported as a `running` progress event.
    async fn request_stop<T>(
        &self,
        key: &str,
        cancel: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<(), ClientError> {
        let stop = self.active.lock().await.get(key).cloned();
        if let Some(stop) = &stop {
            stop.send_replace(StopState::Requested);
        }

        match cancel.await {
            Ok(_) => {
                if let Some(stop) = stop {
                    stop.send_replace(StopState::Confirmed);
                }
                info!(job_key = %key, "Stop confirmed");
                Ok(())
            }
            Err(e) => {
                if let Some(stop) = stop {
                    stop.send_replace(StopState::Idle);
                }
                warn!(job_key = %key, error = %e, "Cancel refused; run continues");
                let (processed, total, percentage) = match self.api.get_status(key).await {
                    Ok(status) => (status.processed, status.total, status.percentage),
                    Err(_) => (0, 0, 0.0),
                };
                self.emit(ControllerEvent::Progress {
                    key: key.to_string(),
                    status: "running".to_string(),
                    processed,
                    total,
                    percentage,
                    message: format!("Cancel failed, the run continues on the server: {e}"),
                });
                Err(e)
            }
        }
    }

    // ── Loops ───────────────────────────────────────────────────────

    async fn poll(&self, kind: LoopKind, key: &str, mut stop: StopReceiver) -> RunOutcome {
        let progress_key = kind.progress_key(key);

        let outcome = loop {
            let step = match kind {
                LoopKind::Job => self.api.step_batch(key).await,
                LoopKind::Reset => self.api.step_reset(key).await,
            };
            let step = match step {
                Ok(step) => step,
                Err(e) => break self.failure(&progress_key, e).await,
            };

            self.emit(progress_event(&progress_key, &step));
            if step.cancelled {
                break RunOutcome::Cancelled;
            }
            if step.completed {
                break RunOutcome::Completed;
            }
            if stop_confirmed(&mut stop).await {
                break RunOutcome::Cancelled;
            }

            tokio::time::sleep(self.step_delay).await;
            if stop_confirmed(&mut stop).await {
                break RunOutcome::Cancelled;
            }
        };

        self.release(&progress_key).await;
        info!(job_key = %progress_key, outcome = ?outcome, "Loop finished");
        self.emit(ControllerEvent::Finished {
            key: progress_key,
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn poll_reset_all(&self, mut stop: StopReceiver) -> RunOutcome {
        loop {
            let step = match self.api.step_reset_all().await {
                Ok(step) => step,
                Err(e) => {
                    warn!(error = %e, "Reset-all step failed");
                    return RunOutcome::Failed(e.to_string());
                }
            };

            self.emit(ControllerEvent::Progress {
                key: RESET_ALL_LOOP.to_string(),
                status: if step.completed { "completed" } else { "running" }.to_string(),
                processed: step.job_processed.unwrap_or(0),
                total: step.job_total.unwrap_or(0),
                percentage: step.job_percentage.unwrap_or(0.0),
                message: step.message,
            });
            // A cancelled queue steps as "completed", so the stop wins.
            if stop_confirmed(&mut stop).await {
                return RunOutcome::Cancelled;
            }
            if step.completed {
                return RunOutcome::Completed;
            }

            tokio::time::sleep(self.reset_all_step_delay).await;
            if stop_confirmed(&mut stop).await {
                return RunOutcome::Cancelled;
            }
        }
    }

    /// Surface a failed step with the stored error message when there is one.
    async fn failure(&self, progress_key: &str, e: ClientError) -> RunOutcome {
        warn!(job_key = %progress_key, error = %e, "Step failed");
        let stored = match self.api.get_status(progress_key).await {
            Ok(status) if status.status == "error" => {
                self.emit(ControllerEvent::Progress {
                    key: progress_key.to_string(),
                    status: status.status,
                    processed: status.processed,
                    total: status.total,
                    percentage: status.percentage,
                    message: status.error_message.clone().unwrap_or_default(),
                });
                status.error_message
            }
            _ => None,
        };
        RunOutcome::Failed(stored.unwrap_or_else(|| e.to_string()))
    }

    // ── Loop bookkeeping ────────────────────────────────────────────

    /// Register a loop for `key`, refusing a second concurrent one.
    async fn claim(&self, key: &str) -> Result<StopReceiver, ClientError> {
        let mut active = self.active.lock().await;
        if active.contains_key(key) {
            return Err(ClientError::AlreadyPolling {
                key: key.to_string(),
            });
        }
        let (tx, rx) = watch::channel(StopState::Idle);
        active.insert(key.to_string(), Arc::new(tx));
        Ok(rx)
    }

    async fn release(&self, key: &str) {
        self.active.lock().await.remove(key);
    }

    fn emit(&self, event: ControllerEvent) {
        // Send fails only when nobody is subscribed.
        let _ = self.events.send(event);
    }
}

fn progress_event(key: &str, step: &StepResponse) -> ControllerEvent {
    let status = if step.cancelled {
        "cancelled"
    } else if step.completed {
        "completed"
    } else {
        "running"
    };
    ControllerEvent::Progress {
        key: key.to_string(),
        status: status.to_string(),
        processed: step.processed,
        total: step.total,
        percentage: step.percentage,
        message: step.message.clone(),
    }
}
