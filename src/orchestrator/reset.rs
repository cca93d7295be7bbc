//! Dependency-aware single-job resets, batched under a derived `_reset` key.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::types::{MessageResponse, ResetCheck, StartResetResponse, StepResponse};
use super::{BatchWindow, Orchestrator, batch_failure, not_found, reset_key};
use crate::error::JobError;
use crate::jobs::cancel::CancelSignal;
use crate::jobs::descriptor::JobDescriptor;
use crate::jobs::settings::Settings;
use crate::store::{JobStatus, StartOutcome, percentage};

impl Orchestrator {
    /// Whether `key` can be reset now, naming the dependents still holding data.
    pub async fn can_reset(&self, key: &str) -> Result<ResetCheck, JobError> {
        let job = self.registry.get(key).await.ok_or_else(|| not_found(key))?;
        let blocking = self.blocking_dependents(job.as_ref()).await?;
        if blocking.is_empty() {
            return Ok(ResetCheck {
                can_reset: true,
                blocking_dependents: Vec::new(),
                message: None,
            });
        }
        let message = blocked(job.as_ref(), blocking.clone()).to_string();
        Ok(ResetCheck {
            can_reset: false,
            blocking_dependents: blocking,
            message: Some(message),
        })
    }

    /// Begin resetting a job's data. Jobs without batched reset are reset
    /// synchronously and report completion immediately.
    pub async fn start_reset(&self, key: &str) -> Result<StartResetResponse, JobError> {
        let job = self.registry.get(key).await.ok_or_else(|| not_found(key))?;
        let _guard = self.lock_key(key).await;

        let blocking = self.blocking_dependents(job.as_ref()).await?;
        if !blocking.is_empty() {
            return Err(blocked(job.as_ref(), blocking));
        }

        if !job.supports_batched_reset() {
            job.reset().await.map_err(|e| batch_failure(key, e))?;
            self.store.reset(key).await?;
            info!(job_key = %key, "Job reset synchronously");
            return Ok(StartResetResponse {
                completed: true,
                total: None,
                batch_size: None,
                message: "Job reset successfully".to_string(),
            });
        }

        let total = job.count_remaining().await.map_err(|e| batch_failure(key, e))?;
        if total == 0 {
            if !matches!(self.store.get(key).await?, Some(r) if r.status == JobStatus::Running) {
                self.store.reset(key).await?;
            }
            return Ok(StartResetResponse {
                completed: true,
                total: None,
                batch_size: None,
                message: "Nothing to reset".to_string(),
            });
        }

        let progress_key = reset_key(key);
        let mut settings = Settings::new();
        settings.insert("job_key".into(), Value::from(key));
        match self
            .store
            .start(&progress_key, total, self.reset_batch_size, &settings)
            .await?
        {
            StartOutcome::Started => {}
            StartOutcome::AlreadyRunning { running_job } => {
                return Err(JobError::AlreadyRunning { running_job });
            }
        }

        info!(job_key = %key, total, batch_size = self.reset_batch_size, "Reset started");
        Ok(StartResetResponse {
            completed: false,
            total: Some(total),
            batch_size: Some(self.reset_batch_size),
            message: "Reset started successfully".to_string(),
        })
    }

    /// Delete one batch of a running reset.
    pub async fn step_reset(&self, key: &str) -> Result<StepResponse, JobError> {
        let progress_key = reset_key(key);
        let job = self.registry.get(key).await.ok_or_else(|| not_found(key))?;
        let _guard = self.lock_key(&progress_key).await;
        let record = self
            .store
            .get(&progress_key)
            .await?
            .ok_or_else(|| not_found(&progress_key))?;

        match record.status {
            JobStatus::Running => {}
            JobStatus::Cancelled => {
                return Ok(StepResponse {
                    completed: true,
                    cancelled: true,
                    processed: record.processed,
                    total: record.total,
                    percentage: record.percentage(),
                    message: "Reset cancelled".to_string(),
                });
            }
            _ => {
                return Err(JobError::NotRunning { key: progress_key });
            }
        }

        let window = BatchWindow::of(&record);
        if window.is_exhausted() {
            self.finish_reset(key).await?;
            return Ok(reset_completed(record.total));
        }

        let cancel = CancelSignal::new(progress_key.as_str(), Arc::clone(&self.store));
        let outcome = match job.delete_batch(window.offset, window.limit, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = batch_failure(key, e);
                warn!(job_key = %key, offset = window.offset, error = %err, "Reset batch failed");
                self.store.set_error(&progress_key, &err.to_string()).await?;
                return Err(err);
            }
        };

        let mut deleted = outcome.processed.min(window.limit);
        if deleted == 0 && !outcome.cancelled {
            warn!(job_key = %key, offset = window.offset, "Reset batch deleted nothing; forcing progression");
            deleted = window.limit;
        }
        let new_processed = window.offset + deleted;
        self.store.update_progress(&progress_key, new_processed).await?;

        if outcome.cancelled {
            self.store.cancel(&progress_key).await?;
            return Ok(StepResponse {
                completed: true,
                cancelled: true,
                processed: new_processed,
                total: record.total,
                percentage: percentage(new_processed, record.total),
                message: "Reset cancelled".to_string(),
            });
        }

        if new_processed >= record.total {
            self.finish_reset(key).await?;
            return Ok(reset_completed(record.total));
        }

        debug!(job_key = %key, processed = new_processed, total = record.total, "Reset batch processed");
        Ok(StepResponse {
            completed: false,
            cancelled: false,
            processed: new_processed,
            total: record.total,
            percentage: percentage(new_processed, record.total),
            message: format!("Reset {} of {}", new_processed, record.total),
        })
    }

    /// Whole-job reset in one call. Capability errors are logged; the
    /// progress records are cleared regardless.
    pub async fn reset_job_now(&self, key: &str) -> Result<MessageResponse, JobError> {
        let _guard = self.lock_key(key).await;
        if let Some(job) = self.registry.get(key).await
            && let Err(e) = job.reset().await
        {
            warn!(job_key = %key, error = %e, "Job reset failed");
        }
        self.store.reset(&reset_key(key)).await?;
        self.store.reset(key).await?;
        info!(job_key = %key, "Job reset");
        Ok(MessageResponse::new("Job reset successfully"))
    }

    async fn finish_reset(&self, key: &str) -> Result<(), JobError> {
        self.store.reset(&reset_key(key)).await?;
        self.store.reset(key).await?;
        info!(job_key = %key, "Reset completed");
        Ok(())
    }

    /// Names of dependents that still hold data.
    async fn blocking_dependents(&self, job: &dyn JobDescriptor) -> Result<Vec<String>, JobError> {
        let mut blocking = Vec::new();
        for dep_key in job.dependents() {
            let Some(dep) = self.registry.get(&dep_key).await else {
                continue;
            };
            let remaining = dep
                .count_remaining()
                .await
                .map_err(|e| batch_failure(&dep_key, e))?;
            if remaining > 0 {
                blocking.push(dep.name().to_string());
            }
        }
        Ok(blocking)
    }
}

fn blocked(job: &dyn JobDescriptor, blocking: Vec<String>) -> JobError {
    JobError::BlockedByDependents {
        key: job.key().to_string(),
        name: job.name().to_string(),
        blocking,
    }
}

fn reset_completed(total: u64) -> StepResponse {
    StepResponse {
        completed: true,
        cancelled: false,
        processed: total,
        total,
        percentage: 100.0,
        message: "Reset completed!".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testing::*;
    use crate::error::JobError;

    #[tokio::test]
    async fn reset_is_blocked_by_dependents_with_data() {
        let users = Arc::new(FakeJob::new("users", "Users").with_items(5).with_dependents(&["subs"]));
        let subs = Arc::new(FakeJob::new("subs", "Subscriptions").with_items(3));
        let orch = orchestrator(vec![users, subs.clone()]).await;

        let check = orch.can_reset("users").await.unwrap();
        assert!(!check.can_reset);
        assert_eq!(check.blocking_dependents, vec!["Subscriptions"]);
        assert_eq!(
            check.message.as_deref(),
            Some("Cannot reset Users until Subscriptions reset first.")
        );

        let err = orch.start_reset("users").await.unwrap_err();
        assert!(matches!(err, JobError::BlockedByDependents { ref blocking, .. } if blocking == &vec!["Subscriptions".to_string()]));

        subs.items.store(0, std::sync::atomic::Ordering::SeqCst);
        assert!(orch.can_reset("users").await.unwrap().can_reset);
    }

    #[tokio::test]
    async fn batched_reset_deletes_and_clears_records() {
        let job = Arc::new(FakeJob::new("x", "X"));
        let orch = orchestrator(vec![job.clone()]).await.with_reset_batch_size(4);

        orch.start_job("x", settings(10, 5)).await.unwrap();
        orch.step_batch("x").await.unwrap();
        orch.step_batch("x").await.unwrap();
        assert_eq!(job.items(), 10);

        let started = orch.start_reset("x").await.unwrap();
        assert!(!started.completed);
        assert_eq!((started.total, started.batch_size), (Some(10), Some(4)));

        let steps: Vec<(u64, bool)> = {
            let mut out = Vec::new();
            loop {
                let step = orch.step_reset("x").await.unwrap();
                out.push((step.processed, step.completed));
                if step.completed {
                    break;
                }
            }
            out
        };
        assert_eq!(steps, vec![(4, false), (8, false), (10, true)]);
        assert_eq!(job.items(), 0);
        assert!(orch.store().get("x").await.unwrap().is_none());
        assert!(orch.store().get("x_reset").await.unwrap().is_none());
        assert!(orch.get_status("x").await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn nothing_to_reset_completes_immediately() {
        let orch = orchestrator(vec![Arc::new(FakeJob::new("x", "X"))]).await;
        let started = orch.start_reset("x").await.unwrap();
        assert!(started.completed);
        assert_eq!(started.message, "Nothing to reset");
        assert!(orch.store().get("x_reset").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unbatched_job_resets_synchronously() {
        let mut job = FakeJob::new("x", "X").with_items(7);
        job.batched_reset = false;
        let job = Arc::new(job);
        let orch = orchestrator(vec![job.clone()]).await;

        let started = orch.start_reset("x").await.unwrap();
        assert!(started.completed);
        assert_eq!(started.message, "Job reset successfully");
        assert_eq!(job.items(), 0);
    }

    #[tokio::test]
    async fn reset_holds_the_single_flight_lock() {
        let x = Arc::new(FakeJob::new("x", "X").with_items(3));
        let y = Arc::new(FakeJob::new("y", "Y"));
        let orch = orchestrator(vec![x, y]).await;

        orch.start_reset("x").await.unwrap();
        let err = orch.start_job("y", settings(5, 5)).await.unwrap_err();
        assert!(matches!(err, JobError::AlreadyRunning { ref running_job } if running_job == "x_reset"));

        let global = orch.get_global_status().await.unwrap();
        assert_eq!(global.job_name.as_deref(), Some("X (reset)"));
    }

    #[tokio::test]
    async fn stalled_reset_still_terminates() {
        let mut job = FakeJob::new("x", "X").with_items(6);
        job.stall_deletes = true;
        let orch = orchestrator(vec![Arc::new(job)]).await.with_reset_batch_size(4);

        orch.start_reset("x").await.unwrap();
        assert!(!orch.step_reset("x").await.unwrap().completed);
        assert!(orch.step_reset("x").await.unwrap().completed);
    }

    #[tokio::test]
    async fn cancelled_reset_reports_cancelled() {
        let job = Arc::new(FakeJob::new("x", "X").with_items(9));
        let orch = orchestrator(vec![job]).await.with_reset_batch_size(4);
        orch.start_reset("x").await.unwrap();
        orch.step_reset("x").await.unwrap();
        orch.cancel_job("x_reset").await.unwrap();

        let step = orch.step_reset("x").await.unwrap();
        assert!(step.cancelled);
        assert_eq!(step.processed, 4);
    }

    #[tokio::test]
    async fn reset_job_now_clears_data_and_record() {
        let job = Arc::new(FakeJob::new("x", "X"));
        let orch = orchestrator(vec![job.clone()]).await;
        orch.start_job("x", settings(3, 3)).await.unwrap();
        orch.step_batch("x").await.unwrap();

        orch.reset_job_now("x").await.unwrap();
        assert_eq!(job.items(), 0);
        assert!(orch.store().get("x").await.unwrap().is_none());
    }
}
