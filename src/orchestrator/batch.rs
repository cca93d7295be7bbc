//! Starting, stepping and cancelling job runs.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::types::{
    GlobalStatus, JobStatusView, JobSummary, MessageResponse, StartJobResponse, StepResponse,
};
use super::{BatchWindow, Orchestrator, batch_failure, not_found};
use crate::error::JobError;
use crate::jobs::cancel::CancelSignal;
use crate::jobs::settings::{Settings, setting_u64};
use crate::store::{JobStatus, ProgressRecord, StartOutcome, percentage};

impl Orchestrator {
    /// Validate settings, run the `before_start` hook and take the
    /// single-flight lock for `key`.
    pub async fn start_job(&self, key: &str, raw: Settings) -> Result<StartJobResponse, JobError> {
        let job = self.registry.get(key).await.ok_or_else(|| not_found(key))?;
        let _guard = self.lock_key(key).await;

        let validated = job.validate(raw)?;

        // Checked before the hook so a refused start has no side effects.
        // `ProgressStore::start` below remains the authoritative check.
        if let Some(running) = self.store.get_running().await?
            && running.job_key != key
        {
            return Err(JobError::AlreadyRunning {
                running_job: running.job_key,
            });
        }

        job.before_start(&validated.settings)
            .await
            .map_err(|e| JobError::Hook {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let total = setting_u64(&validated.settings, "count").unwrap_or_else(|| job.default_total());
        let batch_size = setting_u64(&validated.settings, "batch_size")
            .unwrap_or_else(|| job.default_batch_size())
            .max(1);

        match self
            .store
            .start(key, total, batch_size, &validated.settings)
            .await?
        {
            StartOutcome::Started => {}
            StartOutcome::AlreadyRunning { running_job } => {
                warn!(job_key = %key, running_job = %running_job, "Start refused: another job is running");
                return Err(JobError::AlreadyRunning { running_job });
            }
        }

        info!(job_key = %key, total, batch_size, clamped = validated.clamped, "Job started");
        Ok(StartJobResponse {
            total,
            batch_size,
            settings: validated.settings,
            clamped: validated.clamped,
            message: "Job started successfully".to_string(),
        })
    }

    /// Produce one batch for a running job.
    pub async fn step_batch(&self, key: &str) -> Result<StepResponse, JobError> {
        let job = self.registry.get(key).await.ok_or_else(|| not_found(key))?;
        let _guard = self.lock_key(key).await;
        let record = self.store.get(key).await?.ok_or_else(|| not_found(key))?;

        match record.status {
            JobStatus::Cancelled => return Ok(cancelled_step(&record, record.processed)),
            // A finished run stays finished; repeated steps are no-ops.
            JobStatus::Completed => return Ok(completed_step(&record)),
            JobStatus::Running => {}
            JobStatus::Pending | JobStatus::Error => {
                return Err(JobError::NotRunning {
                    key: key.to_string(),
                });
            }
        }

        let window = BatchWindow::of(&record);
        if window.is_exhausted() {
            self.store.update_progress(key, record.total).await?;
            self.run_after_complete(key, &record.settings).await;
            return Ok(completed_step(&record));
        }

        let cancel = CancelSignal::new(key, Arc::clone(&self.store));
        let outcome = match job
            .produce(window.offset, window.limit, &record.settings, &cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = batch_failure(key, e);
                warn!(job_key = %key, offset = window.offset, error = %err, "Batch failed");
                self.store.set_error(key, &err.to_string()).await?;
                return Err(err);
            }
        };

        let new_processed = window.offset + outcome.processed.min(window.limit);
        self.store.update_progress(key, new_processed).await?;

        // A cancel that landed mid-batch is visible either through the
        // capability's report or the stored status.
        let cancelled = outcome.cancelled
            || matches!(
                self.store.get(key).await?,
                Some(ProgressRecord { status: JobStatus::Cancelled, .. })
            );
        if cancelled {
            // Release the lock if the capability stopped on its own.
            self.store.cancel(key).await?;
            info!(job_key = %key, processed = new_processed, total = record.total, "Job cancelled");
            return Ok(cancelled_step(&record, new_processed));
        }

        if new_processed >= record.total {
            self.run_after_complete(key, &record.settings).await;
            info!(job_key = %key, total = record.total, "Job completed");
            return Ok(completed_step(&record));
        }

        debug!(job_key = %key, processed = new_processed, total = record.total, "Batch processed");
        Ok(StepResponse {
            completed: false,
            cancelled: false,
            processed: new_processed,
            total: record.total,
            percentage: percentage(new_processed, record.total),
            message: format!("Processed {} of {}", new_processed, record.total),
        })
    }

    /// Mark a running job cancelled. Not serialized behind the key lock so it
    /// lands while a step is producing.
    pub async fn cancel_job(&self, key: &str) -> Result<MessageResponse, JobError> {
        let not_running = || JobError::NotRunning {
            key: key.to_string(),
        };
        match self.store.get(key).await? {
            Some(record) if record.status == JobStatus::Running => {}
            Some(_) => return Err(not_running()),
            None if self.registry.has(key).await => return Err(not_running()),
            None => return Err(not_found(key)),
        }

        if !self.store.cancel(key).await? {
            return Err(not_running());
        }
        info!(job_key = %key, "Job cancel requested");
        Ok(MessageResponse::new("Job cancelled successfully"))
    }

    /// Status of any progress key; `idle` when no record exists.
    pub async fn get_status(&self, key: &str) -> Result<JobStatusView, JobError> {
        Ok(match self.store.get(key).await? {
            Some(record) => JobStatusView::from(&record),
            None => JobStatusView::idle(key),
        })
    }

    pub async fn get_global_status(&self) -> Result<GlobalStatus, JobError> {
        let Some(record) = self.store.get_running().await? else {
            return Ok(GlobalStatus::default());
        };
        Ok(GlobalStatus {
            is_running: true,
            job_name: Some(self.display_name(&record.job_key).await),
            processed: Some(record.processed),
            total: Some(record.total),
            percentage: Some(record.percentage()),
            job_key: Some(record.job_key),
        })
    }

    /// Every registered job with its schema and current status.
    pub async fn list_jobs(&self) -> Result<Vec<JobSummary>, JobError> {
        let mut summaries = Vec::new();
        for job in self.registry.list().await {
            let status = self.get_status(job.key()).await?;
            summaries.push(JobSummary {
                key: job.key().to_string(),
                name: job.name().to_string(),
                description: job.description().to_string(),
                default_total: job.default_total(),
                default_batch_size: job.default_batch_size(),
                dependents: job.dependents(),
                settings: job.settings_schema(),
                status,
            });
        }
        Ok(summaries)
    }

    async fn run_after_complete(&self, key: &str, settings: &Settings) {
        let Some(job) = self.registry.get(key).await else {
            return;
        };
        if let Err(e) = job.after_complete(settings).await {
            warn!(job_key = %key, error = %e, "after_complete hook failed");
        }
    }
}

fn completed_step(record: &ProgressRecord) -> StepResponse {
    StepResponse {
        completed: true,
        cancelled: false,
        processed: record.total,
        total: record.total,
        percentage: 100.0,
        message: "Job completed!".to_string(),
    }
}

fn cancelled_step(record: &ProgressRecord, processed: u64) -> StepResponse {
    StepResponse {
        completed: true,
        cancelled: true,
        processed,
        total: record.total,
        percentage: percentage(processed, record.total),
        message: "Job cancelled".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use serde_json::json;

    use super::super::testing::*;
    use crate::error::JobError;
    use crate::store::JobStatus;

    #[tokio::test]
    async fn runs_to_completion_in_batches() {
        let job = Arc::new(FakeJob::new("x", "X"));
        let orch = orchestrator(vec![job.clone()]).await;

        let started = orch.start_job("x", settings(10, 4)).await.unwrap();
        assert_eq!((started.total, started.batch_size), (10, 4));

        let first = orch.step_batch("x").await.unwrap();
        assert_eq!((first.processed, first.percentage, first.completed), (4, 40.0, false));
        let second = orch.step_batch("x").await.unwrap();
        assert_eq!((second.processed, second.percentage, second.completed), (8, 80.0, false));
        let third = orch.step_batch("x").await.unwrap();
        assert_eq!((third.processed, third.percentage, third.completed), (10, 100.0, true));

        assert_eq!(job.items(), 10);
        assert_eq!(job.after_complete_calls.load(Ordering::SeqCst), 1);
        let status = orch.get_status("x").await.unwrap();
        assert_eq!(status.status, "completed");
    }

    #[tokio::test]
    async fn stepping_a_finished_job_is_idempotent() {
        let job = Arc::new(FakeJob::new("x", "X"));
        let orch = orchestrator(vec![job.clone()]).await;
        orch.start_job("x", settings(3, 5)).await.unwrap();
        assert!(orch.step_batch("x").await.unwrap().completed);

        let again = orch.step_batch("x").await.unwrap();
        assert!(again.completed);
        assert_eq!(again.processed, 3);
        assert_eq!(job.items(), 3);
        let record = orch.store().get("x").await.unwrap().unwrap();
        assert_eq!(record.processed, 3);
    }

    #[tokio::test]
    async fn second_job_is_refused_while_one_runs() {
        let x = Arc::new(FakeJob::new("x", "X"));
        let y = Arc::new(FakeJob::new("y", "Y"));
        let orch = orchestrator(vec![x, y]).await;

        orch.start_job("y", settings(10, 2)).await.unwrap();
        let err = orch.start_job("x", settings(10, 2)).await.unwrap_err();
        assert!(matches!(err, JobError::AlreadyRunning { ref running_job } if running_job == "y"));
        assert!(orch.store().get("x").await.unwrap().is_none());

        let global = orch.get_global_status().await.unwrap();
        assert!(global.is_running);
        assert_eq!(global.job_key.as_deref(), Some("y"));
        assert_eq!(global.job_name.as_deref(), Some("Y"));
    }

    #[tokio::test]
    async fn cancel_between_steps_stops_production() {
        let job = Arc::new(FakeJob::new("x", "X"));
        let orch = orchestrator(vec![job.clone()]).await;
        orch.start_job("x", settings(10, 4)).await.unwrap();
        orch.step_batch("x").await.unwrap();

        orch.cancel_job("x").await.unwrap();
        let step = orch.step_batch("x").await.unwrap();
        assert!(step.completed && step.cancelled);
        assert_eq!(step.processed, 4);
        assert_eq!(job.items(), 4);

        // Lock is free again.
        assert!(!orch.get_global_status().await.unwrap().is_running);
    }

    #[tokio::test]
    async fn partial_cancelled_batch_records_progress() {
        let job = Arc::new(FakeJob::new("x", "X"));
        *job.cancel_after.lock().unwrap() = Some(2);
        let orch = orchestrator(vec![job.clone()]).await;
        orch.start_job("x", settings(10, 4)).await.unwrap();

        let step = orch.step_batch("x").await.unwrap();
        assert!(step.cancelled);
        assert_eq!(step.processed, 2);
        assert_eq!(job.after_complete_calls.load(Ordering::SeqCst), 0);
        let record = orch.store().get("x").await.unwrap().unwrap();
        assert_eq!(record.processed, 2);
    }

    #[tokio::test]
    async fn cancel_lands_while_batch_is_producing() {
        let mut job = FakeJob::new("x", "X");
        job.item_delay = Some(Duration::from_millis(20));
        let job = Arc::new(job);
        let orch = Arc::new(orchestrator(vec![job.clone()]).await);
        orch.start_job("x", settings(10, 10)).await.unwrap();

        let stepper = Arc::clone(&orch);
        let step = tokio::spawn(async move { stepper.step_batch("x").await });
        while job.items() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The step still holds the key lock; cancel must not wait for it.
        let cancelled = tokio::time::timeout(Duration::from_millis(100), orch.cancel_job("x"))
            .await
            .expect("cancel waited on the running step")
            .unwrap();
        assert_eq!(cancelled.message, "Job cancelled successfully");

        let step = step.await.unwrap().unwrap();
        assert!(step.cancelled);
        assert!(step.processed >= 2 && step.processed < 10);
        let record = orch.store().get("x").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.processed, step.processed);
    }

    #[tokio::test]
    async fn capability_error_moves_job_to_error() {
        let job = Arc::new(FakeJob::new("x", "X"));
        *job.fail_produce.lock().unwrap() = Some("disk full".into());
        let orch = orchestrator(vec![job]).await;
        orch.start_job("x", settings(10, 4)).await.unwrap();

        let err = orch.step_batch("x").await.unwrap_err();
        assert!(matches!(err, JobError::Batch { .. }));
        let status = orch.get_status("x").await.unwrap();
        assert_eq!(status.status, "error");
        assert!(status.error_message.unwrap().contains("disk full"));

        // Terminal: further steps are refused.
        assert!(matches!(
            orch.step_batch("x").await.unwrap_err(),
            JobError::NotRunning { .. }
        ));
    }

    #[tokio::test]
    async fn after_complete_failure_is_not_fatal() {
        let mut job = FakeJob::new("x", "X");
        job.fail_after_complete = true;
        let orch = orchestrator(vec![Arc::new(job)]).await;
        orch.start_job("x", settings(2, 5)).await.unwrap();
        let step = orch.step_batch("x").await.unwrap();
        assert!(step.completed);
        let record = orch.store().get("x").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn start_validates_and_clamps() {
        let orch = orchestrator(vec![Arc::new(FakeJob::new("x", "X"))]).await;

        let err = orch
            .start_job("x", json!({"count": 5}).as_object().cloned().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert!(orch.store().get("x").await.unwrap().is_none());

        let started = orch.start_job("x", settings(50_000, 500)).await.unwrap();
        assert!(started.clamped);
        assert_eq!((started.total, started.batch_size), (10_000, 200));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let orch = orchestrator(vec![]).await;
        assert!(matches!(
            orch.start_job("nope", settings(1, 1)).await.unwrap_err(),
            JobError::NotFound { .. }
        ));
        assert!(matches!(
            orch.step_batch("nope").await.unwrap_err(),
            JobError::NotFound { .. }
        ));
        assert!(matches!(
            orch.cancel_job("nope").await.unwrap_err(),
            JobError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn cancel_requires_running_job() {
        let orch = orchestrator(vec![Arc::new(FakeJob::new("x", "X"))]).await;
        assert!(matches!(
            orch.cancel_job("x").await.unwrap_err(),
            JobError::NotRunning { .. }
        ));
        orch.start_job("x", settings(1, 1)).await.unwrap();
        orch.step_batch("x").await.unwrap();
        assert!(matches!(
            orch.cancel_job("x").await.unwrap_err(),
            JobError::NotRunning { .. }
        ));
    }

    #[tokio::test]
    async fn list_jobs_reports_idle_and_schema() {
        let orch = orchestrator(vec![
            Arc::new(FakeJob::new("b", "B")),
            Arc::new(FakeJob::new("a", "A")),
        ])
        .await;
        let jobs = orch.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].key, "b");
        assert!(jobs[0].status.is_idle());
        assert_eq!(jobs[0].settings[0].key, "count");
    }
}
