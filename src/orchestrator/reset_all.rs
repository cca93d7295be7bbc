//! Sequential reset of every job with outstanding data.
//!
//! A persisted worklist (`ResetAllQueue`) holds the jobs to reset and a
//! cursor. Each `step_reset_all` call advances the current job by one delete
//! batch under a derived `_reset_all` progress key, or moves the cursor on.

use serde_json::Value;
use tracing::{info, warn};

use super::types::{MessageResponse, ResetAllStep, StartResetAllResponse};
use super::{BatchWindow, Orchestrator, RESET_ALL_LOCK, not_found, reset_all_key};
use crate::error::JobError;
use crate::jobs::cancel::CancelSignal;
use crate::jobs::settings::Settings;
use crate::store::{JobStatus, ResetAllEntry, ResetAllQueue, StartOutcome, percentage};

const ALL_RESET_MESSAGE: &str = "All jobs reset successfully";

impl Orchestrator {
    /// Build and persist the worklist of jobs with data to delete.
    pub async fn start_reset_all(&self) -> Result<StartResetAllResponse, JobError> {
        let _guard = self.lock_key(RESET_ALL_LOCK).await;

        if let Some(running) = self.store.get_running().await? {
            return Err(JobError::AlreadyRunning {
                running_job: running.job_key,
            });
        }

        let mut entries = Vec::new();
        for job in self.registry.list().await {
            if !job.supports_batched_reset() {
                continue;
            }
            match job.count_remaining().await {
                Ok(0) => {}
                Ok(item_count) => entries.push(ResetAllEntry {
                    job_key: job.key().to_string(),
                    display_name: job.name().to_string(),
                    item_count,
                }),
                Err(e) => {
                    warn!(job_key = %job.key(), error = %e, "Could not count items; leaving job out of reset-all");
                }
            }
        }

        let queue = ResetAllQueue::new(entries);
        if queue.is_empty() {
            return Ok(StartResetAllResponse {
                completed: true,
                total_jobs: 0,
                jobs: Vec::new(),
                message: "Nothing to reset".to_string(),
            });
        }

        self.store.save_reset_queue(&queue).await?;
        info!(total_jobs = queue.len(), "Reset-all started");

        Ok(StartResetAllResponse {
            completed: false,
            total_jobs: queue.len(),
            message: format!("Resetting {} jobs", queue.len()),
            jobs: queue.entries,
        })
    }

    /// Advance the reset-all run by one unit of work.
    pub async fn step_reset_all(&self) -> Result<ResetAllStep, JobError> {
        let _guard = self.lock_key(RESET_ALL_LOCK).await;

        let Some(queue) = self.store.load_reset_queue().await? else {
            return Ok(ResetAllStep::finished("No reset-all in progress"));
        };
        let Some(entry) = queue.current().cloned() else {
            return self.finish_reset_all().await;
        };
        let index = queue.current_index;
        let total_jobs = queue.len();

        let Some(job) = self.registry.get(&entry.job_key).await else {
            warn!(job_key = %entry.job_key, "Job no longer registered; skipping");
            self.store.set_reset_cursor(index + 1).await?;
            return Ok(ResetAllStep {
                completed: false,
                current_job: Some(index + 1),
                total_jobs: Some(total_jobs),
                job_name: Some(entry.display_name.clone()),
                message: format!("Skipping {} (job not found)", entry.display_name),
                ..Default::default()
            });
        };

        let progress_key = reset_all_key(&entry.job_key);
        let record = match self.store.get(&progress_key).await? {
            Some(record) => record,
            None => {
                let mut settings = Settings::new();
                settings.insert("job_key".into(), Value::from(entry.job_key.as_str()));
                if let StartOutcome::AlreadyRunning { running_job } = self
                    .store
                    .start(&progress_key, entry.item_count, self.reset_batch_size, &settings)
                    .await?
                {
                    return Err(JobError::AlreadyRunning { running_job });
                }
                self.store
                    .get(&progress_key)
                    .await?
                    .ok_or_else(|| not_found(&progress_key))?
            }
        };

        // Cancelled through `cancel_job`: the running slot is free, stop deleting.
        if record.status == JobStatus::Cancelled {
            info!(job_key = %entry.job_key, processed = record.processed, "Reset-all slice cancelled; skipping job");
            self.store.reset(&progress_key).await?;
            self.store.set_reset_cursor(index + 1).await?;
            return Ok(ResetAllStep {
                completed: false,
                current_job: Some(index + 1),
                total_jobs: Some(total_jobs),
                job_name: Some(entry.display_name.clone()),
                message: format!("Skipping {} (cancelled)", entry.display_name),
                ..Default::default()
            });
        }

        let window = BatchWindow::of(&record);
        if window.is_exhausted() {
            self.store.reset(&progress_key).await?;
            self.store.reset(&entry.job_key).await?;
            info!(job_key = %entry.job_key, "Reset-all finished job");

            let next = index + 1;
            self.store.set_reset_cursor(next).await?;
            let Some(next_entry) = queue.entries.get(next) else {
                return self.finish_reset_all().await;
            };
            return Ok(ResetAllStep {
                completed: false,
                current_job: Some(next + 1),
                total_jobs: Some(total_jobs),
                job_name: Some(next_entry.display_name.clone()),
                message: format!("Starting reset of {}", next_entry.display_name),
                ..Default::default()
            });
        }

        let cancel = CancelSignal::never(progress_key.as_str());
        let outcome = match job.delete_batch(window.offset, window.limit, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job_key = %entry.job_key, error = %e, "Reset-all batch failed; skipping job");
                self.store.reset(&progress_key).await?;
                self.store.set_reset_cursor(index + 1).await?;
                return Ok(ResetAllStep {
                    completed: false,
                    current_job: Some(index + 1),
                    total_jobs: Some(total_jobs),
                    job_name: Some(entry.display_name.clone()),
                    message: format!("Error resetting {}, skipping...", entry.display_name),
                    ..Default::default()
                });
            }
        };

        let mut deleted = outcome.processed.min(window.limit);
        if deleted == 0 {
            warn!(
                job_key = %entry.job_key,
                offset = window.offset,
                "Reset-all batch deleted nothing; forcing progression"
            );
            deleted = window.limit;
        }
        let new_processed = window.offset + deleted;
        self.store.update_progress(&progress_key, new_processed).await?;

        let job_percentage = percentage(new_processed, record.total);
        Ok(ResetAllStep {
            completed: false,
            current_job: Some(index + 1),
            total_jobs: Some(total_jobs),
            job_name: Some(entry.display_name.clone()),
            job_processed: Some(new_processed),
            job_total: Some(record.total),
            job_percentage: Some(job_percentage),
            message: format!(
                "Resetting {}: {} of {} ({}%)",
                entry.display_name, new_processed, record.total, job_percentage
            ),
        })
    }

    /// Abandon a reset-all run: drop the current job's derived record and
    /// the worklist. Data already deleted stays deleted.
    pub async fn cancel_reset_all(&self) -> Result<MessageResponse, JobError> {
        let _guard = self.lock_key(RESET_ALL_LOCK).await;
        let Some(queue) = self.store.load_reset_queue().await? else {
            return Ok(MessageResponse::new("No reset-all in progress"));
        };
        if let Some(entry) = queue.current() {
            self.store.reset(&reset_all_key(&entry.job_key)).await?;
        }
        self.store.clear_reset_queue().await?;
        info!(current_job = queue.current_index + 1, total_jobs = queue.len(), "Reset-all cancelled");
        Ok(MessageResponse::new("Reset all cancelled"))
    }

    /// Reset every job in one call. Capability errors are logged; all
    /// progress records and any reset-all worklist are cleared regardless.
    pub async fn reset_all_now(&self) -> Result<MessageResponse, JobError> {
        let _guard = self.lock_key(RESET_ALL_LOCK).await;
        for job in self.registry.list().await {
            if let Err(e) = job.reset().await {
                warn!(job_key = %job.key(), error = %e, "Job reset failed");
            }
        }
        self.store.reset_all().await?;
        self.store.clear_reset_queue().await?;
        info!("All jobs reset");
        Ok(MessageResponse::new(ALL_RESET_MESSAGE))
    }

    async fn finish_reset_all(&self) -> Result<ResetAllStep, JobError> {
        self.store.clear_reset_queue().await?;
        self.store.reset_all().await?;
        info!("Reset-all completed");
        Ok(ResetAllStep::finished(ALL_RESET_MESSAGE))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testing::*;
    use crate::error::JobError;

    async fn drive_to_completion(orch: &super::Orchestrator, max_calls: usize) -> usize {
        for call in 1..=max_calls {
            if orch.step_reset_all().await.unwrap().completed {
                return call;
            }
        }
        panic!("reset-all did not complete within {max_calls} calls");
    }

    #[tokio::test]
    async fn resets_every_job_with_data_in_order() {
        let a = Arc::new(FakeJob::new("a", "A").with_items(5));
        let b = Arc::new(FakeJob::new("b", "B"));
        let c = Arc::new(FakeJob::new("c", "C").with_items(3));
        let orch = orchestrator(vec![a.clone(), b, c.clone()]).await.with_reset_batch_size(2);

        let started = orch.start_reset_all().await.unwrap();
        assert!(!started.completed);
        assert_eq!(started.total_jobs, 2);
        assert_eq!(started.jobs[0].job_key, "a");
        assert_eq!(started.jobs[1].item_count, 3);

        let first = orch.step_reset_all().await.unwrap();
        assert_eq!(first.current_job, Some(1));
        assert_eq!(first.job_name.as_deref(), Some("A"));
        assert_eq!((first.job_processed, first.job_total), (Some(2), Some(5)));
        assert_eq!(first.job_percentage, Some(40.0));

        drive_to_completion(&orch, 20).await;
        assert_eq!(a.items(), 0);
        assert_eq!(c.items(), 0);
        assert!(orch.store().load_reset_queue().await.unwrap().is_none());
        assert!(orch.store().list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stalled_deletes_still_terminate() {
        let mut jobs = Vec::new();
        for (key, items) in [("a", 7), ("b", 1), ("c", 4)] {
            let mut job = FakeJob::new(key, key).with_items(items);
            job.stall_deletes = true;
            jobs.push(Arc::new(job));
        }
        let orch = orchestrator(jobs).await.with_reset_batch_size(3);
        orch.start_reset_all().await.unwrap();

        // ceil(c / batch) delete calls plus one advance per job.
        let calls = drive_to_completion(&orch, 3 + 1 + 2 + 3).await;
        assert!(calls <= 9);
    }

    #[tokio::test]
    async fn failing_job_is_skipped() {
        let mut bad = FakeJob::new("bad", "Bad").with_items(4);
        bad.fail_deletes = true;
        let good = Arc::new(FakeJob::new("good", "Good").with_items(2));
        let orch = orchestrator(vec![Arc::new(bad), good.clone()]).await;
        orch.start_reset_all().await.unwrap();

        let step = orch.step_reset_all().await.unwrap();
        assert!(!step.completed);
        assert_eq!(step.message, "Error resetting Bad, skipping...");
        assert!(orch.store().get("bad_reset_all").await.unwrap().is_none());

        drive_to_completion(&orch, 10).await;
        assert_eq!(good.items(), 0);
    }

    #[tokio::test]
    async fn cancelled_slice_is_skipped_without_more_deletes() {
        let a = Arc::new(FakeJob::new("a", "A").with_items(7));
        let b = Arc::new(FakeJob::new("b", "B").with_items(4));
        let orch = orchestrator(vec![a.clone(), b.clone()]).await.with_reset_batch_size(3);
        orch.start_reset_all().await.unwrap();

        orch.step_reset_all().await.unwrap();
        assert_eq!(a.items(), 4);
        orch.cancel_job("a_reset_all").await.unwrap();
        assert!(orch.store().get_running().await.unwrap().is_none());

        let step = orch.step_reset_all().await.unwrap();
        assert_eq!(step.message, "Skipping A (cancelled)");
        assert_eq!(a.items(), 4);
        assert!(orch.store().get("a_reset_all").await.unwrap().is_none());

        drive_to_completion(&orch, 10).await;
        assert_eq!((a.items(), b.items()), (4, 0));
    }

    #[tokio::test]
    async fn unregistered_job_is_skipped() {
        let gone = Arc::new(FakeJob::new("gone", "Gone").with_items(2));
        let orch = orchestrator(vec![gone]).await;
        orch.start_reset_all().await.unwrap();
        orch.registry().unregister("gone").await;

        let step = orch.step_reset_all().await.unwrap();
        assert_eq!(step.message, "Skipping Gone (job not found)");
        assert!(orch.step_reset_all().await.unwrap().completed);
    }

    #[tokio::test]
    async fn nothing_to_reset() {
        let orch = orchestrator(vec![Arc::new(FakeJob::new("a", "A"))]).await;
        let started = orch.start_reset_all().await.unwrap();
        assert!(started.completed);
        assert_eq!(started.total_jobs, 0);
    }

    #[tokio::test]
    async fn refused_while_a_job_runs() {
        let orch = orchestrator(vec![Arc::new(FakeJob::new("a", "A").with_items(1))]).await;
        orch.start_job("a", settings(5, 1)).await.unwrap();
        assert!(matches!(
            orch.start_reset_all().await.unwrap_err(),
            JobError::AlreadyRunning { .. }
        ));
    }

    #[tokio::test]
    async fn cancel_drops_worklist_and_keeps_other_records() {
        let a = Arc::new(FakeJob::new("a", "A").with_items(10));
        let b = Arc::new(FakeJob::new("b", "B").with_items(10));
        let orch = orchestrator(vec![a, b.clone()]).await.with_reset_batch_size(3);

        // A finished run of b leaves a record behind.
        b.items.store(0, std::sync::atomic::Ordering::SeqCst);
        orch.start_job("b", settings(2, 2)).await.unwrap();
        orch.step_batch("b").await.unwrap();

        orch.start_reset_all().await.unwrap();
        orch.step_reset_all().await.unwrap();
        orch.cancel_reset_all().await.unwrap();

        assert!(orch.store().load_reset_queue().await.unwrap().is_none());
        assert!(orch.store().get("a_reset_all").await.unwrap().is_none());
        let step = orch.step_reset_all().await.unwrap();
        assert!(step.completed);
        assert!(orch.store().get("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reset_all_now_clears_everything() {
        let a = Arc::new(FakeJob::new("a", "A").with_items(3));
        let orch = orchestrator(vec![a.clone()]).await;
        orch.start_job("a", settings(1, 1)).await.unwrap();
        orch.step_batch("a").await.unwrap();

        orch.reset_all_now().await.unwrap();
        assert_eq!(a.items(), 0);
        assert!(orch.store().list(None).await.unwrap().is_empty());
    }
}
