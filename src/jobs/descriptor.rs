//! The `JobDescriptor` trait: metadata and capabilities of one job type.

use async_trait::async_trait;

use crate::error::{CapabilityError, JobError};
use crate::jobs::cancel::CancelSignal;
use crate::jobs::settings::{SettingField, Settings, ValidatedSettings, builtin_fields, validate_settings};

/// What a produce or delete batch reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Items actually produced or deleted in this batch.
    pub processed: u64,
    /// The capability saw the cancel signal and stopped early.
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn done(processed: u64) -> Self {
        Self {
            processed,
            cancelled: false,
        }
    }

    pub fn cancelled(processed: u64) -> Self {
        Self {
            processed,
            cancelled: true,
        }
    }
}

/// A registered job type.
///
/// Implementors supply `key`, `name` and `produce`; everything else has a
/// default. Batch capabilities receive a [`CancelSignal`] and should check
/// it between items, returning a partial [`BatchOutcome::cancelled`] when it
/// fires.
#[async_trait]
pub trait JobDescriptor: Send + Sync {
    /// Stable identifier; also the progress record key.
    fn key(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn default_total(&self) -> u64 {
        100
    }

    fn default_batch_size(&self) -> u64 {
        50
    }

    /// Job-specific fields, appended after the built-in `count` and `batch_size`.
    fn extra_settings(&self) -> Vec<SettingField> {
        Vec::new()
    }

    /// Full settings schema.
    fn settings_schema(&self) -> Vec<SettingField> {
        let mut fields = builtin_fields(self.default_total(), self.default_batch_size());
        fields.extend(self.extra_settings());
        fields
    }

    /// Validate raw settings, clamping numbers into range.
    fn validate(&self, raw: Settings) -> Result<ValidatedSettings, JobError> {
        validate_settings(&self.settings_schema(), raw)
    }

    /// Keys of jobs whose data depends on this job's data.
    fn dependents(&self) -> Vec<String> {
        Vec::new()
    }

    async fn before_start(&self, _settings: &Settings) -> Result<(), CapabilityError> {
        Ok(())
    }

    async fn after_complete(&self, _settings: &Settings) -> Result<(), CapabilityError> {
        Ok(())
    }

    /// Produce up to `limit` records starting at `offset`.
    async fn produce(
        &self,
        offset: u64,
        limit: u64,
        settings: &Settings,
        cancel: &CancelSignal,
    ) -> Result<BatchOutcome, CapabilityError>;

    /// Whether `count_remaining` and `delete_batch` are implemented. Jobs
    /// without them are reset synchronously through [`JobDescriptor::reset`].
    fn supports_batched_reset(&self) -> bool {
        true
    }

    /// Items this job has produced that still exist.
    async fn count_remaining(&self) -> Result<u64, CapabilityError> {
        Ok(0)
    }

    /// Delete up to `limit` of this job's records.
    async fn delete_batch(
        &self,
        _offset: u64,
        _limit: u64,
        _cancel: &CancelSignal,
    ) -> Result<BatchOutcome, CapabilityError> {
        Ok(BatchOutcome::default())
    }

    /// Delete everything this job produced in one call.
    async fn reset(&self) -> Result<(), CapabilityError> {
        if !self.supports_batched_reset() {
            return Ok(());
        }
        let remaining = self.count_remaining().await?;
        if remaining > 0 {
            self.delete_batch(0, remaining, &CancelSignal::never(self.key()))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use serde_json::json;

    struct Minimal;

    #[async_trait]
    impl JobDescriptor for Minimal {
        fn key(&self) -> &str {
            "minimal"
        }
        fn name(&self) -> &str {
            "Minimal"
        }
        async fn produce(
            &self,
            _offset: u64,
            limit: u64,
            _settings: &Settings,
            _cancel: &CancelSignal,
        ) -> Result<BatchOutcome, CapabilityError> {
            Ok(BatchOutcome::done(limit))
        }
    }

    struct Counting {
        remaining: Mutex<u64>,
    }

    #[async_trait]
    impl JobDescriptor for Counting {
        fn key(&self) -> &str {
            "counting"
        }
        fn name(&self) -> &str {
            "Counting"
        }
        async fn produce(
            &self,
            _offset: u64,
            limit: u64,
            _settings: &Settings,
            _cancel: &CancelSignal,
        ) -> Result<BatchOutcome, CapabilityError> {
            Ok(BatchOutcome::done(limit))
        }
        async fn count_remaining(&self) -> Result<u64, CapabilityError> {
            Ok(*self.remaining.lock().unwrap())
        }
        async fn delete_batch(
            &self,
            _offset: u64,
            limit: u64,
            _cancel: &CancelSignal,
        ) -> Result<BatchOutcome, CapabilityError> {
            let mut remaining = self.remaining.lock().unwrap();
            let deleted = limit.min(*remaining);
            *remaining -= deleted;
            Ok(BatchOutcome::done(deleted))
        }
    }

    #[test]
    fn schema_starts_with_builtin_fields() {
        let schema = Minimal.settings_schema();
        assert_eq!(schema[0].key, "count");
        assert_eq!(schema[0].default, json!(100));
        assert_eq!(schema[1].key, "batch_size");
        assert_eq!(schema[1].default, json!(50));
    }

    #[test]
    fn default_validate_uses_schema() {
        let raw = json!({"count": 5}).as_object().cloned().unwrap();
        assert!(Minimal.validate(raw).is_err());
    }

    #[tokio::test]
    async fn default_reset_deletes_everything() {
        let job = Counting {
            remaining: Mutex::new(42),
        };
        job.reset().await.unwrap();
        assert_eq!(job.count_remaining().await.unwrap(), 0);
    }
}
