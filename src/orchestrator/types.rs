//! Request/response payloads shared by the orchestrator, the REST layer and
//! the client transports.

use serde::{Deserialize, Serialize};

use crate::jobs::settings::{SettingField, Settings};
use crate::store::{ProgressRecord, ResetAllEntry};

/// Reply to `start_job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartJobResponse {
    pub total: u64,
    pub batch_size: u64,
    /// Settings after validation; differs from the input when clamped.
    pub settings: Settings,
    #[serde(default)]
    pub clamped: bool,
    pub message: String,
}

/// Reply to one `step_batch` or `step_reset` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub completed: bool,
    #[serde(default)]
    pub cancelled: bool,
    pub processed: u64,
    pub total: u64,
    pub percentage: f64,
    pub message: String,
}

/// Status of one job key. `status` is `idle` when no record exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_key: String,
    pub status: String,
    pub processed: u64,
    pub total: u64,
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobStatusView {
    pub const IDLE: &'static str = "idle";

    pub fn idle(job_key: &str) -> Self {
        Self {
            job_key: job_key.to_string(),
            status: Self::IDLE.to_string(),
            processed: 0,
            total: 0,
            percentage: 0.0,
            error_message: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == Self::IDLE
    }
}

impl From<&ProgressRecord> for JobStatusView {
    fn from(record: &ProgressRecord) -> Self {
        Self {
            job_key: record.job_key.clone(),
            status: record.status.to_string(),
            processed: record.processed,
            total: record.total,
            percentage: record.percentage(),
            error_message: record.error_message.clone(),
        }
    }
}

/// Which job, if any, currently holds the single-flight lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalStatus {
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

/// A registered job as listed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub key: String,
    pub name: String,
    pub description: String,
    pub default_total: u64,
    pub default_batch_size: u64,
    pub dependents: Vec<String>,
    pub settings: Vec<SettingField>,
    pub status: JobStatusView,
}

/// Plain acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Reply to `can_reset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetCheck {
    pub can_reset: bool,
    #[serde(default)]
    pub blocking_dependents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Reply to `start_reset`. `total` and `batch_size` are present only when a
/// batched reset was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResetResponse {
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
    pub message: String,
}

/// Reply to `start_reset_all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartResetAllResponse {
    pub completed: bool,
    pub total_jobs: usize,
    pub jobs: Vec<ResetAllEntry>,
    pub message: String,
}

/// Reply to one `step_reset_all` call. The `job_*` counters are present only
/// when a delete batch actually ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetAllStep {
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_jobs: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_percentage: Option<f64>,
    pub message: String,
}

impl ResetAllStep {
    pub fn finished(message: impl Into<String>) -> Self {
        Self {
            completed: true,
            message: message.into(),
            ..Default::default()
        }
    }
}
