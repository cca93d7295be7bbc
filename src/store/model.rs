//! Progress records and the reset-all worklist.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::settings::Settings;

/// Lifecycle state of a progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Durable state of one job's current run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub job_key: String,
    pub total: u64,
    pub processed: u64,
    pub batch_size: u64,
    pub status: JobStatus,
    pub settings: Settings,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn percentage(&self) -> f64 {
        percentage(self.processed, self.total)
    }

    /// Items left before `processed` reaches `total`.
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.processed)
    }
}

/// Outcome of the single-flight compare-and-set in `ProgressStore::start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning { running_job: String },
}

/// One job waiting in the reset-all worklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetAllEntry {
    pub job_key: String,
    pub display_name: String,
    pub item_count: u64,
}

/// Ordered worklist plus cursor driving a reset-all run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetAllQueue {
    pub entries: Vec<ResetAllEntry>,
    pub current_index: usize,
}

impl ResetAllQueue {
    pub fn new(entries: Vec<ResetAllEntry>) -> Self {
        Self {
            entries,
            current_index: 0,
        }
    }

    pub fn current(&self) -> Option<&ResetAllEntry> {
        self.entries.get(self.current_index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `processed / total * 100` rounded to two decimals; zero when `total` is zero.
pub fn percentage(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = processed as f64 / total as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}
