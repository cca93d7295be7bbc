//! REST surface over the orchestrator.

pub mod routes;

use serde::{Deserialize, Serialize};

pub use routes::{ApiState, seeder_routes};

/// JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Job the error is about, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_dependents: Option<Vec<String>>,
}
