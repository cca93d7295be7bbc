//! Error types for the data seeder.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors returned by the orchestrators to their callers.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {key} not found")]
    NotFound { key: String },

    #[error("{0}")]
    Validation(String),

    #[error("Cannot start job. Another job ({running_job}) is currently running.")]
    AlreadyRunning { running_job: String },

    #[error("Job {key} is not running")]
    NotRunning { key: String },

    #[error("Hook failed for job {key}: {reason}")]
    Hook { key: String, reason: String },

    #[error("Batch failed for job {key}: {reason}")]
    Batch { key: String, reason: String },

    #[error("Cannot reset {name} until {} reset first.", .blocking.join(" and "))]
    BlockedByDependents {
        key: String,
        name: String,
        blocking: Vec<String>,
    },

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors reported by a job's own capabilities (produce, delete, count, hooks).
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("{0}")]
    Failed(String),

    #[error("Storage error: {0}")]
    Database(#[from] DatabaseError),
}

impl CapabilityError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Errors raised by the client-side transports.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Job {key} already has an active polling loop")]
    AlreadyPolling { key: String },

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

/// Result type alias for the seeder.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_message_names_every_dependent() {
        let err = JobError::BlockedByDependents {
            key: "users".into(),
            name: "Users".into(),
            blocking: vec!["Subscriptions".into(), "Memberships".into()],
        };
        assert_eq!(
            err.to_string(),
            "Cannot reset Users until Subscriptions and Memberships reset first."
        );
    }

    #[test]
    fn already_running_names_the_holder() {
        let err = JobError::AlreadyRunning {
            running_job: "Y".into(),
        };
        assert!(err.to_string().contains("(Y)"));
    }
}
