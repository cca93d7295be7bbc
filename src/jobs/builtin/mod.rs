//! Built-in demo jobs.

pub mod synthetic;

use std::sync::Arc;

use libsql::Connection;

use crate::error::DatabaseError;
use crate::jobs::registry::JobRegistry;

pub use synthetic::SyntheticRecordsJob;

/// Create the demo table and register `users`, `memberships` and
/// `subscriptions`. Subscriptions reference both of the others, so they are
/// declared as a dependent of each.
pub async fn register_demo_jobs(registry: &JobRegistry, conn: Connection) -> Result<(), DatabaseError> {
    synthetic::ensure_table(&conn).await?;

    registry
        .register(Arc::new(SyntheticRecordsJob::users(conn.clone())))
        .await;
    registry
        .register(Arc::new(SyntheticRecordsJob::memberships(conn.clone())))
        .await;
    registry
        .register(Arc::new(SyntheticRecordsJob::subscriptions(conn)))
        .await;

    tracing::debug!(count = registry.count(), "Registered demo jobs");
    Ok(())
}
