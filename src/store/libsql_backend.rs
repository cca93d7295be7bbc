//! libSQL backend: async `ProgressStore` implementation.
//!
//! Supports local file and in-memory databases. The single-flight rule is a
//! conditional upsert, so it holds across processes sharing one database file.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::jobs::settings::Settings;
use crate::store::migrations;
use crate::store::model::{JobStatus, ProgressRecord, ResetAllEntry, ResetAllQueue, StartOutcome};
use crate::store::traits::ProgressStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    /// A handle on the shared connection, for record stores living in the same file.
    pub fn connection(&self) -> Connection {
        self.conn.clone()
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_records(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<ProgressRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => records.push(row_to_record(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Counters are `u64` in the model and `INTEGER` in SQLite.
fn to_sql_int(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_sql_int(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

const RECORD_COLUMNS: &str = "job_key, total, processed, batch_size, status, settings, started_at, completed_at, error_message, updated_at";

/// Map a libsql Row to a ProgressRecord.
///
/// Column order matches RECORD_COLUMNS.
fn row_to_record(row: &libsql::Row) -> Result<ProgressRecord, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("progress row parse: {e}"));

    let status_str: String = row.get(4).map_err(parse_err)?;
    let status = status_str
        .parse::<JobStatus>()
        .map_err(DatabaseError::Serialization)?;
    let settings_str: String = row.get(5).unwrap_or_else(|_| "{}".to_string());
    let settings: Settings = serde_json::from_str(&settings_str)
        .map_err(|e| DatabaseError::Serialization(format!("progress settings: {e}")))?;
    let started_str: Option<String> = row.get(6).ok();
    let completed_str: Option<String> = row.get(7).ok();
    let updated_str: String = row.get(9).map_err(parse_err)?;

    Ok(ProgressRecord {
        job_key: row.get(0).map_err(parse_err)?,
        total: from_sql_int(row.get(1).map_err(parse_err)?),
        processed: from_sql_int(row.get(2).map_err(parse_err)?),
        batch_size: from_sql_int(row.get(3).map_err(parse_err)?),
        status,
        settings,
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
        error_message: row.get(8).ok(),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ProgressStore for LibSqlBackend {
    async fn start(
        &self,
        key: &str,
        total: u64,
        batch_size: u64,
        settings: &Settings,
    ) -> Result<StartOutcome, DatabaseError> {
        let settings_json = serde_json::to_string(settings)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        // A running holder may finish between the failed upsert and the
        // lookup below, so allow one retry before giving up.
        for _ in 0..2 {
            let now = Utc::now().to_rfc3339();
            let inserted = self
                .conn()
                .execute(
                    "INSERT INTO progress (job_key, total, processed, batch_size, status, settings, started_at, completed_at, error_message, updated_at)
                     SELECT ?1, ?2, 0, ?3, 'running', ?4, ?5, NULL, NULL, ?5
                     WHERE NOT EXISTS (SELECT 1 FROM progress WHERE status = 'running' AND job_key <> ?1)
                     ON CONFLICT (job_key) DO UPDATE SET
                         total = excluded.total,
                         processed = 0,
                         batch_size = excluded.batch_size,
                         status = 'running',
                         settings = excluded.settings,
                         started_at = excluded.started_at,
                         completed_at = NULL,
                         error_message = NULL,
                         updated_at = excluded.updated_at",
                    params![
                        key,
                        to_sql_int(total),
                        to_sql_int(batch_size),
                        settings_json.clone(),
                        now
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("start: {e}")))?;

            if inserted > 0 {
                debug!(job_key = %key, total, batch_size, "Progress record started");
                return Ok(StartOutcome::Started);
            }

            if let Some(running) = self.get_running().await? {
                return Ok(StartOutcome::AlreadyRunning {
                    running_job: running.job_key,
                });
            }
        }

        Err(DatabaseError::Constraint(format!(
            "start: could not acquire the running slot for {key}"
        )))
    }

    async fn update_progress(&self, key: &str, processed: u64) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        // SET expressions all read the pre-update row, so `status` below is
        // the old status.
        let count = self
            .conn()
            .execute(
                "UPDATE progress SET
                     processed = MIN(?2, total),
                     status = CASE
                         WHEN status = 'running' AND ?2 >= total THEN 'completed'
                         ELSE status
                     END,
                     completed_at = CASE
                         WHEN status = 'running' AND ?2 >= total THEN ?3
                         ELSE completed_at
                     END,
                     updated_at = ?3
                 WHERE job_key = ?1",
                params![key, to_sql_int(processed), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_progress: {e}")))?;
        Ok(count > 0)
    }

    async fn set_error(&self, key: &str, message: &str) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE progress SET status = 'error', error_message = ?2, completed_at = ?3, updated_at = ?3
                 WHERE job_key = ?1",
                params![key, message, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_error: {e}")))?;
        Ok(count > 0)
    }

    async fn cancel(&self, key: &str) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE progress SET status = 'cancelled', completed_at = ?2, updated_at = ?2
                 WHERE job_key = ?1 AND status = 'running'",
                params![key, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel: {e}")))?;
        Ok(count > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<ProgressRecord>, DatabaseError> {
        let mut records = self
            .query_records(
                &format!("SELECT {RECORD_COLUMNS} FROM progress WHERE job_key = ?1"),
                params![key],
                "get",
            )
            .await?;
        Ok(records.pop())
    }

    async fn get_running(&self) -> Result<Option<ProgressRecord>, DatabaseError> {
        let mut records = self
            .query_records(
                &format!("SELECT {RECORD_COLUMNS} FROM progress WHERE status = 'running' LIMIT 1"),
                (),
                "get_running",
            )
            .await?;
        Ok(records.pop())
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<ProgressRecord>, DatabaseError> {
        match status {
            Some(status) => {
                self.query_records(
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM progress WHERE status = ?1 ORDER BY job_key"
                    ),
                    params![status.as_str()],
                    "list",
                )
                .await
            }
            None => {
                self.query_records(
                    &format!("SELECT {RECORD_COLUMNS} FROM progress ORDER BY job_key"),
                    (),
                    "list",
                )
                .await
            }
        }
    }

    async fn reset(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM progress WHERE job_key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("reset: {e}")))?;
        debug!(job_key = %key, "Progress record deleted");
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM progress", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_all: {e}")))?;
        debug!(count, "All progress records deleted");
        Ok(())
    }

    async fn abandon_running(&self) -> Result<u64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE progress SET status = 'cancelled', completed_at = ?1, updated_at = ?1
                 WHERE status = 'running'",
                params![now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("abandon_running: {e}")))
    }

    async fn load_reset_queue(&self) -> Result<Option<ResetAllQueue>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT entries, current_index FROM reset_all_queue WHERE id = 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_reset_queue: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let entries_str: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("load_reset_queue row: {e}")))?;
                let entries: Vec<ResetAllEntry> = serde_json::from_str(&entries_str)
                    .map_err(|e| DatabaseError::Serialization(format!("reset queue: {e}")))?;
                let current_index: i64 = row.get(1).unwrap_or(0);
                Ok(Some(ResetAllQueue {
                    entries,
                    current_index: usize::try_from(current_index).unwrap_or(0),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_reset_queue: {e}"))),
        }
    }

    async fn save_reset_queue(&self, queue: &ResetAllQueue) -> Result<(), DatabaseError> {
        let entries = serde_json::to_string(&queue.entries)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let index = i64::try_from(queue.current_index).unwrap_or(i64::MAX);
        self.conn()
            .execute(
                "INSERT INTO reset_all_queue (id, entries, current_index, created_at) VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET entries = ?1, current_index = ?2, created_at = ?3",
                params![entries, index, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_reset_queue: {e}")))?;
        Ok(())
    }

    async fn set_reset_cursor(&self, index: usize) -> Result<(), DatabaseError> {
        let index = i64::try_from(index).unwrap_or(i64::MAX);
        self.conn()
            .execute(
                "UPDATE reset_all_queue SET current_index = ?1 WHERE id = 1",
                params![index],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_reset_cursor: {e}")))?;
        Ok(())
    }

    async fn clear_reset_queue(&self) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM reset_all_queue", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_reset_queue: {e}")))?;
        Ok(())
    }
}
