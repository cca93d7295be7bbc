//! Synthetic record jobs backed by the `seeded_records` table.

use async_trait::async_trait;
use libsql::{Connection, params};
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};

use crate::error::{CapabilityError, DatabaseError};
use crate::jobs::cancel::CancelSignal;
use crate::jobs::descriptor::{BatchOutcome, JobDescriptor};
use crate::jobs::settings::{SettingField, Settings};

const FIRST_NAMES: &[&str] = &[
    "Ada", "Grace", "Linus", "Barbara", "Ken", "Margaret", "Dennis", "Frances", "Alan", "Radia",
];
const LAST_NAMES: &[&str] = &[
    "Lovelace", "Hopper", "Torvalds", "Liskov", "Thompson", "Hamilton", "Ritchie", "Allen",
    "Turing", "Perlman",
];
const PLANS: &[&str] = &["bronze", "silver", "gold"];

/// Create the table synthetic jobs write into.
pub async fn ensure_table(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS seeded_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_key TEXT NOT NULL,
            seq INTEGER NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_seeded_records_job ON seeded_records(job_key, id);
        "#,
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("seeded_records: {e}")))?;
    Ok(())
}

/// What kind of entity a synthetic job generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    User,
    Membership,
    Subscription,
}

/// A job that inserts rows with random payloads, one per item.
pub struct SyntheticRecordsJob {
    kind: RecordKind,
    key: String,
    name: String,
    description: String,
    default_total: u64,
    default_batch_size: u64,
    dependents: Vec<String>,
    conn: Connection,
}

impl SyntheticRecordsJob {
    pub fn new(kind: RecordKind, key: &str, name: &str, conn: Connection) -> Self {
        Self {
            kind,
            key: key.to_string(),
            name: name.to_string(),
            description: String::new(),
            default_total: 100,
            default_batch_size: 10,
            dependents: Vec::new(),
            conn,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_defaults(mut self, total: u64, batch_size: u64) -> Self {
        self.default_total = total;
        self.default_batch_size = batch_size;
        self
    }

    pub fn with_dependents(mut self, dependents: &[&str]) -> Self {
        self.dependents = dependents.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn users(conn: Connection) -> Self {
        Self::new(RecordKind::User, "users", "Users", conn)
            .with_description("Create user accounts with random names and emails")
            .with_defaults(100, 10)
            .with_dependents(&["subscriptions"])
    }

    pub fn memberships(conn: Connection) -> Self {
        Self::new(RecordKind::Membership, "memberships", "Memberships", conn)
            .with_description("Create membership plans")
            .with_defaults(20, 5)
            .with_dependents(&["subscriptions"])
    }

    pub fn subscriptions(conn: Connection) -> Self {
        Self::new(RecordKind::Subscription, "subscriptions", "Subscriptions", conn)
            .with_description("Link users to membership plans")
            .with_defaults(200, 20)
    }

    async fn insert_row(&self, seq: u64, payload: &Value) -> Result<(), CapabilityError> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO seeded_records (job_key, seq, payload, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    self.key.as_str(),
                    i64::try_from(seq).unwrap_or(i64::MAX),
                    payload.to_string(),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert seeded record: {e}")))?;
        Ok(())
    }
}

/// Build a random payload. Kept synchronous so the thread-local RNG never
/// lives across an await point.
fn random_payload(kind: RecordKind, seq: u64, settings: &Settings) -> Value {
    let mut rng = rand::thread_rng();
    let first = FIRST_NAMES.choose(&mut rng).copied().unwrap_or("Ada");
    let last = LAST_NAMES.choose(&mut rng).copied().unwrap_or("Lovelace");

    match kind {
        RecordKind::User => {
            let domain = settings
                .get("email_domain")
                .and_then(Value::as_str)
                .filter(|d| !d.trim().is_empty())
                .unwrap_or("example.com");
            json!({
                "name": format!("{first} {last}"),
                "email": format!("{}.{}{}@{}", first.to_lowercase(), last.to_lowercase(), seq, domain),
                "age": rng.gen_range(18..90),
            })
        }
        RecordKind::Membership => {
            let plan = PLANS.choose(&mut rng).copied().unwrap_or("bronze");
            json!({
                "plan": plan,
                "title": format!("{} plan #{seq}", plan),
                "price_cents": rng.gen_range(500..10_000),
            })
        }
        RecordKind::Subscription => {
            let status = settings
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("active");
            json!({
                "subscriber": format!("{first} {last}"),
                "plan": PLANS.choose(&mut rng).copied().unwrap_or("bronze"),
                "status": status,
                "months": rng.gen_range(1..36),
            })
        }
    }
}

#[async_trait]
impl JobDescriptor for SyntheticRecordsJob {
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn default_total(&self) -> u64 {
        self.default_total
    }

    fn default_batch_size(&self) -> u64 {
        self.default_batch_size
    }

    fn extra_settings(&self) -> Vec<SettingField> {
        match self.kind {
            RecordKind::User => vec![SettingField::text("email_domain", "Email domain", "example.com")],
            RecordKind::Membership => Vec::new(),
            RecordKind::Subscription => vec![SettingField::select(
                "status",
                "Subscription status",
                "active",
                &[
                    ("active", "Active"),
                    ("paused", "Paused"),
                    ("expired", "Expired"),
                ],
            )],
        }
    }

    fn dependents(&self) -> Vec<String> {
        self.dependents.clone()
    }

    async fn produce(
        &self,
        offset: u64,
        limit: u64,
        settings: &Settings,
        cancel: &CancelSignal,
    ) -> Result<BatchOutcome, CapabilityError> {
        let mut created = 0;
        for i in 0..limit {
            if cancel.is_cancelled().await {
                tracing::info!(job_key = %self.key, created, "Batch stopped by cancel signal");
                return Ok(BatchOutcome::cancelled(created));
            }
            let payload = random_payload(self.kind, offset + i, settings);
            self.insert_row(offset + i, &payload).await?;
            created += 1;
        }
        Ok(BatchOutcome::done(created))
    }

    async fn count_remaining(&self) -> Result<u64, CapabilityError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM seeded_records WHERE job_key = ?1",
                params![self.key.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count seeded records: {e}")))?;

        let count: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("count seeded records: {e}")))?,
            Ok(None) => 0,
            Err(e) => return Err(DatabaseError::Query(format!("count seeded records: {e}")).into()),
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Deletes oldest rows first; `offset` is ignored since earlier batches
    /// have already removed the rows before it.
    async fn delete_batch(
        &self,
        _offset: u64,
        limit: u64,
        _cancel: &CancelSignal,
    ) -> Result<BatchOutcome, CapabilityError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM seeded_records WHERE id IN (
                    SELECT id FROM seeded_records WHERE job_key = ?1 ORDER BY id LIMIT ?2
                )",
                params![self.key.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete seeded records: {e}")))?;
        Ok(BatchOutcome::done(deleted))
    }
}
