//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are stored
//! as RFC 3339 TEXT, which compares chronologically under SQLite's default
//! ordering, so claim FIFO works off the `(type, status, created_at)` index.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobStatus, QueueStats, StaleSweep, StatusCounts};
use crate::store::migrations;
use crate::store::traits::{ConversationMessage, Database};

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
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Query(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Query(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Query(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Query(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
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

/// Convert a JobStatus to its DB string.
fn status_to_str(status: JobStatus) -> &'static str {
    status.as_str()
}

/// Parse a status string from the DB.
fn str_to_status(s: &str) -> JobStatus {
    match s {
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        _ => JobStatus::Pending,
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Serialize an optional JSON value to a libsql Value.
fn opt_json(v: Option<&serde_json::Value>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

const JOB_COLUMNS: &str = "id, type, status, payload, output_content, output_metadata, \
     error_message, error_code, created_at, started_at, completed_at, attempt, worker_id";

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, libsql::Error> {
    let id_str: String = row.get(0)?;
    let job_type: String = row.get(1)?;
    let status_str: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    let output_content: Option<String> = row.get(4).ok();
    let output_metadata_str: Option<String> = row.get(5).ok();
    let error_message: Option<String> = row.get(6).ok();
    let error_code: Option<String> = row.get(7).ok();
    let created_str: String = row.get(8)?;
    let started_str: Option<String> = row.get(9).ok();
    let completed_str: Option<String> = row.get(10).ok();
    let attempt: i64 = row.get(11)?;
    let worker_id: Option<String> = row.get(12).ok();

    Ok(Job {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        job_type,
        status: str_to_status(&status_str),
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        output_content,
        output_metadata: output_metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
        error_message,
        error_code,
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
        attempt: attempt.max(0) as u32,
        worker_id,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn enqueue_job(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let payload_str = serde_json::to_string(payload)
            .map_err(|e| DatabaseError::Serialization(format!("enqueue_job payload: {e}")))?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO jobs (id, type, status, payload, created_at, attempt)
             VALUES (?1, ?2, 'pending', ?3, ?4, 0)",
            params![id.to_string(), job_type, payload_str, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("enqueue_job: {e}")))?;

        debug!(job_id = %id, job_type, "Job enqueued");
        Ok(id)
    }

    async fn claim_next_job(
        &self,
        types: &[String],
        worker_id: &str,
    ) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn();

        loop {
            // Oldest pending candidate, FIFO across the requested types.
            let (candidate_sql, type_params) = if types.is_empty() {
                (
                    "SELECT id FROM jobs WHERE status = 'pending' \
                     ORDER BY created_at ASC LIMIT 1"
                        .to_string(),
                    Vec::new(),
                )
            } else {
                let placeholders = (1..=types.len())
                    .map(|i| format!("?{i}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                (
                    format!(
                        "SELECT id FROM jobs WHERE status = 'pending' AND type IN ({placeholders}) \
                         ORDER BY created_at ASC LIMIT 1"
                    ),
                    types
                        .iter()
                        .map(|t| libsql::Value::Text(t.clone()))
                        .collect::<Vec<libsql::Value>>(),
                )
            };

            let mut rows = conn
                .query(&candidate_sql, type_params)
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_next_job select: {e}")))?;

            let candidate_id: String = match rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_next_job select: {e}")))?
            {
                Some(row) => row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("claim_next_job row: {e}")))?,
                None => return Ok(None),
            };

            // Conditional transition guarded on the prior status. The
            // rows-affected count decides the race: exactly one caller
            // moves the row out of pending.
            let now = Utc::now().to_rfc3339();
            let affected = conn
                .execute(
                    "UPDATE jobs SET status = 'processing', started_at = ?1, \
                     attempt = attempt + 1, worker_id = ?2 \
                     WHERE id = ?3 AND status = 'pending'",
                    params![now, worker_id, candidate_id.clone()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_next_job update: {e}")))?;

            if affected == 1 {
                let id = Uuid::parse_str(&candidate_id).unwrap_or_else(|_| Uuid::nil());
                let job = self.get_job(id).await?.ok_or(DatabaseError::NotFound {
                    entity: "job".to_string(),
                    id: candidate_id,
                })?;
                debug!(job_id = %job.id, worker_id, attempt = job.attempt, "Job claimed");
                return Ok(Some(job));
            }
            // Lost the race; try the next candidate.
        }
    }

    async fn complete_job(
        &self,
        id: Uuid,
        worker_id: &str,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE jobs SET status = 'completed', output_content = ?1, \
                 output_metadata = ?2, completed_at = ?3 \
                 WHERE id = ?4 AND status = 'processing' AND worker_id = ?5",
                params![content, opt_json(metadata), now, id.to_string(), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job: {e}")))?;

        if affected == 1 {
            debug!(job_id = %id, worker_id, "Job completed");
        }
        Ok(affected == 1)
    }

    async fn fail_job(
        &self,
        id: Uuid,
        worker_id: &str,
        error_message: &str,
        error_code: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE jobs SET status = 'failed', error_message = ?1, \
                 error_code = ?2, completed_at = ?3 \
                 WHERE id = ?4 AND status = 'processing' AND worker_id = ?5",
                params![
                    error_message,
                    opt_text(error_code),
                    now,
                    id.to_string(),
                    worker_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_job: {e}")))?;

        if affected == 1 {
            debug!(job_id = %id, worker_id, error_message, "Job failed");
        }
        Ok(affected == 1)
    }

    async fn cleanup_stale_jobs(
        &self,
        stale_threshold: Duration,
        max_attempts: u32,
    ) -> Result<StaleSweep, DatabaseError> {
        let conn = self.conn();
        let now = Utc::now();
        let cutoff = (now - chrono::Duration::milliseconds(stale_threshold.as_millis() as i64))
            .to_rfc3339();

        // Attempt budget exhausted: terminal failure.
        let failed = conn
            .execute(
                "UPDATE jobs SET status = 'failed', \
                 error_message = 'max attempts exceeded', \
                 error_code = 'max_attempts_exceeded', completed_at = ?1 \
                 WHERE status = 'processing' AND started_at <= ?2 AND attempt >= ?3",
                params![now.to_rfc3339(), cutoff.clone(), max_attempts as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cleanup_stale_jobs fail: {e}")))?;

        // Budget remaining: back to pending. The reset charges an attempt,
        // same as a claim would.
        let reset = conn
            .execute(
                "UPDATE jobs SET status = 'pending', attempt = attempt + 1, \
                 started_at = NULL, worker_id = NULL \
                 WHERE status = 'processing' AND started_at <= ?1 AND attempt < ?2",
                params![cutoff, max_attempts as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cleanup_stale_jobs reset: {e}")))?;

        if reset > 0 || failed > 0 {
            info!(
                reset,
                failed, "Stale jobs swept (reset to pending / failed for good)"
            );
        }

        Ok(StaleSweep {
            reset: reset as usize,
            failed: failed as usize,
        })
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let job = row_to_job(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_job row parse: {e}")))?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn queue_stats(&self, stale_threshold: Duration) -> Result<QueueStats, DatabaseError> {
        let conn = self.conn();
        let mut stats = QueueStats::default();

        let mut rows = conn
            .query(
                "SELECT type, status, COUNT(*) FROM jobs GROUP BY type, status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let job_type: String = row.get(0).unwrap_or_default();
            let status_str: String = row.get(1).unwrap_or_default();
            let count: i64 = row.get(2).unwrap_or(0);
            let count = count.max(0) as u64;

            let per_type = stats.by_type.entry(job_type).or_insert(StatusCounts::default());
            match str_to_status(&status_str) {
                JobStatus::Pending => {
                    per_type.pending += count;
                    stats.by_status.pending += count;
                }
                JobStatus::Processing => {
                    per_type.processing += count;
                    stats.by_status.processing += count;
                }
                JobStatus::Completed => {
                    per_type.completed += count;
                    stats.by_status.completed += count;
                }
                JobStatus::Failed => {
                    per_type.failed += count;
                    stats.by_status.failed += count;
                }
            }
        }

        let cutoff = (Utc::now()
            - chrono::Duration::milliseconds(stale_threshold.as_millis() as i64))
        .to_rfc3339();
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM jobs WHERE status = 'processing' AND started_at <= ?1",
                params![cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats stale: {e}")))?;
        if let Ok(Some(row)) = rows.next().await {
            let stale: i64 = row.get(0).unwrap_or(0);
            stats.stale = stale.max(0) as u64;
        }

        Ok(stats)
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn ensure_conversation(
        &self,
        thread_id: Uuid,
        user_id: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO conversations (id, user_id)
             VALUES (?1, ?2)
             ON CONFLICT (id) DO UPDATE SET last_activity = ?3",
            params![thread_id.to_string(), user_id, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("ensure_conversation: {e}")))?;

        Ok(())
    }

    async fn add_conversation_message(
        &self,
        thread_id: Uuid,
        role: &str,
        content: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO conversation_messages (id, conversation_id, role, content)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), thread_id.to_string(), role, content],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("add_conversation_message: {e}")))?;

        // Touch last_activity
        let now = Utc::now().to_rfc3339();
        let _ = conn
            .execute(
                "UPDATE conversations SET last_activity = ?2 WHERE id = ?1",
                params![thread_id.to_string(), now],
            )
            .await;

        Ok(())
    }

    async fn list_conversation_messages(
        &self,
        thread_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT id, role, content, created_at FROM conversation_messages
                 WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_conversation_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let role: String = row.get(1).unwrap_or_default();
            let content: String = row.get(2).unwrap_or_default();
            let created_str: String = row.get(3).unwrap_or_default();
            messages.push(ConversationMessage {
                id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
                role,
                content,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(messages)
    }
}
