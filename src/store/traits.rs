//! Unified `Database` trait — single async interface for all persistence.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, QueueStats, StaleSweep};

/// A conversation message from the database.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic database trait covering jobs and conversations.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new pending job. Returns the generated id.
    async fn enqueue_job(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Uuid, DatabaseError>;

    /// Claim the oldest pending job among `types` (all types when empty).
    ///
    /// The pending → processing transition is a single conditional update
    /// checked by rows affected, so two racing callers can never claim the
    /// same job; the loser retries against the next candidate. Returns None
    /// when nothing is pending.
    async fn claim_next_job(
        &self,
        types: &[String],
        worker_id: &str,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Transition a job this worker owns from processing to completed.
    ///
    /// Returns false without writing when the job is no longer processing
    /// under `worker_id` (reclaimed by the stale sweep and re-owned
    /// elsewhere).
    async fn complete_job(
        &self,
        id: Uuid,
        worker_id: &str,
        content: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool, DatabaseError>;

    /// Transition a job this worker owns from processing to failed.
    ///
    /// Same ownership guard as `complete_job`.
    async fn fail_job(
        &self,
        id: Uuid,
        worker_id: &str,
        error_message: &str,
        error_code: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Recover jobs stuck in processing longer than `stale_threshold`.
    ///
    /// Jobs under the attempt budget go back to pending (attempt charged);
    /// the rest are failed with a max-attempts error.
    async fn cleanup_stale_jobs(
        &self,
        stale_threshold: Duration,
        max_attempts: u32,
    ) -> Result<StaleSweep, DatabaseError>;

    /// Get a job by id.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Queue depth by status and by type, plus currently-stale count.
    async fn queue_stats(&self, stale_threshold: Duration) -> Result<QueueStats, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Ensure a conversation exists, creating it if needed.
    async fn ensure_conversation(&self, thread_id: Uuid, user_id: &str)
    -> Result<(), DatabaseError>;

    /// Add a message to a conversation.
    async fn add_conversation_message(
        &self,
        thread_id: Uuid,
        role: &str,
        content: &str,
    ) -> Result<(), DatabaseError>;

    /// List messages in a conversation, oldest first.
    async fn list_conversation_messages(
        &self,
        thread_id: Uuid,
    ) -> Result<Vec<ConversationMessage>, DatabaseError>;
}
