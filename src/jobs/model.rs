//! Job queue data model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job type handled by the built-in deep handler.
pub const DEEP_PROCESSING: &str = "deep-processing";

/// Status of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed and owned by exactly one worker.
    Processing,
    /// Finished with output.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// Processing → Pending is the stale-recovery reset; everything else
    /// moves forward only.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A unit of deferred work, persisted in the jobs table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    /// Opaque, handler-defined input.
    pub payload: serde_json::Value,
    pub output_content: Option<String>,
    pub output_metadata: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Claims plus stale resets consumed so far.
    pub attempt: u32,
    /// Owner while the job is processing.
    pub worker_id: Option<String>,
}

impl Job {
    /// Thread the job was enqueued for, when the payload carries one.
    pub fn thread_id(&self) -> Option<String> {
        self.payload
            .get("thread_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// Result of one stale-jobs sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StaleSweep {
    /// Jobs reset to pending for another attempt.
    pub reset: usize,
    /// Jobs failed for exhausting the attempt budget.
    pub failed: usize,
}

/// Job counts broken down by status.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Queue depth snapshot for observability.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub by_status: StatusCounts,
    pub by_type: BTreeMap<String, StatusCounts>,
    /// Processing jobs currently past the stale threshold.
    pub stale: u64,
}

/// Per-job outcome within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate result of one `process_batch` invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub jobs: Vec<JobOutcome>,
}

impl BatchResult {
    /// Record one outcome. Every claimed job lands here exactly once, in
    /// exactly one of succeeded/failed.
    pub fn record(&mut self, outcome: JobOutcome) {
        self.processed += 1;
        match outcome.status {
            JobStatus::Completed => self.succeeded += 1,
            _ => self.failed += 1,
        }
        self.jobs.push(outcome);
    }
}

/// Terminal-state notification published on the delivery channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: Uuid,
    /// Subscription key for the original caller, when the payload carried one.
    pub thread_id: Option<String>,
    pub job_type: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    /// Build the event for a job that just reached a terminal status.
    pub fn terminal(job: &Job) -> Self {
        Self {
            job_id: job.id,
            thread_id: job.thread_id(),
            job_type: job.job_type.clone(),
            status: job.status,
            content: job.output_content.clone(),
            error: job.error_message.clone(),
        }
    }
}
