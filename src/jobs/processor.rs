//! Worker batch processor.
//!
//! Claims pending jobs, runs their handlers under a concurrency cap,
//! records terminal state, and publishes follow-up events. One job's
//! failure never aborts the batch.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::delivery::DeliveryChannel;
use crate::error::Result;
use crate::jobs::handler::{HandlerError, HandlerRegistry};
use crate::jobs::model::{BatchResult, Job, JobEvent, JobOutcome, JobStatus};
use crate::store::Database;

/// One batch run's parameters.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub worker_id: String,
    /// Job types to claim; empty means all types.
    pub types: Vec<String>,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl BatchOptions {
    /// Batch options for a named worker, sized from queue configuration.
    pub fn for_worker(worker_id: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            types: Vec::new(),
            batch_size: config.batch_size,
            concurrency: config.concurrency,
        }
    }
}

/// Claims and executes batches of queued jobs.
pub struct BatchProcessor {
    db: Arc<dyn Database>,
    registry: Arc<HandlerRegistry>,
    delivery: Arc<dyn DeliveryChannel>,
}

impl BatchProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        registry: Arc<HandlerRegistry>,
        delivery: Arc<dyn DeliveryChannel>,
    ) -> Self {
        Self {
            db,
            registry,
            delivery,
        }
    }

    /// Claim up to `batch_size` jobs and run them with bounded concurrency.
    ///
    /// Every claimed job lands in exactly one of `succeeded`/`failed` in
    /// the returned result. Store errors during the claim phase abort the
    /// run; handler failures never do.
    pub async fn process_batch(&self, options: &BatchOptions) -> Result<BatchResult> {
        let mut claimed = Vec::new();
        while claimed.len() < options.batch_size {
            match self
                .db
                .claim_next_job(&options.types, &options.worker_id)
                .await?
            {
                Some(job) => claimed.push(job),
                None => break,
            }
        }

        if claimed.is_empty() {
            debug!(worker_id = %options.worker_id, "No pending jobs to claim");
            return Ok(BatchResult::default());
        }

        debug!(
            worker_id = %options.worker_id,
            claimed = claimed.len(),
            "Dispatching batch"
        );

        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut workers = JoinSet::new();

        for job in claimed {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let db = Arc::clone(&self.db);
            let registry = Arc::clone(&self.registry);
            let delivery = Arc::clone(&self.delivery);
            let worker_id = options.worker_id.clone();
            workers.spawn(async move {
                let _permit = permit;
                Self::process_one(db, registry, delivery, worker_id, job).await
            });
        }

        let mut batch = BatchResult::default();
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(outcome) => batch.record(outcome),
                Err(e) => error!("batch worker crashed: {e}"),
            }
        }

        if batch.processed > 0 {
            info!(
                worker_id = %options.worker_id,
                processed = batch.processed,
                succeeded = batch.succeeded,
                failed = batch.failed,
                "Batch complete"
            );
        }

        Ok(batch)
    }

    /// Claim and process batches forever at a fixed interval.
    pub async fn run_loop(self: Arc<Self>, options: BatchOptions, interval: Duration) {
        // Spread workers started together across the first interval.
        let jitter_ms = rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64);
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

        info!(
            worker_id = %options.worker_id,
            interval_secs = interval.as_secs(),
            "Worker loop started"
        );

        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.process_batch(&options).await {
                error!(worker_id = %options.worker_id, error = %e, "Batch run failed");
            }
        }
    }

    async fn process_one(
        db: Arc<dyn Database>,
        registry: Arc<HandlerRegistry>,
        delivery: Arc<dyn DeliveryChannel>,
        worker_id: String,
        job: Job,
    ) -> JobOutcome {
        let start = Instant::now();
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt,
            "Processing job"
        );

        let handler = match registry.get(&job.job_type).await {
            Some(handler) => handler,
            None => {
                let message = format!("no handler registered for type '{}'", job.job_type);
                warn!(job_id = %job.id, job_type = %job.job_type, "No handler for claimed job");
                return Self::finish_failed(
                    &*db,
                    &*delivery,
                    &worker_id,
                    &job,
                    &message,
                    Some("no_handler"),
                    start,
                )
                .await;
            }
        };

        // Catch panics so a rogue handler is failed like any other error
        // instead of taking its outcome down with the task.
        let handled = match AssertUnwindSafe(handler.handle(&job.payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(HandlerError::permanent(format!("handler panicked: {reason}"))
                    .with_code("panic"))
            }
        };

        match handled {
            Ok(output) => {
                match db
                    .complete_job(job.id, &worker_id, &output.content, output.metadata.as_ref())
                    .await
                {
                    Ok(true) => {
                        Self::publish_terminal(&*db, &*delivery, job.id).await;
                        JobOutcome {
                            job_id: job.id,
                            status: JobStatus::Completed,
                            duration_ms: start.elapsed().as_millis() as u64,
                            error: None,
                        }
                    }
                    Ok(false) => {
                        warn!(job_id = %job.id, "Completion refused, job was reclaimed");
                        JobOutcome {
                            job_id: job.id,
                            status: JobStatus::Failed,
                            duration_ms: start.elapsed().as_millis() as u64,
                            error: Some("claim lost before terminal write".to_string()),
                        }
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to record job completion");
                        JobOutcome {
                            job_id: job.id,
                            status: JobStatus::Failed,
                            duration_ms: start.elapsed().as_millis() as u64,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
            Err(handler_err) => {
                warn!(
                    job_id = %job.id,
                    error = %handler_err,
                    code = %handler_err.code_or_kind(),
                    "Handler failed"
                );
                let code = handler_err.code_or_kind().to_string();
                Self::finish_failed(
                    &*db,
                    &*delivery,
                    &worker_id,
                    &job,
                    &handler_err.message,
                    Some(&code),
                    start,
                )
                .await
            }
        }
    }

    async fn finish_failed(
        db: &dyn Database,
        delivery: &dyn DeliveryChannel,
        worker_id: &str,
        job: &Job,
        message: &str,
        code: Option<&str>,
        start: Instant,
    ) -> JobOutcome {
        let error = match db.fail_job(job.id, worker_id, message, code).await {
            Ok(true) => {
                Self::publish_terminal(db, delivery, job.id).await;
                message.to_string()
            }
            Ok(false) => {
                warn!(job_id = %job.id, "Failure write refused, job was reclaimed");
                "claim lost before terminal write".to_string()
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
                e.to_string()
            }
        };

        JobOutcome {
            job_id: job.id,
            status: JobStatus::Failed,
            duration_ms: start.elapsed().as_millis() as u64,
            error: Some(error),
        }
    }

    /// Publish the terminal event from the persisted row, which is what
    /// subscribers will read back on reconnect.
    async fn publish_terminal(db: &dyn Database, delivery: &dyn DeliveryChannel, job_id: Uuid) {
        match db.get_job(job_id).await {
            Ok(Some(job)) => delivery.publish(JobEvent::terminal(&job)).await,
            Ok(None) => warn!(job_id = %job_id, "Terminal job row missing, event not published"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Event publish skipped"),
        }
    }
}

/// Spawn the periodic sweep that rescues jobs stuck in processing.
pub fn spawn_maintenance_task(
    db: Arc<dyn Database>,
    interval: Duration,
    stale_threshold: Duration,
    max_attempts: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = db.cleanup_stale_jobs(stale_threshold, max_attempts).await {
                warn!(error = %e, "Stale job sweep failed");
            }
        }
    })
}
