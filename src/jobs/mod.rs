//! Background job system — durable queue execution.
//!
//! Core components:
//! - `model` — Job types, statuses, batch results, terminal events
//! - `handler` — JobHandler trait plus the handler registry
//! - `processor` — BatchProcessor (claim, execute, record, publish)

pub mod handler;
pub mod model;
pub mod processor;

pub use handler::{DeepProcessingHandler, HandlerError, HandlerOutput, HandlerRegistry, JobHandler};
pub use model::{
    BatchResult, DEEP_PROCESSING, Job, JobEvent, JobOutcome, JobStatus, QueueStats, StaleSweep,
};
pub use processor::{BatchOptions, BatchProcessor, spawn_maintenance_task};
