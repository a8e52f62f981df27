//! Error types for coordinator operations.

use thiserror::Error;

use crate::util::serde::{BatchId, JobId, WorkerId};

/// Errors produced by coordinator components.
///
/// Invariant violations (double dispatch, stale reports, illegal transitions)
/// reject the single operation that hit them; shared state is left untouched.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Queue admission bound reached.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// Worker has no free capacity or is not schedulable.
    #[error("capacity exceeded on worker {0}")]
    CapacityExceeded(WorkerId),
    /// Submission rejected by validation.
    #[error("invalid job: {0}")]
    InvalidJob(String),
    /// Registration rejected by validation.
    #[error("invalid worker: {0}")]
    InvalidWorker(String),
    /// No job with this id.
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    /// No batch with this id.
    #[error("unknown batch {0}")]
    UnknownBatch(BatchId),
    /// No worker with this id (never registered or already removed).
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),
    /// Batch is not pending and cannot be dispatched again.
    #[error("batch {0} is already dispatched or finished")]
    DoubleDispatch(BatchId),
    /// Report for a batch no longer dispatched to the reporting worker.
    #[error("stale report for batch {batch} from worker {worker}")]
    StaleReport {
        /// Batch named in the report.
        batch: BatchId,
        /// Worker that sent the report.
        worker: WorkerId,
    },
    /// Operation not allowed in the job's current state.
    #[error("job {job} is {state}")]
    JobFinished {
        /// Job targeted by the operation.
        job: JobId,
        /// Terminal state the job is in.
        state: String,
    },
    /// Configuration rejected.
    #[error("config error: {0}")]
    Config(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

impl SchedulerError {
    /// Whether the error reflects a coordinator invariant guard rather than a
    /// caller mistake or backend outage.
    #[must_use]
    pub const fn is_invariant_guard(&self) -> bool {
        matches!(self, Self::DoubleDispatch(_) | Self::StaleReport { .. })
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
