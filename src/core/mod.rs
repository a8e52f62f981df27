//! Coordinator state: jobs and batches, workers, retries, and the scheduler
//! that ties them together.

pub mod audit;
pub mod error;
pub mod job;
pub mod job_queue;
pub mod retry;
pub mod scheduler;
pub mod worker_registry;

pub use audit::{build_audit_event, AuditEntity, AuditEvent, AuditSink, InMemoryAuditSink};
pub use error::{AppResult, SchedulerError};
pub use job::{Batch, BatchStatus, Job, JobSpec, JobStatus, RenderMetrics};
pub use job_queue::{AckEffect, BatchOutcome, CancelEffect, JobQueue, QueueLimits};
pub use retry::{BackoffPolicy, FailureClass, FailureReason, RetryDecision, RetryManager};
pub use scheduler::{
    Assignment, BatchReport, BatchResult, BatchView, DispatchTimeouts, FarmStats, HeartbeatAck,
    JobView, RegisterAck, Scheduler, SweepReport,
};
pub use worker_registry::{
    Heartbeat, HostMetrics, LivenessChange, LivenessState, LivenessTimeouts, Worker, WorkerInfo, WorkerRegistry,
};
