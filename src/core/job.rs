//! Job and batch records with their closed state sets.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::serde::{BatchId, FrameRange, JobId, Priority, RendererKind, WorkerId};

/// Status of a job, derived from its batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No batch has started yet.
    Queued,
    /// At least one batch dispatched or completed.
    Running,
    /// Held back from dispatch by an operator.
    Paused,
    /// Every batch completed.
    Completed,
    /// A batch failed permanently.
    Failed,
    /// Cancelled by the submitter.
    Cancelled,
}

impl JobStatus {
    /// Terminal states are never left.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of a single batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Waiting for a worker.
    Pending,
    /// Assigned to exactly one worker.
    Dispatched,
    /// Rendered successfully.
    Completed,
    /// Failed permanently.
    Failed,
    /// Cancelled before it finished.
    Cancelled,
}

impl BatchStatus {
    /// Terminal states are never left.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Client request to render a frame range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Renderer to execute with.
    pub renderer: RendererKind,
    /// Frames to render.
    pub frames: FrameRange,
    /// Dispatch priority.
    #[serde(default)]
    pub priority: Priority,
    /// Requested frames per batch; clamped to the configured bounds.
    #[serde(default)]
    pub batch_size: Option<u64>,
}

impl JobSpec {
    /// Spec with default priority and batch size.
    #[must_use]
    pub fn new(renderer: RendererKind, frames: FrameRange) -> Self {
        Self {
            title: String::new(),
            renderer,
            frames,
            priority: Priority::Normal,
            batch_size: None,
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the requested batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Set the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// A submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,
    /// Human-readable title.
    pub title: String,
    /// Dispatch priority, shared by every batch.
    pub priority: Priority,
    /// Renderer to execute with.
    pub renderer: RendererKind,
    /// Full frame range.
    pub frames: FrameRange,
    /// Derived status; recomputed after every batch transition.
    pub status: JobStatus,
    /// Creation timestamp (ms since epoch).
    pub created_at_ms: u128,
    /// Total retries across all batches.
    pub retry_count: u32,
    /// Batches in frame order.
    pub batches: Vec<BatchId>,
    /// Set by cancel; never cleared.
    pub cancelled: bool,
    /// Held back from dispatch.
    pub paused: bool,
    /// Reason of the first permanently failed batch.
    pub failure_reason: Option<String>,
    /// When the job reached a terminal state.
    pub finished_at_ms: Option<u128>,
}

impl Job {
    pub(crate) fn from_spec(spec: &JobSpec, now_ms: u128) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: spec.title.clone(),
            priority: spec.priority,
            renderer: spec.renderer,
            frames: spec.frames,
            status: JobStatus::Queued,
            created_at_ms: now_ms,
            retry_count: 0,
            batches: Vec::new(),
            cancelled: false,
            paused: false,
            failure_reason: None,
            finished_at_ms: None,
        }
    }
}

/// Derive a job's status from its flags and its batches' statuses.
///
/// Order matters: cancellation wins, then any permanent failure, then full
/// completion, then pause, then whether anything has started.
#[must_use]
pub fn derive_job_status<I>(cancelled: bool, paused: bool, batches: I) -> JobStatus
where
    I: IntoIterator<Item = BatchStatus>,
{
    if cancelled {
        return JobStatus::Cancelled;
    }
    let mut total = 0usize;
    let mut completed = 0usize;
    let mut started = false;
    for status in batches {
        total += 1;
        match status {
            BatchStatus::Failed => return JobStatus::Failed,
            BatchStatus::Completed => {
                completed += 1;
                started = true;
            }
            BatchStatus::Dispatched => started = true,
            BatchStatus::Pending | BatchStatus::Cancelled => {}
        }
    }
    if total > 0 && completed == total {
        JobStatus::Completed
    } else if paused {
        JobStatus::Paused
    } else if started {
        JobStatus::Running
    } else {
        JobStatus::Queued
    }
}

/// Measurements a worker attaches to a batch report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderMetrics {
    /// Wall-clock render time.
    pub render_time_ms: u64,
    /// Peak resident memory of the renderer process.
    pub memory_peak_bytes: Option<u64>,
    /// Files written.
    pub output_files: Option<u64>,
    /// Bytes written.
    pub output_bytes: Option<u64>,
}

/// A contiguous frame sub-range of a job: the atomic unit of dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Unique identifier.
    pub id: BatchId,
    /// Parent job.
    pub job_id: JobId,
    /// Position within the job (0-based).
    pub index: u32,
    /// Frames covered by this batch.
    pub frames: FrameRange,
    /// Copied from the job.
    pub priority: Priority,
    /// Copied from the job.
    pub renderer: RendererKind,
    /// Current status.
    pub status: BatchStatus,
    /// Worker holding the active assignment, if dispatched.
    pub worker: Option<WorkerId>,
    /// Failed or lost attempts so far.
    pub attempts: u32,
    /// Last dispatch timestamp.
    pub dispatched_at_ms: Option<u128>,
    /// When the batch reached a terminal state.
    pub finished_at_ms: Option<u128>,
    /// Not eligible for dispatch before this time (retry backoff).
    pub not_before_ms: u128,
    /// Most recent failure message.
    pub last_error: Option<String>,
    /// Submission order; FIFO tie-break within a priority tier.
    pub seq: u64,
    /// Metrics from the most recent report.
    #[serde(default)]
    pub metrics: Option<RenderMetrics>,
}

impl Batch {
    pub(crate) fn new(job: &Job, index: u32, frames: FrameRange, seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            index,
            frames,
            priority: job.priority,
            renderer: job.renderer,
            status: BatchStatus::Pending,
            worker: None,
            attempts: 0,
            dispatched_at_ms: None,
            finished_at_ms: None,
            not_before_ms: 0,
            last_error: None,
            seq,
            metrics: None,
        }
    }

    /// Whether the batch may be dispatched at `now_ms`.
    #[must_use]
    pub const fn is_eligible(&self, now_ms: u128) -> bool {
        matches!(self.status, BatchStatus::Pending) && self.not_before_ms <= now_ms
    }
}
