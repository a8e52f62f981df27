//! API-facing request/response models for submitters and workers.
//!
//! Wire payloads carry renderer kinds, priorities, and frame ranges as
//! strings; conversion into core types rejects unknown names up front.

use serde::{Deserialize, Serialize};

use crate::core::error::SchedulerError;
use crate::core::job::{JobSpec, RenderMetrics};
use crate::core::retry::FailureReason;
use crate::core::scheduler::{BatchReport, BatchResult, FarmStats, Scheduler};
use crate::core::worker_registry::{Heartbeat, HostMetrics, WorkerInfo};
use crate::util::serde::{BatchId, FrameRange, JobId, Priority, RendererKind, WorkerId};

/// `POST job` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    /// Renderer name (`nuke`, `fusion`, `silhouette`).
    pub renderer_kind: String,
    /// Frame range, `"N"` or `"A-B"`.
    pub frame_range: String,
    /// Priority name; defaults to `normal`.
    #[serde(default)]
    pub priority: Option<String>,
    /// Optional title.
    #[serde(default)]
    pub title: Option<String>,
    /// Optional frames per batch.
    #[serde(default)]
    pub batch_size: Option<u64>,
}

impl SubmitJobRequest {
    /// Parse into a job spec.
    pub fn into_spec(self) -> Result<JobSpec, SchedulerError> {
        let renderer: RendererKind = self.renderer_kind.parse().map_err(SchedulerError::InvalidJob)?;
        let frames: FrameRange = self.frame_range.parse().map_err(SchedulerError::InvalidJob)?;
        let priority = match self.priority.as_deref() {
            Some(p) => p.parse::<Priority>().map_err(SchedulerError::InvalidJob)?,
            None => Priority::default(),
        };
        if self.batch_size == Some(0) {
            return Err(SchedulerError::InvalidJob("batch_size must be positive".into()));
        }
        let mut spec = JobSpec::new(renderer, frames).with_priority(priority);
        spec.batch_size = self.batch_size;
        if let Some(title) = self.title {
            spec = spec.with_title(title);
        }
        Ok(spec)
    }
}

/// `POST job` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    /// Assigned job identifier.
    pub job_id: JobId,
}

/// Worker `register` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    /// Address the worker listens on.
    pub address: String,
    /// Concurrent batches the worker accepts.
    pub capacity: u32,
    /// Renderer names installed on the worker.
    pub renderer_kinds: Vec<String>,
    /// Available memory hint in bytes.
    #[serde(default)]
    pub mem_available: Option<u64>,
}

impl RegisterWorkerRequest {
    /// Parse into registration info.
    pub fn into_info(self) -> Result<WorkerInfo, SchedulerError> {
        let renderers = self
            .renderer_kinds
            .iter()
            .map(|r| r.parse::<RendererKind>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(SchedulerError::InvalidWorker)?;
        Ok(WorkerInfo {
            address: self.address,
            capacity: self.capacity,
            renderers,
            mem_available: self.mem_available,
        })
    }
}

/// Worker `heartbeat` payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Sender.
    pub worker_id: WorkerId,
    /// Monotonic sequence number.
    pub seq: u64,
    /// Batches running on the worker.
    pub load: u32,
    /// Available memory hint in bytes.
    #[serde(default)]
    pub mem_available: Option<u64>,
    /// CPU and memory readings of the worker host.
    #[serde(default)]
    pub metrics: Option<HostMetrics>,
}

impl From<HeartbeatRequest> for Heartbeat {
    fn from(req: HeartbeatRequest) -> Self {
        Self {
            worker_id: req.worker_id,
            seq: req.seq,
            load: req.load,
            mem_available: req.mem_available,
            metrics: req.metrics,
        }
    }
}

/// Outcome named in a [`ReportRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Batch rendered.
    Succeeded,
    /// Batch failed; `reason` explains why.
    Failed,
}

/// Worker `report` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    /// Batch reported on.
    pub batch_id: BatchId,
    /// Reporting worker.
    pub worker_id: WorkerId,
    /// `attempt` from the assignment being reported.
    pub attempt: u32,
    /// Outcome.
    pub outcome: ReportKind,
    /// Free-text failure message, classified on receipt.
    #[serde(default)]
    pub reason: Option<String>,
    /// Render statistics.
    #[serde(default)]
    pub metrics: Option<RenderMetrics>,
}

impl From<ReportRequest> for BatchReport {
    fn from(req: ReportRequest) -> Self {
        let result = match req.outcome {
            ReportKind::Succeeded => BatchResult::Succeeded,
            ReportKind::Failed => BatchResult::Failed(FailureReason::classify_message(
                req.reason.as_deref().unwrap_or_default(),
            )),
        };
        Self {
            batch_id: req.batch_id,
            worker_id: req.worker_id,
            attempt: req.attempt,
            result,
            metrics: req.metrics,
        }
    }
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Healthy flag.
    pub ok: bool,
    /// Queue and worker counters.
    pub stats: FarmStats,
}

/// Return a health payload.
#[must_use]
pub fn health(scheduler: &Scheduler) -> Health {
    Health {
        ok: true,
        stats: scheduler.stats(),
    }
}

/// Submit a job through a running coordinator.
#[cfg(feature = "tokio-runtime")]
pub async fn submit_job(
    handle: &super::CoordinatorHandle,
    req: SubmitJobRequest,
) -> Result<SubmitJobResponse, SchedulerError> {
    let spec = req.into_spec()?;
    let job_id = handle.submit(spec).await?;
    Ok(SubmitJobResponse { job_id })
}
