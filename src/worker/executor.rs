//! Worker-side seams: the renderer invocation and the coordinator transport.

use std::sync::Arc;

use async_trait::async_trait;

use super::asset_cache::AssetCache;
use crate::core::error::SchedulerError;
use crate::core::job::RenderMetrics;
use crate::core::scheduler::{Assignment, BatchReport, HeartbeatAck, RegisterAck, Scheduler};
use crate::core::worker_registry::{Heartbeat, WorkerInfo};
use crate::util::clock::now_ms;

/// Runs one batch through a renderer.
///
/// Implementations wrap the actual renderer process. The error string is the
/// renderer's failure message; the node classifies it before reporting. On
/// success the returned metrics travel with the report, with
/// `render_time_ms` overwritten by the node's own wall-clock measurement.
///
/// ```rust,ignore
/// struct NukeCli;
///
/// #[async_trait]
/// impl RenderExecutor for NukeCli {
///     fn staging_bytes(&self, _a: &Assignment) -> usize {
///         16 * 1024 * 1024
///     }
///
///     async fn render(&self, a: &Assignment, cache: &AssetCache, staging: &mut [u8]) -> Result<RenderMetrics, String> {
///         let script = cache
///             .get_or_load_async(&a.job_id.to_string(), || fetch_script(a.job_id))
///             .await
///             .map_err(|e| e.to_string())?;
///         let outputs = run_nuke(&script, a.frames, staging).await?;
///         Ok(RenderMetrics {
///             output_files: Some(outputs.len() as u64),
///             ..RenderMetrics::default()
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait RenderExecutor: Send + Sync + 'static {
    /// Staging buffer size a batch needs.
    fn staging_bytes(&self, assignment: &Assignment) -> usize;

    /// Render the assignment's frames.
    async fn render(
        &self,
        assignment: &Assignment,
        cache: &AssetCache,
        staging: &mut [u8],
    ) -> Result<RenderMetrics, String>;
}

/// Transport from a worker to the coordinator.
#[async_trait]
pub trait CoordinatorLink: Send + Sync + 'static {
    /// Register on first contact.
    async fn register(&self, info: WorkerInfo) -> Result<RegisterAck, SchedulerError>;
    /// Send a heartbeat and receive current assignments.
    async fn heartbeat(&self, hb: Heartbeat) -> Result<HeartbeatAck, SchedulerError>;
    /// Report a batch outcome.
    async fn report(&self, report: BatchReport) -> Result<(), SchedulerError>;
}

/// In-process link straight to a scheduler.
#[async_trait]
impl CoordinatorLink for Arc<Scheduler> {
    async fn register(&self, info: WorkerInfo) -> Result<RegisterAck, SchedulerError> {
        self.register_worker(info, now_ms())
    }

    async fn heartbeat(&self, hb: Heartbeat) -> Result<HeartbeatAck, SchedulerError> {
        Scheduler::heartbeat(self, &hb, now_ms())
    }

    async fn report(&self, report: BatchReport) -> Result<(), SchedulerError> {
        Scheduler::report(self, &report, now_ms()).map(|_| ())
    }
}

#[cfg(feature = "tokio-runtime")]
#[async_trait]
impl CoordinatorLink for crate::runtime::CoordinatorHandle {
    async fn register(&self, info: WorkerInfo) -> Result<RegisterAck, SchedulerError> {
        Self::register(self, info).await
    }

    async fn heartbeat(&self, hb: Heartbeat) -> Result<HeartbeatAck, SchedulerError> {
        Self::heartbeat(self, hb).await
    }

    async fn report(&self, report: BatchReport) -> Result<(), SchedulerError> {
        Self::report(self, report).await.map(|_| ())
    }
}
