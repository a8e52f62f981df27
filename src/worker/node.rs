//! Worker-side agent: heartbeats, picks up assignments, runs them, reports.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;

use super::asset_cache::AssetCache;
use super::buffer_pool::{BufferPool, BufferSlot, PoolError};
use super::executor::{CoordinatorLink, RenderExecutor};
use super::memory::HostSampler;
use crate::core::error::SchedulerError;
use crate::core::job::RenderMetrics;
use crate::core::retry::FailureReason;
use crate::core::scheduler::{Assignment, BatchReport, BatchResult};
use crate::core::worker_registry::{Heartbeat, WorkerInfo};
use crate::util::serde::{BatchId, RendererKind, WorkerId};

/// Static node settings.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Address announced at registration.
    pub address: String,
    /// Renderers installed locally.
    pub renderers: Vec<RendererKind>,
    /// Concurrent batches to advertise.
    pub capacity: u32,
    /// Memory hint sent at registration, and with heartbeats unless
    /// `sample_host` replaces it with a fresh reading.
    pub mem_available: Option<u64>,
    /// Sample host CPU and memory before every heartbeat.
    pub sample_host: bool,
    /// Attempts to obtain a staging buffer before giving up.
    pub slot_retry_limit: u32,
    /// Pause between buffer attempts.
    pub slot_retry_delay: Duration,
    /// Heartbeat period used until the coordinator announces its own.
    pub heartbeat_interval: Duration,
}

#[derive(Default)]
struct NodeState {
    worker_id: Option<WorkerId>,
    seq: u64,
    heartbeat_interval: Option<Duration>,
    // Keyed by dispatch epoch so a re-dispatch of a batch still running
    // from an earlier attempt starts fresh.
    running: HashSet<(BatchId, u32)>,
}

/// A render node.
pub struct WorkerNode<L, E> {
    link: L,
    executor: E,
    cache: Arc<AssetCache>,
    buffers: BufferPool,
    settings: NodeSettings,
    sampler: Option<Mutex<HostSampler>>,
    state: Mutex<NodeState>,
}

impl<L, E> WorkerNode<L, E>
where
    L: CoordinatorLink,
    E: RenderExecutor,
{
    /// Assemble a node.
    pub fn new(link: L, executor: E, cache: Arc<AssetCache>, buffers: BufferPool, settings: NodeSettings) -> Self {
        Self {
            link,
            executor,
            cache,
            buffers,
            sampler: settings.sample_host.then(|| Mutex::new(HostSampler::new())),
            settings,
            state: Mutex::new(NodeState::default()),
        }
    }

    /// Identifier assigned at registration.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.state.lock().worker_id
    }

    /// Batches currently executing.
    pub fn in_flight(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Shared asset cache.
    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }

    /// Register with the coordinator.
    pub async fn register(&self) -> Result<WorkerId, SchedulerError> {
        let ack = self
            .link
            .register(WorkerInfo {
                address: self.settings.address.clone(),
                capacity: self.settings.capacity,
                renderers: self.settings.renderers.clone(),
                mem_available: self.settings.mem_available,
            })
            .await?;
        let mut state = self.state.lock();
        state.worker_id = Some(ack.worker_id);
        state.seq = 0;
        state.heartbeat_interval = Some(Duration::from_millis(ack.heartbeat_interval_ms));
        tracing::info!(worker_id = %ack.worker_id, state = %ack.state, "registered with coordinator");
        Ok(ack.worker_id)
    }

    /// Send one heartbeat and start every assignment not already running.
    /// Returns the batches started.
    pub async fn sync_once(self: &Arc<Self>) -> Result<Vec<BatchId>, SchedulerError> {
        let metrics = self.sampler.as_ref().map(|s| s.lock().sample());
        let hb = {
            let mut state = self.state.lock();
            let worker_id = state
                .worker_id
                .ok_or_else(|| SchedulerError::InvalidWorker("node is not registered".into()))?;
            state.seq += 1;
            Heartbeat {
                worker_id,
                seq: state.seq,
                load: u32::try_from(state.running.len()).unwrap_or(u32::MAX),
                mem_available: metrics
                    .map(|m| m.memory_available_bytes)
                    .or(self.settings.mem_available),
                metrics,
            }
        };
        let ack = self.link.heartbeat(hb).await?;

        let fresh: Vec<Assignment> = {
            let mut state = self.state.lock();
            ack.assignments
                .into_iter()
                .filter(|a| state.running.insert((a.batch_id, a.attempt)))
                .collect()
        };
        let started = fresh.iter().map(|a| a.batch_id).collect();
        for assignment in fresh {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.run_batch(assignment).await;
            });
        }
        Ok(started)
    }

    /// Execute one assignment and report the outcome.
    pub async fn run_batch(&self, assignment: Assignment) -> BatchResult {
        let (result, metrics) = match self.acquire_staging(&assignment).await {
            Ok(mut slot) => {
                let started = Instant::now();
                let rendered = self.executor.render(&assignment, &self.cache, &mut slot).await;
                let render_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                match rendered {
                    Ok(metrics) => (BatchResult::Succeeded, RenderMetrics { render_time_ms, ..metrics }),
                    Err(message) => (
                        BatchResult::Failed(FailureReason::classify_message(&message)),
                        RenderMetrics {
                            render_time_ms,
                            ..RenderMetrics::default()
                        },
                    ),
                }
            }
            Err(e) => {
                tracing::warn!(batch_id = %assignment.batch_id, error = %e, "no staging buffer; batch not rendered");
                let result = BatchResult::Failed(FailureReason::ResourceExhausted(e.to_string()));
                self.send_report(&assignment, BatchReport::new(&assignment, result.clone()))
                    .await;
                return result;
            }
        };
        match &result {
            BatchResult::Succeeded => {
                tracing::info!(
                    batch_id = %assignment.batch_id,
                    frames = %assignment.frames,
                    render_time_ms = metrics.render_time_ms,
                    "batch rendered"
                );
            }
            BatchResult::Failed(reason) => {
                tracing::warn!(batch_id = %assignment.batch_id, reason = %reason, "batch failed");
            }
        }

        let report = BatchReport::new(&assignment, result.clone()).with_metrics(metrics);
        self.send_report(&assignment, report).await;
        result
    }

    async fn send_report(&self, assignment: &Assignment, report: BatchReport) {
        if let Err(e) = self.link.report(report).await {
            tracing::warn!(batch_id = %assignment.batch_id, attempt = assignment.attempt, error = %e, "report rejected");
        }
        self.state
            .lock()
            .running
            .remove(&(assignment.batch_id, assignment.attempt));
    }

    async fn acquire_staging(&self, assignment: &Assignment) -> Result<BufferSlot, PoolError> {
        let len = self.executor.staging_bytes(assignment);
        let mut attempt = 0;
        loop {
            match self.buffers.try_acquire_for(len) {
                Ok(slot) => return Ok(slot),
                Err(PoolError::Exhausted { class }) if attempt < self.settings.slot_retry_limit => {
                    attempt += 1;
                    tracing::debug!(class, attempt, "staging buffer busy; retrying");
                    tokio::time::sleep(self.settings.slot_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Register, then heartbeat until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        if self.worker_id().is_none() {
            self.register().await?;
        }
        let interval = self
            .state
            .lock()
            .heartbeat_interval
            .unwrap_or(self.settings.heartbeat_interval);
        // Two beats per suspect window.
        let mut ticker = tokio::time::interval((interval / 2).max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.sync_once().await {
                        Ok(started) if !started.is_empty() => {
                            tracing::debug!(started = started.len(), "picked up assignments");
                        }
                        Ok(_) => {}
                        Err(SchedulerError::UnknownWorker(_)) => {
                            tracing::warn!("coordinator forgot this worker; registering again");
                            self.register().await?;
                        }
                        Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
                    }
                }
            }
        }
        tracing::info!("worker node stopped");
        Ok(())
    }
}
