//! Scheduler/dispatcher: the single authority over job, batch, and worker
//! transitions.
//!
//! The job queue and the worker registry each sit behind their own mutex.
//! Every operation that moves a batch takes both, always queue first, so a
//! batch transition and the matching load change are observed together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::audit::{build_audit_event, AuditEntity, AuditSink};
use crate::core::error::SchedulerError;
use crate::core::job::{Batch, BatchStatus, Job, JobSpec, JobStatus, RenderMetrics};
use crate::core::job_queue::{AckEffect, BatchOutcome, CancelEffect, JobQueue, QueueLimits};
use crate::core::retry::{FailureReason, RetryDecision, RetryManager};
use crate::core::worker_registry::{
    Heartbeat, LivenessChange, LivenessState, LivenessTimeouts, Worker, WorkerInfo, WorkerRegistry,
};
use crate::infra::store::{StateStore, StoreSnapshot};
use crate::util::clock::duration_ms;
use crate::util::serde::{BatchId, FrameRange, JobId, Priority, RendererKind, WorkerId};

/// Per-batch execution deadline: a base timeout scaled per renderer.
#[derive(Debug, Clone)]
pub struct DispatchTimeouts {
    /// Base timeout.
    pub base: Duration,
    /// Multiplier per renderer; missing entries use 1.0.
    pub multipliers: HashMap<RendererKind, f64>,
}

impl DispatchTimeouts {
    /// Deadline for a batch of `renderer`.
    #[must_use]
    pub fn for_renderer(&self, renderer: RendererKind) -> Duration {
        let factor = self.multipliers.get(&renderer).copied().unwrap_or(1.0);
        self.base.mul_f64(factor)
    }
}

impl Default for DispatchTimeouts {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3_600),
            multipliers: HashMap::new(),
        }
    }
}

/// A batch handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Batch to render.
    pub batch_id: BatchId,
    /// Parent job.
    pub job_id: JobId,
    /// Worker holding the assignment.
    pub worker_id: WorkerId,
    /// Renderer to use.
    pub renderer: RendererKind,
    /// Frames to render.
    pub frames: FrameRange,
    /// Failed or lost attempts before this one.
    pub attempt: u32,
}

impl Assignment {
    fn of(batch: &Batch, worker_id: WorkerId) -> Self {
        Self {
            batch_id: batch.id,
            job_id: batch.job_id,
            worker_id,
            renderer: batch.renderer,
            frames: batch.frames,
            attempt: batch.attempts,
        }
    }
}

/// Final result of a batch execution as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchResult {
    /// Rendered successfully.
    Succeeded,
    /// Failed with a classified reason.
    Failed(FailureReason),
}

/// A worker's report for one dispatched batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Batch reported on.
    pub batch_id: BatchId,
    /// Reporting worker.
    pub worker_id: WorkerId,
    /// Dispatch epoch the report belongs to; see [`Assignment::attempt`].
    pub attempt: u32,
    /// Outcome.
    pub result: BatchResult,
    /// Render statistics, when the worker measured any.
    #[serde(default)]
    pub metrics: Option<RenderMetrics>,
}

impl BatchReport {
    /// Report `result` for the dispatch described by `assignment`.
    #[must_use]
    pub fn new(assignment: &Assignment, result: BatchResult) -> Self {
        Self {
            batch_id: assignment.batch_id,
            worker_id: assignment.worker_id,
            attempt: assignment.attempt,
            result,
            metrics: None,
        }
    }

    /// Attach render statistics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: RenderMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Reply to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    /// Assigned identifier.
    pub worker_id: WorkerId,
    /// Initial liveness state.
    pub state: LivenessState,
    /// How often the worker must heartbeat.
    pub heartbeat_interval_ms: u64,
}

/// Reply to a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Liveness state after the heartbeat.
    pub state: LivenessState,
    /// Batches currently dispatched to the worker.
    pub assignments: Vec<Assignment>,
}

/// What one liveness sweep did.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Liveness transitions.
    pub changes: Vec<LivenessChange>,
    /// Batches reclaimed from offline or removed workers.
    pub reclaimed: usize,
    /// Batches reclaimed because their deadline passed.
    pub timed_out: usize,
    /// Jobs dropped by retention cleanup.
    pub purged: usize,
}

impl SweepReport {
    /// Whether the sweep may have freed work for dispatch.
    #[must_use]
    pub const fn freed_work(&self) -> bool {
        self.reclaimed > 0 || self.timed_out > 0
    }
}

/// Per-batch progress within a [`JobView`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchView {
    /// Batch identifier.
    pub id: BatchId,
    /// Position in the job.
    pub index: u32,
    /// Frames covered.
    pub frames: FrameRange,
    /// Current status.
    pub status: BatchStatus,
    /// Worker running it, if dispatched.
    pub worker: Option<WorkerId>,
    /// Failed or lost attempts so far.
    pub attempts: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Statistics from the last reported execution.
    pub metrics: Option<RenderMetrics>,
}

/// Status snapshot of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    /// Job identifier.
    pub id: JobId,
    /// Title.
    pub title: String,
    /// Renderer.
    pub renderer: RendererKind,
    /// Priority.
    pub priority: Priority,
    /// Full frame range.
    pub frames: FrameRange,
    /// Derived status.
    pub status: JobStatus,
    /// Completed batches as a percentage of all batches.
    pub progress: f64,
    /// Retries across all batches.
    pub retry_count: u32,
    /// Reason of the first permanently failed batch.
    pub failure_reason: Option<String>,
    /// Submission time.
    pub created_at_ms: u128,
    /// Terminal time.
    pub finished_at_ms: Option<u128>,
    /// Per-batch progress.
    pub batches: Vec<BatchView>,
}

/// Coarse counters for health output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmStats {
    /// Non-terminal jobs.
    pub active_jobs: usize,
    /// Pending batches.
    pub pending_batches: usize,
    /// Known workers.
    pub workers: usize,
    /// Workers in the `Active` state.
    pub active_workers: usize,
}

/// Coordinator state machine.
pub struct Scheduler {
    queue: Mutex<JobQueue>,
    registry: Mutex<WorkerRegistry>,
    retry: RetryManager,
    timeouts: DispatchTimeouts,
    store: Arc<dyn StateStore>,
    audit: Option<Arc<Mutex<dyn AuditSink>>>,
}

impl Scheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new(
        limits: QueueLimits,
        liveness: LivenessTimeouts,
        retry: RetryManager,
        timeouts: DispatchTimeouts,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            queue: Mutex::new(JobQueue::new(limits)),
            registry: Mutex::new(WorkerRegistry::new(liveness)),
            retry,
            timeouts,
            store,
            audit: None,
        }
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, sink: Arc<Mutex<dyn AuditSink>>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Expected heartbeat period.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.registry.lock().timeouts().heartbeat_interval
    }

    // ---- jobs ----

    /// Admit a job and split it into pending batches.
    pub fn submit(&self, spec: &JobSpec, now_ms: u128) -> Result<JobId, SchedulerError> {
        let mut queue = self.queue.lock();
        let job_id = queue.submit(spec, now_ms)?;
        self.persist_job_tree(&queue, job_id);
        self.audit(job_id, AuditEntity::Job, "submit", Some(spec.frames.to_string()));
        Ok(job_id)
    }

    /// Cancel a job.
    pub fn cancel(&self, job_id: JobId, now_ms: u128) -> Result<CancelEffect, SchedulerError> {
        let mut queue = self.queue.lock();
        let effect = queue.cancel(job_id, now_ms)?;
        self.persist_job(&queue, job_id);
        for id in &effect.cancelled {
            self.persist_batch(&queue, *id);
        }
        self.audit(job_id, AuditEntity::Job, "cancel", None);
        Ok(effect)
    }

    /// Hold a job back from dispatch.
    pub fn pause(&self, job_id: JobId, now_ms: u128) -> Result<JobStatus, SchedulerError> {
        let mut queue = self.queue.lock();
        let status = queue.pause(job_id, now_ms)?;
        self.persist_job(&queue, job_id);
        self.audit(job_id, AuditEntity::Job, "pause", None);
        Ok(status)
    }

    /// Release a paused job.
    pub fn resume(&self, job_id: JobId, now_ms: u128) -> Result<JobStatus, SchedulerError> {
        let mut queue = self.queue.lock();
        let status = queue.resume(job_id, now_ms)?;
        self.persist_job(&queue, job_id);
        self.audit(job_id, AuditEntity::Job, "resume", None);
        Ok(status)
    }

    /// Pause every unfinished job. Returns how many changed.
    pub fn pause_all(&self, now_ms: u128) -> usize {
        let mut queue = self.queue.lock();
        let ids = queue.pause_all(now_ms);
        for id in &ids {
            self.persist_job(&queue, *id);
        }
        tracing::info!(jobs = ids.len(), "paused all jobs");
        ids.len()
    }

    /// Resume every paused job. Returns how many changed.
    pub fn resume_all(&self, now_ms: u128) -> usize {
        let mut queue = self.queue.lock();
        let ids = queue.resume_all(now_ms);
        for id in &ids {
            self.persist_job(&queue, *id);
        }
        tracing::info!(jobs = ids.len(), "resumed all jobs");
        ids.len()
    }

    /// Status and per-batch progress of a job.
    pub fn job_status(&self, job_id: JobId) -> Result<JobView, SchedulerError> {
        let queue = self.queue.lock();
        let job = queue.job(job_id).ok_or(SchedulerError::UnknownJob(job_id))?;
        Ok(Self::view(job, &queue.batches_of(job_id)))
    }

    /// Status of every job, oldest first.
    #[must_use]
    pub fn jobs(&self) -> Vec<JobView> {
        let queue = self.queue.lock();
        queue
            .jobs()
            .into_iter()
            .map(|job| Self::view(job, &queue.batches_of(job.id)))
            .collect()
    }

    /// Snapshot of a single batch.
    #[must_use]
    pub fn batch(&self, batch_id: BatchId) -> Option<Batch> {
        self.queue.lock().batch(batch_id).cloned()
    }

    #[allow(clippy::cast_precision_loss)]
    fn view(job: &Job, batches: &[&Batch]) -> JobView {
        let completed = batches
            .iter()
            .filter(|b| b.status == BatchStatus::Completed)
            .count();
        let progress = if batches.is_empty() {
            0.0
        } else {
            completed as f64 / batches.len() as f64 * 100.0
        };
        JobView {
            id: job.id,
            title: job.title.clone(),
            renderer: job.renderer,
            priority: job.priority,
            frames: job.frames,
            status: job.status,
            progress,
            retry_count: job.retry_count,
            failure_reason: job.failure_reason.clone(),
            created_at_ms: job.created_at_ms,
            finished_at_ms: job.finished_at_ms,
            batches: batches
                .iter()
                .map(|b| BatchView {
                    id: b.id,
                    index: b.index,
                    frames: b.frames,
                    status: b.status,
                    worker: b.worker,
                    attempts: b.attempts,
                    last_error: b.last_error.clone(),
                    metrics: b.metrics.clone(),
                })
                .collect(),
        }
    }

    // ---- workers ----

    /// Register a worker.
    pub fn register_worker(&self, info: WorkerInfo, now_ms: u128) -> Result<RegisterAck, SchedulerError> {
        let mut registry = self.registry.lock();
        let worker_id = registry.register(info, now_ms)?;
        let state = registry
            .get(worker_id)
            .map_or(LivenessState::Registered, |w| w.state);
        self.persist_worker(&registry, worker_id);
        self.audit(worker_id, AuditEntity::Worker, "register", None);
        let interval = registry.timeouts().heartbeat_interval;
        Ok(RegisterAck {
            worker_id,
            state,
            heartbeat_interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Update a worker's declared capacity.
    pub fn set_capacity(&self, worker_id: WorkerId, capacity: u32) -> Result<LivenessState, SchedulerError> {
        let mut registry = self.registry.lock();
        let state = registry.set_capacity(worker_id, capacity)?;
        self.persist_worker(&registry, worker_id);
        Ok(state)
    }

    /// Apply a heartbeat and return the worker's current assignments.
    pub fn heartbeat(&self, hb: &Heartbeat, now_ms: u128) -> Result<HeartbeatAck, SchedulerError> {
        let queue = self.queue.lock();
        let mut registry = self.registry.lock();
        let state = registry.heartbeat(hb, now_ms)?;
        self.persist_worker(&registry, hb.worker_id);
        let assignments = queue
            .dispatched_to(hb.worker_id)
            .into_iter()
            .map(|b| Assignment::of(b, hb.worker_id))
            .collect();
        Ok(HeartbeatAck { state, assignments })
    }

    /// Remove a worker now; its batches go back to the queue.
    pub fn deregister(&self, worker_id: WorkerId, now_ms: u128) -> Result<Vec<BatchId>, SchedulerError> {
        let mut queue = self.queue.lock();
        let mut registry = self.registry.lock();
        let change = registry.deregister(worker_id)?;
        for batch_id in &change.reclaimed {
            self.reclaim(&mut queue, *batch_id, worker_id, &FailureReason::WorkerLost, now_ms);
        }
        if let Err(e) = self.store.remove_worker(worker_id) {
            tracing::error!(worker_id = %worker_id, error = %e, "store write failed");
        }
        self.audit(worker_id, AuditEntity::Worker, "deregister", None);
        Ok(change.reclaimed)
    }

    /// Batches currently dispatched to a worker.
    pub fn assignments_for(&self, worker_id: WorkerId) -> Result<Vec<Assignment>, SchedulerError> {
        let queue = self.queue.lock();
        let registry = self.registry.lock();
        if registry.get(worker_id).is_none() {
            return Err(SchedulerError::UnknownWorker(worker_id));
        }
        Ok(queue
            .dispatched_to(worker_id)
            .into_iter()
            .map(|b| Assignment::of(b, worker_id))
            .collect())
    }

    /// Snapshot of every worker in registration order.
    #[must_use]
    pub fn workers(&self) -> Vec<Worker> {
        self.registry.lock().workers().into_iter().cloned().collect()
    }

    /// Snapshot of one worker.
    #[must_use]
    pub fn worker(&self, worker_id: WorkerId) -> Option<Worker> {
        self.registry.lock().get(worker_id).cloned()
    }

    // ---- dispatch ----

    /// Match pending batches to free worker capacity.
    ///
    /// Each pass walks schedulable workers by free capacity (descending, ties
    /// by registration order) and gives each at most one batch; passes repeat
    /// until nothing more can be placed. Safe to call concurrently and
    /// repeatedly.
    pub fn tick(&self, now_ms: u128) -> Vec<Assignment> {
        let mut queue = self.queue.lock();
        let mut registry = self.registry.lock();
        let mut placed = Vec::new();

        loop {
            let candidates: Vec<(WorkerId, Vec<RendererKind>)> = registry
                .candidates()
                .into_iter()
                .map(|w| (w.id, w.renderers.clone()))
                .collect();
            let mut progressed = false;
            for (worker_id, renderers) in candidates {
                let Some(batch_id) = queue.peek_next(&renderers, now_ms).map(|b| b.id) else {
                    continue;
                };
                if let Err(e) = registry.assign(worker_id, batch_id) {
                    tracing::warn!(worker_id = %worker_id, batch_id = %batch_id, error = %e, "assignment refused");
                    continue;
                }
                match queue.dispatch(batch_id, worker_id, now_ms) {
                    Ok(batch) => {
                        let assignment = Assignment::of(batch, worker_id);
                        tracing::info!(
                            batch_id = %batch_id,
                            job_id = %assignment.job_id,
                            worker_id = %worker_id,
                            frames = %assignment.frames,
                            attempt = assignment.attempt,
                            "batch dispatched"
                        );
                        placed.push(assignment);
                        progressed = true;
                    }
                    Err(e) => {
                        registry.release(worker_id, batch_id);
                        tracing::error!(batch_id = %batch_id, error = %e, "dispatch rejected");
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        for assignment in &placed {
            self.persist_batch(&queue, assignment.batch_id);
            self.persist_job(&queue, assignment.job_id);
            self.persist_worker(&registry, assignment.worker_id);
            self.audit(
                assignment.batch_id,
                AuditEntity::Batch,
                "dispatch",
                Some(assignment.worker_id.to_string()),
            );
        }
        placed
    }

    /// Apply a worker's report for a dispatched batch.
    pub fn report(&self, report: &BatchReport, now_ms: u128) -> Result<AckEffect, SchedulerError> {
        let mut queue = self.queue.lock();
        let mut registry = self.registry.lock();
        let batch = queue
            .batch(report.batch_id)
            .ok_or(SchedulerError::UnknownBatch(report.batch_id))?;
        if batch.status != BatchStatus::Dispatched
            || batch.worker != Some(report.worker_id)
            || batch.attempts != report.attempt
        {
            tracing::warn!(
                batch_id = %report.batch_id,
                worker_id = %report.worker_id,
                status = ?batch.status,
                attempt = report.attempt,
                current_attempt = batch.attempts,
                "stale report rejected"
            );
            return Err(SchedulerError::StaleReport {
                batch: report.batch_id,
                worker: report.worker_id,
            });
        }
        let outcome = match &report.result {
            BatchResult::Succeeded => BatchOutcome::Completed,
            BatchResult::Failed(reason) => self.decide(batch, reason, now_ms),
        };
        if let Some(metrics) = &report.metrics {
            queue.record_metrics(report.batch_id, metrics.clone())?;
        }
        let effect = queue.ack(report.batch_id, report.worker_id, outcome, now_ms)?;
        registry.release(report.worker_id, report.batch_id);

        self.persist_ack(&queue, report.batch_id, &effect);
        self.persist_worker(&registry, report.worker_id);
        let action = match &report.result {
            BatchResult::Succeeded => "complete",
            BatchResult::Failed(_) => "fail",
        };
        self.audit(report.batch_id, AuditEntity::Batch, action, None);
        Ok(effect)
    }

    /// Advance worker liveness, reclaim lost or overdue batches, and purge
    /// expired jobs.
    pub fn sweep(&self, now_ms: u128) -> SweepReport {
        let mut queue = self.queue.lock();
        let mut registry = self.registry.lock();
        let mut report = SweepReport {
            changes: registry.mark_dead_if_stale(now_ms),
            ..SweepReport::default()
        };

        for change in &report.changes {
            for batch_id in &change.reclaimed {
                self.reclaim(&mut queue, *batch_id, change.worker, &FailureReason::WorkerLost, now_ms);
                report.reclaimed += 1;
            }
            if change.to == LivenessState::Removed {
                if let Err(e) = self.store.remove_worker(change.worker) {
                    tracing::error!(worker_id = %change.worker, error = %e, "store write failed");
                }
            } else {
                self.persist_worker(&registry, change.worker);
            }
            self.audit(change.worker, AuditEntity::Worker, change.to.to_string(), None);
        }

        let overdue = queue.overdue(now_ms, |b| self.timeouts.for_renderer(b.renderer));
        for (batch_id, worker_id) in overdue {
            tracing::warn!(batch_id = %batch_id, worker_id = %worker_id, "batch exceeded dispatch timeout");
            registry.release(worker_id, batch_id);
            self.persist_worker(&registry, worker_id);
            self.reclaim(&mut queue, batch_id, worker_id, &FailureReason::Timeout, now_ms);
            report.timed_out += 1;
        }

        for job_id in queue.purge(now_ms) {
            if let Err(e) = self.store.remove_job(job_id) {
                tracing::error!(job_id = %job_id, error = %e, "store write failed");
            }
            report.purged += 1;
        }
        report
    }

    /// Rebuild from a store snapshot. Batches dispatched to workers that no
    /// longer exist are reclaimed.
    pub fn restore(&self, snapshot: StoreSnapshot, now_ms: u128) {
        let mut queue = self.queue.lock();
        let mut registry = self.registry.lock();
        queue.restore(snapshot.jobs, snapshot.batches);
        registry.restore(snapshot.workers, now_ms);

        let orphaned: Vec<(BatchId, WorkerId)> = queue
            .jobs()
            .into_iter()
            .flat_map(|job| queue.batches_of(job.id))
            .filter(|b| b.status == BatchStatus::Dispatched)
            .filter_map(|b| b.worker.map(|w| (b.id, w)))
            .filter(|(batch_id, worker_id)| {
                registry
                    .get(*worker_id)
                    .is_none_or(|w| !w.assignments.contains(batch_id))
            })
            .collect();
        for (batch_id, worker_id) in orphaned {
            registry.release(worker_id, batch_id);
            self.reclaim(&mut queue, batch_id, worker_id, &FailureReason::WorkerLost, now_ms);
        }
    }

    /// Coarse counters.
    #[must_use]
    pub fn stats(&self) -> FarmStats {
        let queue = self.queue.lock();
        let registry = self.registry.lock();
        FarmStats {
            active_jobs: queue.active_jobs(),
            pending_batches: queue.pending_len(),
            workers: registry.len(),
            active_workers: registry
                .workers()
                .iter()
                .filter(|w| w.state == LivenessState::Active)
                .count(),
        }
    }

    /// Wait until the store has made every write so far durable.
    pub fn flush_store(&self) -> Result<(), SchedulerError> {
        self.store.flush()
    }

    // ---- internals ----

    fn decide(&self, batch: &Batch, reason: &FailureReason, now_ms: u128) -> BatchOutcome {
        match self.retry.on_failure(batch, reason) {
            RetryDecision::Requeue { delay } => {
                tracing::warn!(
                    batch_id = %batch.id,
                    attempts = batch.attempts + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason = %reason,
                    "batch requeued"
                );
                BatchOutcome::Retry {
                    not_before_ms: now_ms + duration_ms(delay),
                    reason: reason.to_string(),
                }
            }
            RetryDecision::FailJob => BatchOutcome::Failed {
                reason: reason.to_string(),
            },
        }
    }

    /// Route a lost batch through the retry policy. The registry side must
    /// already have dropped the assignment.
    fn reclaim(
        &self,
        queue: &mut JobQueue,
        batch_id: BatchId,
        worker_id: WorkerId,
        reason: &FailureReason,
        now_ms: u128,
    ) {
        let Some(batch) = queue.batch(batch_id) else {
            return;
        };
        if batch.status != BatchStatus::Dispatched || batch.worker != Some(worker_id) {
            return;
        }
        let outcome = self.decide(batch, reason, now_ms);
        match queue.ack(batch_id, worker_id, outcome, now_ms) {
            Ok(effect) => {
                self.persist_ack(queue, batch_id, &effect);
                self.audit(batch_id, AuditEntity::Batch, "reclaim", Some(reason.to_string()));
            }
            Err(e) => tracing::error!(batch_id = %batch_id, error = %e, "reclaim rejected"),
        }
    }

    fn persist_ack(&self, queue: &JobQueue, batch_id: BatchId, effect: &AckEffect) {
        self.persist_batch(queue, batch_id);
        for id in &effect.cancelled_siblings {
            self.persist_batch(queue, *id);
        }
        self.persist_job(queue, effect.job_id);
    }

    fn persist_job_tree(&self, queue: &JobQueue, job_id: JobId) {
        self.persist_job(queue, job_id);
        for batch in queue.batches_of(job_id) {
            if let Err(e) = self.store.put_batch(batch) {
                tracing::error!(batch_id = %batch.id, error = %e, "store write failed");
            }
        }
    }

    fn persist_job(&self, queue: &JobQueue, job_id: JobId) {
        if let Some(job) = queue.job(job_id) {
            if let Err(e) = self.store.put_job(job) {
                tracing::error!(job_id = %job_id, error = %e, "store write failed");
            }
        }
    }

    fn persist_batch(&self, queue: &JobQueue, batch_id: BatchId) {
        if let Some(batch) = queue.batch(batch_id) {
            if let Err(e) = self.store.put_batch(batch) {
                tracing::error!(batch_id = %batch_id, error = %e, "store write failed");
            }
        }
    }

    fn persist_worker(&self, registry: &WorkerRegistry, worker_id: WorkerId) {
        if let Some(worker) = registry.get(worker_id) {
            if let Err(e) = self.store.put_worker(worker) {
                tracing::error!(worker_id = %worker_id, error = %e, "store write failed");
            }
        }
    }

    fn audit(&self, subject: uuid::Uuid, entity: AuditEntity, action: impl Into<String>, detail: Option<String>) {
        if let Some(sink) = &self.audit {
            sink.lock()
                .record(build_audit_event(subject, entity, action, detail));
        }
    }
}
