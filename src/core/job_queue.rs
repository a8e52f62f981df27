//! Priority-ordered job queue with batch splitting, cancellation, pause, and
//! retention cleanup.
//!
//! Pending batches live in an ordered index keyed by (priority descending,
//! submission sequence ascending). All other batches are reachable through the
//! job table only. The queue is owned by the scheduler behind a mutex; every
//! mutation goes through the methods here.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::core::error::SchedulerError;
use crate::core::job::{derive_job_status, Batch, BatchStatus, Job, JobSpec, JobStatus, RenderMetrics};
use crate::util::clock::duration_ms;
use crate::util::serde::{BatchId, JobId, Priority, RendererKind, WorkerId};

/// Admission and splitting limits.
#[derive(Debug, Clone)]
pub struct QueueLimits {
    /// Smallest batch, in frames.
    pub min_batch_size: u64,
    /// Largest batch, in frames.
    pub max_batch_size: u64,
    /// Batch size used when the submission does not request one.
    pub default_batch_size: u64,
    /// Most batches a single job may split into.
    pub max_batches_per_job: u64,
    /// Maximum number of non-terminal jobs.
    pub max_active_jobs: usize,
    /// How long terminal jobs are kept before purge.
    pub retention: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 100,
            default_batch_size: 10,
            max_batches_per_job: 10_000,
            max_active_jobs: 10_000,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Ordering key for a pending batch: highest priority first, FIFO within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingKey {
    priority: Priority,
    seq: u64,
    batch: BatchId,
}

impl PendingKey {
    const fn of(batch: &Batch) -> Self {
        Self {
            priority: batch.priority,
            seq: batch.seq,
            batch: batch.id,
        }
    }
}

impl PartialOrd for PendingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority sorts first; earlier submission wins within a tier.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.batch.cmp(&other.batch))
    }
}

/// Result a worker (or the scheduler on its behalf) reports for a dispatched batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Rendered successfully.
    Completed,
    /// Return to pending; eligible again at `not_before_ms`.
    Retry {
        /// Earliest dispatch time.
        not_before_ms: u128,
        /// Failure that triggered the retry.
        reason: String,
    },
    /// Fail the batch and its job.
    Failed {
        /// Failure reported to the submitter.
        reason: String,
    },
}

/// What an [`JobQueue::ack`] changed.
#[derive(Debug, Clone)]
pub struct AckEffect {
    /// Parent job.
    pub job_id: JobId,
    /// Worker whose assignment ended.
    pub worker: WorkerId,
    /// Final batch status after the ack.
    pub batch_status: BatchStatus,
    /// Outcome was dropped because the job is already cancelled or failed.
    pub discarded: bool,
    /// Pending siblings cancelled because the job failed.
    pub cancelled_siblings: Vec<BatchId>,
    /// Job status after the ack.
    pub job_status: JobStatus,
}

/// What a [`JobQueue::cancel`] changed.
#[derive(Debug, Clone, Default)]
pub struct CancelEffect {
    /// Batches moved to cancelled.
    pub cancelled: Vec<BatchId>,
    /// Dispatched batches left running; their reports will be discarded.
    pub in_flight: Vec<BatchId>,
}

/// In-memory job table plus pending index.
#[derive(Debug)]
pub struct JobQueue {
    limits: QueueLimits,
    jobs: HashMap<JobId, Job>,
    batches: HashMap<BatchId, Batch>,
    pending: BTreeSet<PendingKey>,
    next_seq: u64,
}

impl JobQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            limits,
            jobs: HashMap::new(),
            batches: HashMap::new(),
            pending: BTreeSet::new(),
            next_seq: 0,
        }
    }

    /// Limits in force.
    #[must_use]
    pub const fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    /// Validate, admit, and split a job. Batches start pending.
    pub fn submit(&mut self, spec: &JobSpec, now_ms: u128) -> Result<JobId, SchedulerError> {
        if spec.frames.start > spec.frames.end {
            return Err(SchedulerError::InvalidJob(format!(
                "frame range {}..{} is inverted",
                spec.frames.start, spec.frames.end
            )));
        }
        if self.active_jobs() >= self.limits.max_active_jobs {
            tracing::warn!(
                active = self.active_jobs(),
                "job rejected: queue full"
            );
            return Err(SchedulerError::QueueFull(format!(
                "{} active jobs",
                self.limits.max_active_jobs
            )));
        }

        let size = spec
            .batch_size
            .unwrap_or(self.limits.default_batch_size)
            .clamp(self.limits.min_batch_size, self.limits.max_batch_size);
        let batch_count = spec.frames.len().div_ceil(size);
        if batch_count > self.limits.max_batches_per_job {
            tracing::warn!(
                frames = %spec.frames,
                batch_size = size,
                batch_count,
                limit = self.limits.max_batches_per_job,
                "job rejected: too many batches"
            );
            return Err(SchedulerError::InvalidJob(format!(
                "{} frames at batch size {size} make {batch_count} batches; limit is {}",
                spec.frames.len(),
                self.limits.max_batches_per_job
            )));
        }

        let mut job = Job::from_spec(spec, now_ms);
        for (index, frames) in spec.frames.split(size).into_iter().enumerate() {
            let index = u32::try_from(index)
                .map_err(|_| SchedulerError::InvalidJob("too many batches".into()))?;
            let batch = Batch::new(&job, index, frames, self.next_seq);
            self.next_seq += 1;
            job.batches.push(batch.id);
            self.pending.insert(PendingKey::of(&batch));
            self.batches.insert(batch.id, batch);
        }

        let job_id = job.id;
        tracing::info!(
            job_id = %job_id,
            renderer = %job.renderer,
            priority = %job.priority,
            frames = %job.frames,
            batches = job.batches.len(),
            batch_size = size,
            "job admitted"
        );
        self.jobs.insert(job_id, job);
        Ok(job_id)
    }

    /// Cancel a job. Pending batches are cancelled; dispatched ones keep
    /// running and their eventual report is discarded.
    pub fn cancel(&mut self, job_id: JobId, now_ms: u128) -> Result<CancelEffect, SchedulerError> {
        let job = self.jobs.get_mut(&job_id).ok_or(SchedulerError::UnknownJob(job_id))?;
        match job.status {
            JobStatus::Cancelled => return Ok(CancelEffect::default()),
            JobStatus::Completed | JobStatus::Failed => {
                return Err(SchedulerError::JobFinished {
                    job: job_id,
                    state: job.status.to_string(),
                })
            }
            _ => {}
        }
        job.cancelled = true;
        let ids = job.batches.clone();

        let mut effect = CancelEffect::default();
        for id in ids {
            let Some(batch) = self.batches.get_mut(&id) else { continue };
            match batch.status {
                BatchStatus::Pending => {
                    self.pending.remove(&PendingKey::of(batch));
                    batch.status = BatchStatus::Cancelled;
                    batch.finished_at_ms = Some(now_ms);
                    effect.cancelled.push(id);
                }
                BatchStatus::Dispatched => effect.in_flight.push(id),
                _ => {}
            }
        }
        self.recompute(job_id, now_ms);
        tracing::info!(
            job_id = %job_id,
            cancelled = effect.cancelled.len(),
            in_flight = effect.in_flight.len(),
            "job cancelled"
        );
        Ok(effect)
    }

    /// Highest-priority eligible pending batch a worker supporting `renderers`
    /// can run.
    #[must_use]
    pub fn peek_next(&self, renderers: &[RendererKind], now_ms: u128) -> Option<&Batch> {
        self.pending
            .iter()
            .filter_map(|key| self.batches.get(&key.batch))
            .find(|batch| {
                batch.is_eligible(now_ms)
                    && renderers.contains(&batch.renderer)
                    && self.jobs.get(&batch.job_id).is_some_and(|j| !j.paused && !j.cancelled)
            })
    }

    /// Move a batch `Pending → Dispatched` for `worker`.
    pub fn dispatch(
        &mut self,
        batch_id: BatchId,
        worker: WorkerId,
        now_ms: u128,
    ) -> Result<&Batch, SchedulerError> {
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(SchedulerError::UnknownBatch(batch_id))?;
        if batch.status != BatchStatus::Pending || !self.pending.remove(&PendingKey::of(batch)) {
            tracing::error!(batch_id = %batch_id, status = ?batch.status, "refusing double dispatch");
            return Err(SchedulerError::DoubleDispatch(batch_id));
        }
        batch.status = BatchStatus::Dispatched;
        batch.worker = Some(worker);
        batch.dispatched_at_ms = Some(now_ms);
        let job_id = batch.job_id;
        self.recompute(job_id, now_ms);
        self.batches
            .get(&batch_id)
            .ok_or(SchedulerError::UnknownBatch(batch_id))
    }

    /// Attach render metrics to a batch.
    pub fn record_metrics(&mut self, batch_id: BatchId, metrics: RenderMetrics) -> Result<(), SchedulerError> {
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(SchedulerError::UnknownBatch(batch_id))?;
        batch.metrics = Some(metrics);
        Ok(())
    }

    /// Apply the outcome of a dispatched batch reported by (or on behalf of) `worker`.
    pub fn ack(
        &mut self,
        batch_id: BatchId,
        worker: WorkerId,
        outcome: BatchOutcome,
        now_ms: u128,
    ) -> Result<AckEffect, SchedulerError> {
        let batch = self
            .batches
            .get_mut(&batch_id)
            .ok_or(SchedulerError::UnknownBatch(batch_id))?;
        if batch.status != BatchStatus::Dispatched || batch.worker != Some(worker) {
            return Err(SchedulerError::StaleReport {
                batch: batch_id,
                worker,
            });
        }
        let job_id = batch.job_id;
        let job = self.jobs.get_mut(&job_id).ok_or(SchedulerError::UnknownJob(job_id))?;
        let job_closed = job.cancelled || job.status == JobStatus::Failed;

        batch.worker = None;
        let mut discarded = false;
        let mut failed_reason = None;
        match outcome {
            _ if job.cancelled => {
                batch.status = BatchStatus::Cancelled;
                batch.finished_at_ms = Some(now_ms);
                discarded = true;
            }
            BatchOutcome::Completed => {
                batch.status = BatchStatus::Completed;
                batch.finished_at_ms = Some(now_ms);
            }
            BatchOutcome::Retry { reason, .. } if job_closed => {
                batch.status = BatchStatus::Cancelled;
                batch.finished_at_ms = Some(now_ms);
                batch.last_error = Some(reason);
                discarded = true;
            }
            BatchOutcome::Retry {
                not_before_ms,
                reason,
            } => {
                batch.status = BatchStatus::Pending;
                batch.attempts += 1;
                batch.not_before_ms = not_before_ms;
                batch.last_error = Some(reason);
                job.retry_count += 1;
                self.pending.insert(PendingKey::of(batch));
            }
            BatchOutcome::Failed { reason } => {
                batch.status = BatchStatus::Failed;
                batch.finished_at_ms = Some(now_ms);
                batch.attempts += 1;
                batch.last_error = Some(reason.clone());
                if job.failure_reason.is_none() {
                    job.failure_reason = Some(reason);
                }
                failed_reason = job.failure_reason.clone();
            }
        }
        let batch_status = batch.status;

        let mut cancelled_siblings = Vec::new();
        if failed_reason.is_some() {
            let siblings = job.batches.clone();
            for id in siblings {
                let Some(sibling) = self.batches.get_mut(&id) else { continue };
                if sibling.status == BatchStatus::Pending {
                    self.pending.remove(&PendingKey::of(sibling));
                    sibling.status = BatchStatus::Cancelled;
                    sibling.finished_at_ms = Some(now_ms);
                    cancelled_siblings.push(id);
                }
            }
            tracing::warn!(
                job_id = %job_id,
                batch_id = %batch_id,
                reason = failed_reason.as_deref().unwrap_or_default(),
                cancelled = cancelled_siblings.len(),
                "job failed"
            );
        }

        let job_status = self.recompute(job_id, now_ms);
        Ok(AckEffect {
            job_id,
            worker,
            batch_status,
            discarded,
            cancelled_siblings,
            job_status,
        })
    }

    /// Hold a job's pending batches back from dispatch.
    pub fn pause(&mut self, job_id: JobId, now_ms: u128) -> Result<JobStatus, SchedulerError> {
        self.set_paused(job_id, true, now_ms)
    }

    /// Make a paused job dispatchable again.
    pub fn resume(&mut self, job_id: JobId, now_ms: u128) -> Result<JobStatus, SchedulerError> {
        self.set_paused(job_id, false, now_ms)
    }

    /// Pause every non-terminal job. Returns the ids that changed.
    pub fn pause_all(&mut self, now_ms: u128) -> Vec<JobId> {
        self.set_paused_all(true, now_ms)
    }

    /// Resume every paused job. Returns the ids that changed.
    pub fn resume_all(&mut self, now_ms: u128) -> Vec<JobId> {
        self.set_paused_all(false, now_ms)
    }

    fn set_paused(&mut self, job_id: JobId, paused: bool, now_ms: u128) -> Result<JobStatus, SchedulerError> {
        let job = self.jobs.get_mut(&job_id).ok_or(SchedulerError::UnknownJob(job_id))?;
        if job.status.is_terminal() {
            return Err(SchedulerError::JobFinished {
                job: job_id,
                state: job.status.to_string(),
            });
        }
        job.paused = paused;
        tracing::info!(job_id = %job_id, paused, "job pause state changed");
        Ok(self.recompute(job_id, now_ms))
    }

    fn set_paused_all(&mut self, paused: bool, now_ms: u128) -> Vec<JobId> {
        let ids: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal() && j.paused != paused)
            .map(|j| j.id)
            .collect();
        for id in &ids {
            if let Some(job) = self.jobs.get_mut(id) {
                job.paused = paused;
            }
            self.recompute(*id, now_ms);
        }
        ids
    }

    /// Remove terminal jobs finished more than the retention window ago.
    /// Jobs that still have dispatched batches are kept.
    pub fn purge(&mut self, now_ms: u128) -> Vec<JobId> {
        let retention = duration_ms(self.limits.retention);
        let expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| {
                job.status.is_terminal()
                    && job
                        .finished_at_ms
                        .is_some_and(|at| now_ms.saturating_sub(at) >= retention)
                    && !job.batches.iter().any(|id| {
                        self.batches
                            .get(id)
                            .is_some_and(|b| b.status == BatchStatus::Dispatched)
                    })
            })
            .map(|job| job.id)
            .collect();
        for id in &expired {
            if let Some(job) = self.jobs.remove(id) {
                for batch_id in job.batches {
                    if let Some(batch) = self.batches.remove(&batch_id) {
                        self.pending.remove(&PendingKey::of(&batch));
                    }
                }
            }
        }
        if !expired.is_empty() {
            tracing::info!(purged = expired.len(), "purged finished jobs");
        }
        expired
    }

    /// Rebuild from persisted records.
    pub fn restore(&mut self, jobs: Vec<Job>, batches: Vec<Batch>) {
        for job in jobs {
            self.jobs.insert(job.id, job);
        }
        for batch in batches {
            if !self.jobs.contains_key(&batch.job_id) {
                tracing::warn!(batch_id = %batch.id, "dropping orphaned batch on restore");
                continue;
            }
            self.next_seq = self.next_seq.max(batch.seq + 1);
            if batch.status == BatchStatus::Pending {
                self.pending.insert(PendingKey::of(&batch));
            }
            self.batches.insert(batch.id, batch);
        }
        tracing::info!(
            jobs = self.jobs.len(),
            batches = self.batches.len(),
            pending = self.pending.len(),
            "job queue restored"
        );
    }

    /// Dispatched batches held by `worker`.
    #[must_use]
    pub fn dispatched_to(&self, worker: WorkerId) -> Vec<&Batch> {
        let mut out: Vec<&Batch> = self
            .batches
            .values()
            .filter(|b| b.status == BatchStatus::Dispatched && b.worker == Some(worker))
            .collect();
        out.sort_by_key(|b| b.seq);
        out
    }

    /// Dispatched batches whose deadline (from `timeout_for`) has passed.
    pub fn overdue<F>(&self, now_ms: u128, timeout_for: F) -> Vec<(BatchId, WorkerId)>
    where
        F: Fn(&Batch) -> Duration,
    {
        self.batches
            .values()
            .filter_map(|b| {
                let worker = b.worker?;
                let since = b.dispatched_at_ms?;
                let overdue = b.status == BatchStatus::Dispatched
                    && now_ms.saturating_sub(since) > duration_ms(timeout_for(b));
                overdue.then_some((b.id, worker))
            })
            .collect()
    }

    /// Look up a job.
    #[must_use]
    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// Look up a batch.
    #[must_use]
    pub fn batch(&self, id: BatchId) -> Option<&Batch> {
        self.batches.get(&id)
    }

    /// Batches of a job in frame order.
    #[must_use]
    pub fn batches_of(&self, job_id: JobId) -> Vec<&Batch> {
        self.jobs
            .get(&job_id)
            .map(|job| job.batches.iter().filter_map(|id| self.batches.get(id)).collect())
            .unwrap_or_default()
    }

    /// All jobs, oldest first.
    #[must_use]
    pub fn jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.created_at_ms);
        jobs
    }

    /// Number of pending batches (including backoff-delayed and paused ones).
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of non-terminal jobs.
    #[must_use]
    pub fn active_jobs(&self) -> usize {
        self.jobs.values().filter(|j| !j.status.is_terminal()).count()
    }

    fn recompute(&mut self, job_id: JobId, now_ms: u128) -> JobStatus {
        let Some(job) = self.jobs.get(&job_id) else {
            return JobStatus::Cancelled;
        };
        let status = derive_job_status(
            job.cancelled,
            job.paused,
            job.batches
                .iter()
                .filter_map(|id| self.batches.get(id).map(|b| b.status)),
        );
        if let Some(job) = self.jobs.get_mut(&job_id) {
            if status != job.status {
                tracing::debug!(job_id = %job_id, from = %job.status, to = %status, "job status changed");
            }
            if status.is_terminal() && job.finished_at_ms.is_none() {
                job.finished_at_ms = Some(now_ms);
            }
            job.status = status;
        }
        status
    }
}
