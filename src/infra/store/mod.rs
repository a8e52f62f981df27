//! Durable state backends for jobs, batches, and workers.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

use crate::core::error::SchedulerError;
use crate::core::job::{Batch, Job};
use crate::core::worker_registry::Worker;
use crate::util::serde::{JobId, WorkerId};

/// Everything a store holds, as loaded on startup.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Persisted jobs.
    pub jobs: Vec<Job>,
    /// Persisted batches.
    pub batches: Vec<Batch>,
    /// Persisted workers.
    pub workers: Vec<Worker>,
}

impl StoreSnapshot {
    /// Whether nothing was persisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.batches.is_empty() && self.workers.is_empty()
    }
}

/// Key-indexed store written on every coordinator transition.
///
/// Implementations use interior mutability; the scheduler shares one store
/// across threads.
pub trait StateStore: Send + Sync {
    /// Insert or replace a job.
    fn put_job(&self, job: &Job) -> Result<(), SchedulerError>;
    /// Insert or replace a batch.
    fn put_batch(&self, batch: &Batch) -> Result<(), SchedulerError>;
    /// Insert or replace a worker.
    fn put_worker(&self, worker: &Worker) -> Result<(), SchedulerError>;
    /// Remove a job and all of its batches.
    fn remove_job(&self, id: JobId) -> Result<(), SchedulerError>;
    /// Remove a worker.
    fn remove_worker(&self, id: WorkerId) -> Result<(), SchedulerError>;
    /// Read everything back.
    fn load(&self) -> Result<StoreSnapshot, SchedulerError>;
    /// Block until every accepted write is durable.
    fn flush(&self) -> Result<(), SchedulerError> {
        Ok(())
    }
}
