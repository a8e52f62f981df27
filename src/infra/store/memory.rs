//! In-memory state store for tests and single-process deployments.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{StateStore, StoreSnapshot};
use crate::core::error::SchedulerError;
use crate::core::job::{Batch, Job};
use crate::core::worker_registry::Worker;
use crate::util::serde::{BatchId, JobId, WorkerId};

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    batches: HashMap<BatchId, Batch>,
    workers: HashMap<WorkerId, Worker>,
}

/// Hash-map backed store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted jobs.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.tables.lock().jobs.len()
    }
}

impl StateStore for InMemoryStore {
    fn put_job(&self, job: &Job) -> Result<(), SchedulerError> {
        self.tables.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn put_batch(&self, batch: &Batch) -> Result<(), SchedulerError> {
        self.tables.lock().batches.insert(batch.id, batch.clone());
        Ok(())
    }

    fn put_worker(&self, worker: &Worker) -> Result<(), SchedulerError> {
        self.tables.lock().workers.insert(worker.id, worker.clone());
        Ok(())
    }

    fn remove_job(&self, id: JobId) -> Result<(), SchedulerError> {
        let mut tables = self.tables.lock();
        tables.jobs.remove(&id);
        tables.batches.retain(|_, b| b.job_id != id);
        Ok(())
    }

    fn remove_worker(&self, id: WorkerId) -> Result<(), SchedulerError> {
        self.tables.lock().workers.remove(&id);
        Ok(())
    }

    fn load(&self) -> Result<StoreSnapshot, SchedulerError> {
        let tables = self.tables.lock();
        Ok(StoreSnapshot {
            jobs: tables.jobs.values().cloned().collect(),
            batches: tables.batches.values().cloned().collect(),
            workers: tables.workers.values().cloned().collect(),
        })
    }
}
