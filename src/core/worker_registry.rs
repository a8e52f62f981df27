//! Authoritative worker table: capacity, load, and liveness.
//!
//! The registry never touches batches directly. When a worker goes offline its
//! assignment set is drained and handed back to the caller, which reclaims the
//! batches through the retry policy.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::SchedulerError;
use crate::util::clock::{duration_ms, elapsed_ms};
use crate::util::serde::{BatchId, RendererKind, WorkerId};

/// Liveness of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessState {
    /// Known but capacity not yet confirmed.
    Registered,
    /// Healthy and schedulable.
    Active,
    /// Missed a heartbeat; not scheduled.
    Suspect,
    /// Missed heartbeats past the offline timeout; assignments reclaimed.
    Offline,
    /// Gone for good.
    Removed,
}

impl LivenessState {
    /// Whether new batches may be assigned.
    #[must_use]
    pub const fn is_schedulable(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Active => "active",
            Self::Suspect => "suspect",
            Self::Offline => "offline",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Registration payload sent by a worker on first contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Network address the worker listens on.
    pub address: String,
    /// Maximum concurrent batches.
    pub capacity: u32,
    /// Renderers installed on the node.
    pub renderers: Vec<RendererKind>,
    /// Available memory hint in bytes.
    #[serde(default)]
    pub mem_available: Option<u64>,
}

/// Host readings sampled by a worker for each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    /// Global CPU usage, 0-100.
    pub cpu_percent: f32,
    /// Share of installed memory in use, 0-100.
    pub memory_percent: f32,
    /// Memory available for new allocations, in bytes.
    pub memory_available_bytes: u64,
}

/// Periodic liveness message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sender.
    pub worker_id: WorkerId,
    /// Monotonic per-worker sequence number.
    pub seq: u64,
    /// Batches the worker reports as running.
    pub load: u32,
    /// Available memory hint in bytes.
    #[serde(default)]
    pub mem_available: Option<u64>,
    /// Host readings taken just before sending.
    #[serde(default)]
    pub metrics: Option<HostMetrics>,
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier.
    pub id: WorkerId,
    /// Network address.
    pub address: String,
    /// Declared capacity.
    pub capacity: u32,
    /// Active assignments counted by the coordinator.
    pub load: u32,
    /// Load the worker reported in its last heartbeat.
    pub reported_load: u32,
    /// Supported renderers.
    pub renderers: Vec<RendererKind>,
    /// Liveness state.
    pub state: LivenessState,
    /// Last accepted heartbeat.
    pub last_heartbeat_ms: u128,
    /// Sequence number of the last accepted heartbeat.
    pub last_seq: u64,
    /// Available memory hint.
    pub mem_available: Option<u64>,
    /// Registration time; tie-break for scheduling order.
    pub registered_at_ms: u128,
    /// Order of registration; tie-break when timestamps collide.
    pub registration_seq: u64,
    /// When the worker went offline.
    pub offline_since_ms: Option<u128>,
    /// Batches currently dispatched to this worker.
    pub assignments: BTreeSet<BatchId>,
    /// Host readings from the last accepted heartbeat that carried them.
    #[serde(default)]
    pub host_metrics: Option<HostMetrics>,
}

impl Worker {
    /// Slots available for new assignments.
    #[must_use]
    pub const fn free_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.load)
    }

    /// Whether the worker can run batches for `renderer`.
    #[must_use]
    pub fn supports(&self, renderer: RendererKind) -> bool {
        self.renderers.contains(&renderer)
    }
}

/// Liveness thresholds.
#[derive(Debug, Clone, Copy)]
pub struct LivenessTimeouts {
    /// Expected heartbeat period; silence past it makes a worker suspect.
    pub heartbeat_interval: Duration,
    /// Silence past this marks a worker offline.
    pub offline_timeout: Duration,
    /// Offline for this long with no assignments removes the worker.
    pub removal_timeout: Duration,
}

impl Default for LivenessTimeouts {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            offline_timeout: Duration::from_secs(30),
            removal_timeout: Duration::from_secs(600),
        }
    }
}

/// A liveness transition produced by a sweep or deregistration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessChange {
    /// Worker that changed.
    pub worker: WorkerId,
    /// Previous state.
    pub from: LivenessState,
    /// New state.
    pub to: LivenessState,
    /// Batches drained from the worker; the caller must reclaim them.
    pub reclaimed: Vec<BatchId>,
}

/// Worker table.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Worker>,
    timeouts: LivenessTimeouts,
    next_seq: u64,
}

impl WorkerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(timeouts: LivenessTimeouts) -> Self {
        Self {
            workers: HashMap::new(),
            timeouts,
            next_seq: 0,
        }
    }

    /// Thresholds in force.
    #[must_use]
    pub const fn timeouts(&self) -> &LivenessTimeouts {
        &self.timeouts
    }

    /// Add a worker. Positive capacity promotes it straight to `Active`.
    pub fn register(&mut self, info: WorkerInfo, now_ms: u128) -> Result<WorkerId, SchedulerError> {
        if info.renderers.is_empty() {
            return Err(SchedulerError::InvalidWorker(
                "worker supports no renderers".into(),
            ));
        }
        if info.address.trim().is_empty() {
            return Err(SchedulerError::InvalidWorker("empty address".into()));
        }
        let mut renderers = info.renderers;
        renderers.sort();
        renderers.dedup();

        let state = if info.capacity > 0 {
            LivenessState::Active
        } else {
            LivenessState::Registered
        };
        let worker = Worker {
            id: Uuid::new_v4(),
            address: info.address,
            capacity: info.capacity,
            load: 0,
            reported_load: 0,
            renderers,
            state,
            last_heartbeat_ms: now_ms,
            last_seq: 0,
            mem_available: info.mem_available,
            registered_at_ms: now_ms,
            registration_seq: self.next_seq,
            offline_since_ms: None,
            assignments: BTreeSet::new(),
            host_metrics: None,
        };
        self.next_seq += 1;
        let id = worker.id;
        tracing::info!(
            worker_id = %id,
            address = %worker.address,
            capacity = worker.capacity,
            state = %state,
            "worker registered"
        );
        self.workers.insert(id, worker);
        Ok(id)
    }

    /// Apply a heartbeat. Out-of-order heartbeats are ignored and report the
    /// current state unchanged.
    pub fn heartbeat(&mut self, hb: &Heartbeat, now_ms: u128) -> Result<LivenessState, SchedulerError> {
        let worker = self
            .workers
            .get_mut(&hb.worker_id)
            .ok_or(SchedulerError::UnknownWorker(hb.worker_id))?;
        if hb.seq <= worker.last_seq {
            tracing::warn!(
                worker_id = %hb.worker_id,
                seq = hb.seq,
                last_seq = worker.last_seq,
                "ignoring stale heartbeat"
            );
            return Ok(worker.state);
        }
        worker.last_seq = hb.seq;
        worker.last_heartbeat_ms = now_ms;
        worker.reported_load = hb.load;
        if hb.mem_available.is_some() {
            worker.mem_available = hb.mem_available;
        }
        if hb.metrics.is_some() {
            worker.host_metrics = hb.metrics;
        }
        if matches!(worker.state, LivenessState::Suspect | LivenessState::Offline) {
            tracing::info!(worker_id = %worker.id, from = %worker.state, "worker back online");
            worker.state = if worker.capacity > 0 {
                LivenessState::Active
            } else {
                LivenessState::Registered
            };
            worker.offline_since_ms = None;
        }
        Ok(worker.state)
    }

    /// Update declared capacity; positive capacity promotes a `Registered` worker.
    pub fn set_capacity(&mut self, id: WorkerId, capacity: u32) -> Result<LivenessState, SchedulerError> {
        let worker = self
            .workers
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownWorker(id))?;
        worker.capacity = capacity;
        if worker.state == LivenessState::Registered && capacity > 0 {
            worker.state = LivenessState::Active;
        }
        tracing::info!(worker_id = %id, capacity, state = %worker.state, "worker capacity updated");
        Ok(worker.state)
    }

    /// Advance liveness for every worker based on heartbeat age.
    ///
    /// Workers crossing into `Offline` have their assignments drained into the
    /// returned change. Offline workers past the removal timeout with nothing
    /// assigned are dropped from the table.
    pub fn mark_dead_if_stale(&mut self, now_ms: u128) -> Vec<LivenessChange> {
        let suspect_after = duration_ms(self.timeouts.heartbeat_interval);
        let offline_after = duration_ms(self.timeouts.offline_timeout);
        let remove_after = duration_ms(self.timeouts.removal_timeout);

        let mut changes = Vec::new();
        let mut removed = Vec::new();
        for worker in self.workers.values_mut() {
            let silent = elapsed_ms(worker.last_heartbeat_ms, now_ms);
            let from = worker.state;
            match from {
                LivenessState::Active | LivenessState::Registered | LivenessState::Suspect
                    if silent > offline_after =>
                {
                    worker.state = LivenessState::Offline;
                    worker.offline_since_ms = Some(now_ms);
                    worker.load = 0;
                    let reclaimed: Vec<BatchId> = std::mem::take(&mut worker.assignments).into_iter().collect();
                    tracing::warn!(
                        worker_id = %worker.id,
                        silent_ms = u64::try_from(silent).unwrap_or(u64::MAX),
                        reclaimed = reclaimed.len(),
                        "worker offline"
                    );
                    changes.push(LivenessChange {
                        worker: worker.id,
                        from,
                        to: LivenessState::Offline,
                        reclaimed,
                    });
                }
                LivenessState::Active if silent > suspect_after => {
                    worker.state = LivenessState::Suspect;
                    tracing::warn!(
                        worker_id = %worker.id,
                        silent_ms = u64::try_from(silent).unwrap_or(u64::MAX),
                        "worker suspect"
                    );
                    changes.push(LivenessChange {
                        worker: worker.id,
                        from,
                        to: LivenessState::Suspect,
                        reclaimed: Vec::new(),
                    });
                }
                LivenessState::Offline => {
                    let offline_for = worker
                        .offline_since_ms
                        .map_or(0, |since| elapsed_ms(since, now_ms));
                    if offline_for > remove_after && worker.assignments.is_empty() {
                        removed.push(worker.id);
                        changes.push(LivenessChange {
                            worker: worker.id,
                            from,
                            to: LivenessState::Removed,
                            reclaimed: Vec::new(),
                        });
                    }
                }
                _ => {}
            }
        }
        for id in removed {
            self.workers.remove(&id);
            tracing::info!(worker_id = %id, "worker removed");
        }
        changes
    }

    /// Remove a worker immediately, draining its assignments.
    pub fn deregister(&mut self, id: WorkerId) -> Result<LivenessChange, SchedulerError> {
        let worker = self
            .workers
            .remove(&id)
            .ok_or(SchedulerError::UnknownWorker(id))?;
        let reclaimed: Vec<BatchId> = worker.assignments.into_iter().collect();
        tracing::info!(worker_id = %id, reclaimed = reclaimed.len(), "worker deregistered");
        Ok(LivenessChange {
            worker: id,
            from: worker.state,
            to: LivenessState::Removed,
            reclaimed,
        })
    }

    /// Record a new assignment, refusing when the worker is not schedulable or full.
    pub fn assign(&mut self, id: WorkerId, batch: BatchId) -> Result<(), SchedulerError> {
        let worker = self
            .workers
            .get_mut(&id)
            .ok_or(SchedulerError::UnknownWorker(id))?;
        if !worker.state.is_schedulable() || worker.free_capacity() == 0 {
            return Err(SchedulerError::CapacityExceeded(id));
        }
        if !worker.assignments.insert(batch) {
            return Err(SchedulerError::DoubleDispatch(batch));
        }
        worker.load += 1;
        Ok(())
    }

    /// Drop an assignment. Returns whether it was held.
    pub fn release(&mut self, id: WorkerId, batch: BatchId) -> bool {
        let Some(worker) = self.workers.get_mut(&id) else {
            return false;
        };
        let held = worker.assignments.remove(&batch);
        if held {
            worker.load = worker.load.saturating_sub(1);
        }
        held
    }

    /// Schedulable workers with free capacity, most free capacity first, ties
    /// by registration order.
    #[must_use]
    pub fn candidates(&self) -> Vec<&Worker> {
        let mut out: Vec<&Worker> = self
            .workers
            .values()
            .filter(|w| w.state.is_schedulable() && w.free_capacity() > 0)
            .collect();
        out.sort_by(|a, b| {
            b.free_capacity()
                .cmp(&a.free_capacity())
                .then_with(|| a.registration_seq.cmp(&b.registration_seq))
        });
        out
    }

    /// Look up a worker.
    #[must_use]
    pub fn get(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(&id)
    }

    /// All workers in registration order.
    #[must_use]
    pub fn workers(&self) -> Vec<&Worker> {
        let mut out: Vec<&Worker> = self.workers.values().collect();
        out.sort_by_key(|w| w.registration_seq);
        out
    }

    /// Number of known workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no worker is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Rebuild from persisted records. Restored workers keep their state but
    /// their heartbeat clock restarts at `now_ms`.
    pub fn restore(&mut self, workers: Vec<Worker>, now_ms: u128) {
        for mut worker in workers {
            if worker.state == LivenessState::Removed {
                continue;
            }
            worker.last_heartbeat_ms = now_ms;
            self.next_seq = self.next_seq.max(worker.registration_seq + 1);
            self.workers.insert(worker.id, worker);
        }
        tracing::info!(workers = self.workers.len(), "worker registry restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(capacity: u32) -> WorkerInfo {
        WorkerInfo {
            address: "10.0.0.5:7000".into(),
            capacity,
            renderers: vec![RendererKind::Nuke],
            mem_available: None,
        }
    }

    fn timeouts() -> LivenessTimeouts {
        LivenessTimeouts {
            heartbeat_interval: Duration::from_millis(100),
            offline_timeout: Duration::from_millis(300),
            removal_timeout: Duration::from_millis(1000),
        }
    }

    fn hb(worker_id: WorkerId, seq: u64) -> Heartbeat {
        Heartbeat {
            worker_id,
            seq,
            load: 0,
            mem_available: None,
            metrics: None,
        }
    }

    #[test]
    fn capacity_promotes_to_active() {
        let mut reg = WorkerRegistry::new(timeouts());
        let idle = reg.register(info(0), 0).unwrap();
        assert_eq!(reg.get(idle).unwrap().state, LivenessState::Registered);
        assert_eq!(reg.set_capacity(idle, 2).unwrap(), LivenessState::Active);

        let ready = reg.register(info(4), 0).unwrap();
        assert_eq!(reg.get(ready).unwrap().state, LivenessState::Active);
    }

    #[test]
    fn silence_walks_through_suspect_and_offline() {
        let mut reg = WorkerRegistry::new(timeouts());
        let id = reg.register(info(2), 0).unwrap();
        reg.assign(id, Uuid::new_v4()).unwrap();

        let changes = reg.mark_dead_if_stale(150);
        assert_eq!(changes[0].to, LivenessState::Suspect);

        let changes = reg.mark_dead_if_stale(400);
        assert_eq!(changes[0].to, LivenessState::Offline);
        assert_eq!(changes[0].reclaimed.len(), 1);
        assert_eq!(reg.get(id).unwrap().load, 0);

        let changes = reg.mark_dead_if_stale(1500);
        assert_eq!(changes[0].to, LivenessState::Removed);
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn heartbeat_revives_suspect_worker() {
        let mut reg = WorkerRegistry::new(timeouts());
        let id = reg.register(info(2), 0).unwrap();
        reg.mark_dead_if_stale(150);
        assert_eq!(reg.heartbeat(&hb(id, 1), 160).unwrap(), LivenessState::Active);
    }

    #[test]
    fn stale_heartbeat_is_ignored() {
        let mut reg = WorkerRegistry::new(timeouts());
        let id = reg.register(info(2), 0).unwrap();
        reg.heartbeat(&hb(id, 5), 50).unwrap();
        reg.heartbeat(&hb(id, 3), 90).unwrap();
        let worker = reg.get(id).unwrap();
        assert_eq!(worker.last_seq, 5);
        assert_eq!(worker.last_heartbeat_ms, 50);
    }

    #[test]
    fn silence_past_u64_millis_still_goes_offline() {
        let mut reg = WorkerRegistry::new(timeouts());
        let id = reg.register(info(1), 0).unwrap();
        let far = u128::from(u64::MAX) * 4;
        let changes = reg.mark_dead_if_stale(far);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, LivenessState::Offline);
        assert_eq!(reg.get(id).unwrap().offline_since_ms, Some(far));
    }

    #[test]
    fn heartbeat_records_host_metrics() {
        let mut reg = WorkerRegistry::new(timeouts());
        let id = reg.register(info(2), 0).unwrap();
        let metrics = HostMetrics {
            cpu_percent: 93.5,
            memory_percent: 61.0,
            memory_available_bytes: 12 << 30,
        };
        reg.heartbeat(
            &Heartbeat {
                metrics: Some(metrics),
                ..hb(id, 1)
            },
            10,
        )
        .unwrap();
        assert_eq!(reg.get(id).unwrap().host_metrics, Some(metrics));

        // A beat without readings keeps the last ones.
        reg.heartbeat(&hb(id, 2), 20).unwrap();
        assert_eq!(reg.get(id).unwrap().host_metrics, Some(metrics));
    }

    #[test]
    fn assign_respects_capacity() {
        let mut reg = WorkerRegistry::new(timeouts());
        let id = reg.register(info(1), 0).unwrap();
        reg.assign(id, Uuid::new_v4()).unwrap();
        let err = reg.assign(id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, SchedulerError::CapacityExceeded(w) if w == id));
    }

    #[test]
    fn candidates_prefer_free_capacity_then_registration_order() {
        let mut reg = WorkerRegistry::new(timeouts());
        let a = reg.register(info(2), 0).unwrap();
        let b = reg.register(info(4), 0).unwrap();
        let c = reg.register(info(2), 0).unwrap();
        let order: Vec<WorkerId> = reg.candidates().iter().map(|w| w.id).collect();
        assert_eq!(order, vec![b, a, c]);
    }

    #[test]
    fn unknown_worker_heartbeat_errors() {
        let mut reg = WorkerRegistry::new(timeouts());
        let err = reg.heartbeat(&hb(Uuid::new_v4(), 1), 0).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownWorker(_)));
    }
}
