//! Assemble a coordinator from [`FarmConfig`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{FarmConfig, StoreBackendConfig};
use crate::core::audit::InMemoryAuditSink;
use crate::core::error::SchedulerError;
use crate::core::job_queue::QueueLimits;
use crate::core::retry::{BackoffPolicy, RetryManager};
use crate::core::scheduler::{DispatchTimeouts, Scheduler};
use crate::core::worker_registry::LivenessTimeouts;
use crate::infra::store::{FileStore, InMemoryStore, StateStore};

#[cfg(feature = "tokio-runtime")]
use crate::runtime::{CoordinatorHandle, CoordinatorService, ServiceSettings, Spawn};

/// A scheduler wired to its store and audit sink.
pub struct Coordinator {
    /// Shared scheduler.
    pub scheduler: Arc<Scheduler>,
    /// Audit trail attached to the scheduler.
    pub audit: Arc<Mutex<InMemoryAuditSink>>,
}

/// Queue bounds from the batching and coordinator sections.
#[must_use]
pub fn queue_limits(cfg: &FarmConfig) -> QueueLimits {
    QueueLimits {
        min_batch_size: cfg.batching.min_batch_size,
        max_batch_size: cfg.batching.max_batch_size,
        default_batch_size: cfg.batching.default_batch_size,
        max_batches_per_job: cfg.batching.max_batches_per_job,
        max_active_jobs: cfg.coordinator.max_active_jobs,
        retention: Duration::from_secs(cfg.coordinator.retention_secs),
    }
}

/// Heartbeat and offline thresholds.
#[must_use]
pub fn liveness_timeouts(cfg: &FarmConfig) -> LivenessTimeouts {
    LivenessTimeouts {
        heartbeat_interval: Duration::from_millis(cfg.coordinator.heartbeat_interval_ms),
        offline_timeout: Duration::from_millis(cfg.coordinator.offline_timeout_ms),
        removal_timeout: Duration::from_millis(cfg.coordinator.removal_timeout_ms),
    }
}

/// Retry bound and backoff curve.
#[must_use]
pub fn retry_manager(cfg: &FarmConfig) -> RetryManager {
    let backoff = BackoffPolicy {
        first: Duration::from_millis(cfg.retry.backoff_first_ms),
        max: Duration::from_millis(cfg.retry.backoff_max_ms),
        factor: cfg.retry.backoff_factor,
    };
    RetryManager::new(cfg.retry.max_retries, cfg.retry.unclassified_retry_cap, backoff)
}

/// Per-renderer dispatch deadlines.
#[must_use]
pub fn dispatch_timeouts(cfg: &FarmConfig) -> DispatchTimeouts {
    DispatchTimeouts {
        base: Duration::from_secs(cfg.coordinator.job_timeout_secs),
        multipliers: cfg.coordinator.renderer_timeout_multipliers.clone(),
    }
}

/// Open the configured state store.
pub fn build_store(cfg: &StoreBackendConfig) -> Result<Arc<dyn StateStore>, SchedulerError> {
    match cfg {
        StoreBackendConfig::InMemory => Ok(Arc::new(InMemoryStore::new())),
        StoreBackendConfig::File { path } => Ok(Arc::new(FileStore::open(path)?)),
    }
}

/// Validate `cfg`, build the scheduler over `store`, and reload whatever the
/// store already holds.
///
/// `now_ms` is the clock value used to restart heartbeat timers of restored
/// workers.
pub fn build_coordinator(
    cfg: &FarmConfig,
    store: Arc<dyn StateStore>,
    now_ms: u128,
) -> Result<Coordinator, SchedulerError> {
    cfg.validate().map_err(SchedulerError::Config)?;

    let snapshot = store.load()?;
    let audit = Arc::new(Mutex::new(InMemoryAuditSink::new(cfg.coordinator.audit_capacity)));
    let scheduler = Scheduler::new(
        queue_limits(cfg),
        liveness_timeouts(cfg),
        retry_manager(cfg),
        dispatch_timeouts(cfg),
        store,
    )
    .with_audit(audit.clone());

    if !snapshot.is_empty() {
        tracing::info!(
            jobs = snapshot.jobs.len(),
            batches = snapshot.batches.len(),
            workers = snapshot.workers.len(),
            "restoring coordinator state"
        );
        scheduler.restore(snapshot, now_ms);
    }

    Ok(Coordinator {
        scheduler: Arc::new(scheduler),
        audit,
    })
}

/// Loop timing for [`CoordinatorService`].
#[cfg(feature = "tokio-runtime")]
#[must_use]
pub fn service_settings(cfg: &FarmConfig) -> ServiceSettings {
    ServiceSettings {
        sweep_interval: Duration::from_millis(cfg.coordinator.sweep_interval_ms),
        dispatch_interval: Duration::from_millis(cfg.coordinator.dispatch_interval_ms),
        command_buffer: cfg.coordinator.command_buffer,
    }
}

/// Build the store and scheduler from `cfg` and start the service loops.
#[cfg(feature = "tokio-runtime")]
pub fn start_coordinator<S>(
    cfg: &FarmConfig,
    spawner: &S,
    now_ms: u128,
) -> Result<(CoordinatorHandle, Arc<Mutex<InMemoryAuditSink>>), SchedulerError>
where
    S: Spawn,
{
    let store = build_store(&cfg.store)?;
    let coordinator = build_coordinator(cfg, store, now_ms)?;
    let handle = CoordinatorService::start(coordinator.scheduler, service_settings(cfg), spawner);
    Ok((handle, coordinator.audit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobSpec;
    use crate::util::serde::{FrameRange, Priority, RendererKind};

    #[test]
    fn limits_follow_config() {
        let mut cfg = FarmConfig::default();
        cfg.batching.default_batch_size = 25;
        cfg.coordinator.max_active_jobs = 7;
        let limits = queue_limits(&cfg);
        assert_eq!(limits.default_batch_size, 25);
        assert_eq!(limits.max_active_jobs, 7);

        let timeouts = dispatch_timeouts(&cfg);
        assert_eq!(
            timeouts.for_renderer(RendererKind::Fusion),
            cfg.coordinator.timeout_for(RendererKind::Fusion)
        );
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = FarmConfig::default();
        cfg.coordinator.heartbeat_interval_ms = 0;
        let err = build_coordinator(&cfg, Arc::new(InMemoryStore::new()), 0)
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::Config(_)));
    }

    #[test]
    fn coordinator_restores_from_store() {
        let cfg = FarmConfig::default();
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let first = build_coordinator(&cfg, Arc::clone(&store), 0).unwrap();
        let spec = JobSpec {
            title: "shot_010".into(),
            renderer: RendererKind::Nuke,
            frames: FrameRange::new(1, 20).unwrap(),
            priority: Priority::High,
            batch_size: Some(10),
        };
        let job_id = first.scheduler.submit(&spec, 1).unwrap();
        assert!(!first.audit.lock().events_for(job_id).is_empty());

        let second = build_coordinator(&cfg, store, 2).unwrap();
        assert_eq!(second.scheduler.job_status(job_id).unwrap().batches.len(), 2);
    }
}
