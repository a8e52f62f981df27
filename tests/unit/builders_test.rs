//! Tests for builder modules

use std::sync::Arc;
use std::time::Duration;

use render_farm::builders::{
    build_coordinator, build_store, liveness_timeouts, retry_manager, worker_builder,
};
use render_farm::config::{FarmConfig, StoreBackendConfig};
use render_farm::infra::{InMemoryStore, StateStore};

#[test]
fn test_liveness_from_config() {
    let mut cfg = FarmConfig::default();
    cfg.coordinator.heartbeat_interval_ms = 1_500;
    let liveness = liveness_timeouts(&cfg);
    assert_eq!(liveness.heartbeat_interval, Duration::from_millis(1_500));
    assert_eq!(liveness.offline_timeout, Duration::from_secs(30));
}

#[test]
fn test_retry_manager_from_config() {
    let mut cfg = FarmConfig::default();
    cfg.retry.max_retries = 5;
    assert_eq!(retry_manager(&cfg).max_retries(), 5);
}

#[test]
fn test_in_memory_store_builds() {
    let store = build_store(&StoreBackendConfig::InMemory).unwrap();
    assert!(store.load().unwrap().is_empty());
}

#[test]
fn test_coordinator_uses_heartbeat_interval() {
    let mut cfg = FarmConfig::default();
    cfg.coordinator.heartbeat_interval_ms = 2_000;
    cfg.coordinator.offline_timeout_ms = 6_000;
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
    let coordinator = build_coordinator(&cfg, store, 0).unwrap();
    assert_eq!(
        coordinator.scheduler.heartbeat_interval(),
        Duration::from_secs(2)
    );
    assert_eq!(coordinator.scheduler.stats().workers, 0);
}

#[test]
fn test_worker_buffer_pool_from_defaults() {
    let pool = worker_builder::buffer_pool(&FarmConfig::default().worker).unwrap();
    assert_eq!(pool.classes().len(), 3);
    assert_eq!(pool.free_count(1024 * 1024), Some(32));
}
