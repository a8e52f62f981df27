//! Tests for configuration validation

use render_farm::config::{
    BatchConfig, CoordinatorConfig, ExhaustionConfig, FarmConfig, RetryConfig, StoreBackendConfig,
    WorkerConfig,
};

#[test]
fn test_farm_config_defaults_valid() {
    let cfg = FarmConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.store, StoreBackendConfig::InMemory);
    assert_eq!(cfg.coordinator.heartbeat_interval_ms, 10_000);
    assert_eq!(cfg.retry.max_retries, 3);
}

#[test]
fn test_coordinator_offline_must_exceed_heartbeat() {
    let invalid = CoordinatorConfig {
        heartbeat_interval_ms: 30_000,
        offline_timeout_ms: 30_000,
        ..CoordinatorConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_coordinator_invalid_multiplier() {
    let mut invalid = CoordinatorConfig::default();
    invalid
        .renderer_timeout_multipliers
        .insert(render_farm::util::RendererKind::Nuke, 0.0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_batch_config_default_outside_bounds() {
    let invalid = BatchConfig {
        min_batch_size: 5,
        max_batch_size: 50,
        default_batch_size: 60,
        ..BatchConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_batch_config_rejects_zero_batch_limit() {
    let invalid = BatchConfig {
        max_batches_per_job: 0,
        ..BatchConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_retry_config_invalid_backoff() {
    let invalid = RetryConfig {
        backoff_factor: 0.5,
        ..RetryConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_worker_config_invalid_fraction() {
    let invalid = WorkerConfig {
        cache_memory_fraction: 1.5,
        ..WorkerConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_empty_store_path_rejected() {
    let cfg = FarmConfig {
        store: StoreBackendConfig::File { path: "  ".into() },
        ..FarmConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_farm_config_from_json() {
    let json = r#"{
        "coordinator": {
            "heartbeat_interval_ms": 2000,
            "offline_timeout_ms": 6000
        },
        "batching": { "default_batch_size": 20 },
        "worker": { "exhaustion": "fail_fast" },
        "store": { "file": { "path": "/tmp/render-farm" } }
    }"#;

    let config = FarmConfig::from_json_str(json).unwrap();
    assert_eq!(config.coordinator.heartbeat_interval_ms, 2000);
    assert_eq!(config.coordinator.job_timeout_secs, 3600);
    assert_eq!(config.batching.default_batch_size, 20);
    assert_eq!(config.worker.exhaustion, ExhaustionConfig::FailFast);
    assert_eq!(
        config.store,
        StoreBackendConfig::File {
            path: "/tmp/render-farm".into()
        }
    );
}

#[test]
fn test_farm_config_from_json_rejects_invalid() {
    let json = r#"{ "batching": { "min_batch_size": 0 } }"#;
    assert!(FarmConfig::from_json_str(json).is_err());
}
