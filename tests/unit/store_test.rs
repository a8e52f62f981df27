//! Tests for state store backends

use std::path::PathBuf;
use std::sync::Arc;

use render_farm::builders::{build_coordinator, build_store};
use render_farm::config::{FarmConfig, StoreBackendConfig};
use render_farm::core::{Heartbeat, JobSpec, WorkerInfo};
use render_farm::infra::{FileStore, InMemoryStore, StateStore};
use render_farm::util::{FrameRange, RendererKind};

fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("render_farm_{tag}_{}", uuid::Uuid::new_v4()))
}

fn line_count(path: &std::path::Path) -> usize {
    std::fs::read_to_string(path).unwrap().lines().count()
}

fn spec(frames: (i64, i64)) -> JobSpec {
    JobSpec::new(RendererKind::Nuke, FrameRange::new(frames.0, frames.1).unwrap()).with_batch_size(5)
}

#[test]
fn test_in_memory_store_tracks_jobs() {
    let store = Arc::new(InMemoryStore::new());
    let coordinator = build_coordinator(&FarmConfig::default(), store.clone(), 0).unwrap();
    let job = coordinator.scheduler.submit(&spec((1, 10)), 1).unwrap();
    assert_eq!(store.job_count(), 1);

    let snapshot = store.load().unwrap();
    assert_eq!(snapshot.jobs[0].id, job);
    assert_eq!(snapshot.batches.len(), 2);
}

#[test]
fn test_file_store_survives_reopen() {
    let dir = temp_dir("reopen");
    let job = {
        let store: Arc<dyn StateStore> = Arc::new(FileStore::open(&dir).unwrap());
        let coordinator = build_coordinator(&FarmConfig::default(), store, 0).unwrap();
        coordinator
            .scheduler
            .register_worker(
                WorkerInfo {
                    address: "node-1:7100".into(),
                    capacity: 2,
                    renderers: vec![RendererKind::Nuke],
                    mem_available: None,
                },
                0,
            )
            .unwrap();
        coordinator.scheduler.submit(&spec((1, 15)), 1).unwrap()
    };

    let reopened = FileStore::open(&dir).unwrap();
    assert_eq!(reopened.path(), dir.as_path());
    let snapshot = reopened.load().unwrap();
    assert_eq!(snapshot.jobs.len(), 1);
    assert_eq!(snapshot.jobs[0].id, job);
    assert_eq!(snapshot.batches.len(), 3);
    assert_eq!(snapshot.workers.len(), 1);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_build_store_opens_file_backend() {
    let dir = temp_dir("build");
    let store = build_store(&StoreBackendConfig::File {
        path: dir.to_string_lossy().into_owned(),
    })
    .unwrap();
    assert!(store.load().unwrap().is_empty());
    assert!(dir.exists());
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_remove_job_drops_batches() {
    let store = Arc::new(InMemoryStore::new());
    let coordinator = build_coordinator(&FarmConfig::default(), store.clone(), 0).unwrap();
    let job = coordinator.scheduler.submit(&spec((1, 10)), 1).unwrap();
    store.remove_job(job).unwrap();
    let snapshot = store.load().unwrap();
    assert!(snapshot.jobs.is_empty());
    assert!(snapshot.batches.is_empty());
}

#[test]
fn test_file_store_large_submit_appends_without_rewrites() {
    let dir = temp_dir("large_submit");
    let store = Arc::new(FileStore::open(&dir).unwrap());
    let coordinator = build_coordinator(&FarmConfig::default(), store.clone(), 0).unwrap();
    let spec = JobSpec::new(RendererKind::Nuke, FrameRange::new(1, 4_000).unwrap()).with_batch_size(1);
    coordinator.scheduler.submit(&spec, 1).unwrap();
    store.flush().unwrap();

    assert_eq!(store.compactions(), 0);
    assert_eq!(line_count(&dir.join("batches.jsonl")), 4_000);
    assert_eq!(line_count(&dir.join("jobs.jsonl")), 1);

    drop(coordinator);
    drop(store);
    let snapshot = FileStore::open(&dir).unwrap().load().unwrap();
    assert_eq!(snapshot.batches.len(), 4_000);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_file_store_compacts_hot_worker_journal() {
    let dir = temp_dir("compact");
    let store = Arc::new(FileStore::open(&dir).unwrap());
    let coordinator = build_coordinator(&FarmConfig::default(), store.clone(), 0).unwrap();
    let worker_id = coordinator
        .scheduler
        .register_worker(
            WorkerInfo {
                address: "node-hot:7100".into(),
                capacity: 1,
                renderers: vec![RendererKind::Nuke],
                mem_available: None,
            },
            0,
        )
        .unwrap()
        .worker_id;
    for seq in 1..=5_000u64 {
        coordinator
            .scheduler
            .heartbeat(
                &Heartbeat {
                    worker_id,
                    seq,
                    load: 0,
                    mem_available: None,
                    metrics: None,
                },
                u128::from(seq),
            )
            .unwrap();
    }
    store.flush().unwrap();

    assert_eq!(store.compactions(), 1);
    assert!(line_count(&dir.join("workers.jsonl")) < 1_000);

    drop(coordinator);
    drop(store);
    let snapshot = FileStore::open(&dir).unwrap().load().unwrap();
    assert_eq!(snapshot.workers.len(), 1);
    assert_eq!(snapshot.workers[0].last_seq, 5_000);
    std::fs::remove_dir_all(&dir).ok();
}
