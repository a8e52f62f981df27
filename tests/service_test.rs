//! End-to-end tests of the coordinator service with a worker node attached
//! over a [`CoordinatorHandle`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use render_farm::builders::start_coordinator;
use render_farm::config::FarmConfig;
use render_farm::core::{
    Assignment, BatchReport, BatchResult, JobStatus, LivenessState, RenderMetrics, SchedulerError, WorkerInfo,
};
use render_farm::runtime::api::submit_job;
use render_farm::runtime::{health, CoordinatorHandle, SubmitJobRequest, TokioSpawner};
use render_farm::util::{now_ms, RendererKind};
use render_farm::worker::{
    AssetCache, BufferPool, ExhaustionPolicy, NodeSettings, RenderExecutor, SizeClass, WorkerNode,
};
use tokio::sync::watch;

fn fast_config() -> FarmConfig {
    let mut cfg = FarmConfig::default();
    cfg.coordinator.heartbeat_interval_ms = 50;
    cfg.coordinator.offline_timeout_ms = 400;
    cfg.coordinator.sweep_interval_ms = 25;
    cfg.coordinator.dispatch_interval_ms = 10;
    cfg
}

struct CountingRenderer {
    frames: AtomicUsize,
}

#[async_trait]
impl RenderExecutor for CountingRenderer {
    fn staging_bytes(&self, _assignment: &Assignment) -> usize {
        128
    }

    async fn render(
        &self,
        assignment: &Assignment,
        _cache: &AssetCache,
        staging: &mut [u8],
    ) -> Result<RenderMetrics, String> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        staging.fill(0xff);
        let frames = usize::try_from(assignment.frames.len()).map_err(|e| e.to_string())?;
        self.frames.fetch_add(frames, Ordering::SeqCst);
        Ok(RenderMetrics {
            output_files: Some(assignment.frames.len()),
            ..RenderMetrics::default()
        })
    }
}

async fn wait_for_status(handle: &CoordinatorHandle, job: uuid::Uuid, want: JobStatus) {
    for _ in 0..500 {
        if handle.status(job).await.unwrap().status == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job} never reached {want:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_renders_end_to_end() {
    let cfg = fast_config();
    let (handle, audit) = start_coordinator(&cfg, &TokioSpawner::current(), now_ms()).unwrap();

    let renderer = CountingRenderer {
        frames: AtomicUsize::new(0),
    };
    let node = Arc::new(WorkerNode::new(
        handle.clone(),
        renderer,
        Arc::new(AssetCache::new(1024 * 1024)),
        BufferPool::new(&[SizeClass { size: 256, count: 4 }], ExhaustionPolicy::FailFast).unwrap(),
        NodeSettings {
            address: "render-e2e:7100".into(),
            renderers: vec![RendererKind::Nuke],
            capacity: 3,
            mem_available: None,
            sample_host: true,
            slot_retry_limit: 3,
            slot_retry_delay: Duration::from_millis(5),
            heartbeat_interval: Duration::from_millis(50),
        },
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let runner = tokio::spawn(Arc::clone(&node).run(stop_rx));

    let response = submit_job(
        &handle,
        SubmitJobRequest {
            renderer_kind: "nuke".into(),
            frame_range: "1001-1050".into(),
            priority: Some("high".into()),
            title: Some("sq010_sh040_comp".into()),
            batch_size: Some(10),
        },
    )
    .await
    .unwrap();

    wait_for_status(&handle, response.job_id, JobStatus::Completed).await;
    let view = handle.status(response.job_id).await.unwrap();
    assert_eq!(view.batches.len(), 5);
    assert!((view.progress - 100.0).abs() < f64::EPSILON);
    assert!(view
        .batches
        .iter()
        .all(|b| b.metrics.as_ref().and_then(|m| m.output_files) == Some(10)));
    let worker_id = node.worker_id().unwrap();
    assert!(handle.scheduler().worker(worker_id).unwrap().host_metrics.is_some());

    let stats = health(handle.scheduler()).stats;
    assert_eq!(stats.active_jobs, 0);
    assert_eq!(stats.workers, 1);
    assert!(!audit.lock().events_for(response.job_id).is_empty());

    stop_tx.send(true).unwrap();
    runner.await.unwrap().unwrap();
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_worker_goes_offline_and_loses_batch() {
    let cfg = fast_config();
    let (handle, _audit) = start_coordinator(&cfg, &TokioSpawner::current(), now_ms()).unwrap();

    let ack = handle
        .register(WorkerInfo {
            address: "render-silent:7100".into(),
            capacity: 1,
            renderers: vec![RendererKind::Fusion],
            mem_available: None,
        })
        .await
        .unwrap();
    let job = submit_job(
        &handle,
        SubmitJobRequest {
            renderer_kind: "fusion".into(),
            frame_range: "1-10".into(),
            priority: None,
            title: None,
            batch_size: None,
        },
    )
    .await
    .unwrap()
    .job_id;
    wait_for_status(&handle, job, JobStatus::Running).await;

    let mut offline = false;
    for _ in 0..200 {
        let worker = handle.scheduler().worker(ack.worker_id).unwrap();
        if worker.state == LivenessState::Offline {
            offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(offline, "worker never went offline");

    let view = handle.status(job).await.unwrap();
    assert_eq!(view.status, JobStatus::Queued);
    assert_eq!(view.batches[0].attempts, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_report_from_unknown_batch_is_rejected() {
    let (handle, _audit) = start_coordinator(&fast_config(), &TokioSpawner::current(), now_ms()).unwrap();
    let err = handle
        .report(BatchReport {
            batch_id: uuid::Uuid::new_v4(),
            worker_id: uuid::Uuid::new_v4(),
            attempt: 0,
            result: BatchResult::Succeeded,
            metrics: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownBatch(_)));
    handle.shutdown().await;
}

#[tokio::test]
async fn test_calls_fail_after_shutdown() {
    let (handle, _audit) = start_coordinator(&fast_config(), &TokioSpawner::current(), now_ms()).unwrap();
    handle.shutdown().await;

    let mut stopped = false;
    for _ in 0..100 {
        if matches!(handle.status(uuid::Uuid::new_v4()).await, Err(SchedulerError::Backend(_))) {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(stopped);
}
