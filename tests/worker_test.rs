//! Integration tests for the worker side: asset cache, buffer pool, and the
//! node agent driving a scheduler in-process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use render_farm::config::FarmConfig;
use render_farm::core::{
    Assignment, BatchResult, BatchStatus, DispatchTimeouts, FailureReason, JobSpec, JobStatus, LivenessTimeouts,
    QueueLimits, RenderMetrics, RetryManager, Scheduler,
};
use render_farm::builders::build_coordinator;
use render_farm::infra::InMemoryStore;
use render_farm::util::{now_ms, FrameRange, RendererKind};
use render_farm::worker::{
    AssetCache, BufferPool, ExhaustionPolicy, NodeSettings, RenderExecutor, SizeClass, WorkerNode,
};

#[test]
fn test_cache_stays_within_capacity_under_random_access() {
    let cache = AssetCache::new(100);
    let mut rng = StdRng::seed_from_u64(7);
    let ops = 2_000;

    for _ in 0..ops {
        let key: usize = rng.random_range(0..20);
        let size = key % 10 + 1;
        let data = cache
            .get_or_load(&format!("plate_{key}"), || Ok::<_, String>(vec![0u8; size]))
            .unwrap();
        assert_eq!(data.len(), size);
        assert!(cache.stats().resident_bytes <= 100);
    }

    let stats = cache.stats();
    assert_eq!(stats.hits + stats.misses, ops);
    assert!(stats.hits > 0);
    assert!(stats.evictions > 0);
    assert_eq!(stats.bypasses, 0);
}

#[tokio::test]
async fn test_cache_async_loader() {
    let cache = AssetCache::new(1024);
    let loads = AtomicUsize::new(0);
    for _ in 0..3 {
        let data = cache
            .get_or_load_async("lut/aces.cube", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(b"LUT_3D_SIZE 33".to_vec())
            })
            .await
            .unwrap();
        assert_eq!(&data[..], b"LUT_3D_SIZE 33");
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_buffer_pool_shared_across_threads() {
    let pool = BufferPool::new(
        &[SizeClass { size: 4096, count: 4 }],
        ExhaustionPolicy::Block {
            timeout: Duration::from_secs(5),
        },
    )
    .unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let mut slot = pool.acquire_for(1000).unwrap();
                slot[0] = u8::try_from(i).unwrap();
                std::thread::sleep(Duration::from_millis(2));
                slot.class_size()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 4096);
    }
    assert_eq!(pool.free_count(4096), Some(4));
}

/// Renders by filling the staging buffer; fails on request.
struct FakeRenderer {
    staging: usize,
    fail_with: Option<&'static str>,
    delay: Duration,
    rendered: AtomicUsize,
}

impl FakeRenderer {
    fn ok(staging: usize) -> Self {
        Self {
            staging,
            fail_with: None,
            delay: Duration::from_millis(5),
            rendered: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RenderExecutor for FakeRenderer {
    fn staging_bytes(&self, _assignment: &Assignment) -> usize {
        self.staging
    }

    async fn render(
        &self,
        assignment: &Assignment,
        cache: &AssetCache,
        staging: &mut [u8],
    ) -> Result<RenderMetrics, String> {
        let script = cache
            .get_or_load(&assignment.job_id.to_string(), || Ok::<_, String>(vec![1u8; 8]))
            .map_err(|e| e.to_string())?;
        tokio::time::sleep(self.delay).await;
        if let Some(message) = self.fail_with {
            return Err(message.to_string());
        }
        staging.fill(script[0]);
        self.rendered.fetch_add(1, Ordering::SeqCst);
        Ok(RenderMetrics {
            output_files: Some(assignment.frames.len()),
            output_bytes: Some(u64::try_from(staging.len()).unwrap()),
            ..RenderMetrics::default()
        })
    }
}

fn farm() -> Arc<Scheduler> {
    build_coordinator(&FarmConfig::default(), Arc::new(InMemoryStore::new()), now_ms())
        .unwrap()
        .scheduler
}

fn settings() -> NodeSettings {
    NodeSettings {
        address: "render-local:7100".into(),
        renderers: vec![RendererKind::Nuke],
        capacity: 2,
        mem_available: Some(8 * 1024 * 1024 * 1024),
        sample_host: false,
        slot_retry_limit: 2,
        slot_retry_delay: Duration::from_millis(1),
        heartbeat_interval: Duration::from_millis(50),
    }
}

fn node_with(
    farm: &Arc<Scheduler>,
    renderer: FakeRenderer,
    classes: &[SizeClass],
    settings: NodeSettings,
) -> Arc<WorkerNode<Arc<Scheduler>, FakeRenderer>> {
    let buffers = BufferPool::new(classes, ExhaustionPolicy::FailFast).unwrap();
    Arc::new(WorkerNode::new(
        Arc::clone(farm),
        renderer,
        Arc::new(AssetCache::new(1024)),
        buffers,
        settings,
    ))
}

fn node(farm: &Arc<Scheduler>, renderer: FakeRenderer, classes: &[SizeClass]) -> Arc<WorkerNode<Arc<Scheduler>, FakeRenderer>> {
    node_with(farm, renderer, classes, settings())
}

async fn drain<L, E>(node: &WorkerNode<L, E>)
where
    L: render_farm::worker::CoordinatorLink,
    E: RenderExecutor,
{
    for _ in 0..200 {
        if node.in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("batches still running");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_renders_assignments_to_completion() {
    let farm = farm();
    let node = node(&farm, FakeRenderer::ok(512), &[SizeClass { size: 1024, count: 2 }]);
    let worker_id = node.register().await.unwrap();

    let spec = JobSpec::new(RendererKind::Nuke, FrameRange::new(1, 20).unwrap()).with_batch_size(10);
    let job = farm.submit(&spec, now_ms()).unwrap();
    assert_eq!(farm.tick(now_ms()).len(), 2);

    let started = node.sync_once().await.unwrap();
    assert_eq!(started.len(), 2);
    // Assignments already running are not started twice.
    assert!(node.sync_once().await.unwrap().len() <= 2);
    drain(&node).await;

    let view = farm.job_status(job).unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(farm.worker(worker_id).unwrap().load, 0);
    assert!(node.cache().contains(&job.to_string()));
    for batch in &view.batches {
        let metrics = batch.metrics.as_ref().unwrap();
        assert_eq!(metrics.output_files, Some(10));
        assert_eq!(metrics.output_bytes, Some(1024));
        assert!(metrics.render_time_ms >= 5);
    }
}

#[tokio::test]
async fn test_heartbeat_sends_fresh_host_readings() {
    let farm = farm();
    let stale = NodeSettings {
        mem_available: Some(1),
        sample_host: true,
        ..settings()
    };
    let node = node_with(&farm, FakeRenderer::ok(16), &[SizeClass { size: 16, count: 1 }], stale);
    let worker_id = node.register().await.unwrap();
    assert_eq!(farm.worker(worker_id).unwrap().mem_available, Some(1));

    node.sync_once().await.unwrap();
    let worker = farm.worker(worker_id).unwrap();
    let host = worker.host_metrics.unwrap();
    assert!(host.memory_available_bytes > 1);
    assert_eq!(worker.mem_available, Some(host.memory_available_bytes));
    assert!((0.0..=100.0).contains(&host.memory_percent));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redispatch_to_same_node_runs_again() {
    let farm = Arc::new(Scheduler::new(
        QueueLimits::default(),
        LivenessTimeouts::default(),
        RetryManager::default(),
        DispatchTimeouts {
            base: Duration::from_millis(20),
            multipliers: std::collections::HashMap::new(),
        },
        Arc::new(InMemoryStore::new()),
    ));
    let renderer = FakeRenderer {
        delay: Duration::from_millis(200),
        ..FakeRenderer::ok(64)
    };
    let node = node(&farm, renderer, &[SizeClass { size: 64, count: 2 }]);
    let worker_id = node.register().await.unwrap();

    let job = farm
        .submit(&JobSpec::new(RendererKind::Nuke, FrameRange::new(1, 5).unwrap()), now_ms())
        .unwrap();
    let first = farm.tick(now_ms()).pop().unwrap();
    assert_eq!(node.sync_once().await.unwrap(), vec![first.batch_id]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(farm.sweep(now_ms()).timed_out, 1);
    let second = farm.tick(now_ms()).pop().unwrap();
    assert_eq!(second.worker_id, worker_id);
    assert_eq!(second.attempt, 1);

    // The earlier run is still going, but the new epoch starts its own.
    assert_eq!(node.sync_once().await.unwrap(), vec![first.batch_id]);
    assert_eq!(node.in_flight(), 2);
    drain(&node).await;

    // Only the second run's report counted.
    assert_eq!(farm.job_status(job).unwrap().status, JobStatus::Completed);
    assert_eq!(farm.batch(first.batch_id).unwrap().attempts, 1);
    assert_eq!(farm.worker(worker_id).unwrap().load, 0);
}

#[tokio::test]
async fn test_node_reports_permanent_failure() {
    let farm = farm();
    let renderer = FakeRenderer {
        fail_with: Some("Missing plugin: OFXsapphire"),
        ..FakeRenderer::ok(64)
    };
    let node = node(&farm, renderer, &[SizeClass { size: 64, count: 1 }]);
    node.register().await.unwrap();

    let job = farm
        .submit(&JobSpec::new(RendererKind::Nuke, FrameRange::new(1, 5).unwrap()), now_ms())
        .unwrap();
    let assignment = farm.tick(now_ms()).pop().unwrap();

    let result = node.run_batch(assignment).await;
    assert!(matches!(result, BatchResult::Failed(FailureReason::UnsupportedFeature(_))));
    assert_eq!(farm.job_status(job).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_node_reports_resource_exhaustion_as_transient() {
    let farm = farm();
    // Staging need exceeds every buffer class.
    let node = node(&farm, FakeRenderer::ok(4096), &[SizeClass { size: 256, count: 1 }]);
    node.register().await.unwrap();

    farm.submit(&JobSpec::new(RendererKind::Nuke, FrameRange::new(1, 5).unwrap()), now_ms())
        .unwrap();
    let assignment = farm.tick(now_ms()).pop().unwrap();
    let batch_id = assignment.batch_id;

    let result = node.run_batch(assignment).await;
    assert!(matches!(result, BatchResult::Failed(FailureReason::ResourceExhausted(_))));
    let batch = farm.batch(batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);
    assert_eq!(batch.attempts, 1);
}

#[tokio::test]
async fn test_sync_requires_registration() {
    let farm = farm();
    let node = node(&farm, FakeRenderer::ok(16), &[SizeClass { size: 16, count: 1 }]);
    assert!(node.sync_once().await.is_err());
    assert!(node.worker_id().is_none());
}
