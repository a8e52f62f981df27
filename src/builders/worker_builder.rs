//! Assemble worker-side components from [`WorkerConfig`].

use std::time::Duration;

use crate::config::{ExhaustionConfig, WorkerConfig};
use crate::worker::buffer_pool::{BufferPool, ExhaustionPolicy, PoolError, SizeClass};

#[cfg(feature = "tokio-runtime")]
use std::sync::Arc;

#[cfg(feature = "tokio-runtime")]
use crate::util::serde::RendererKind;
#[cfg(feature = "tokio-runtime")]
use crate::worker::{
    asset_cache::AssetCache,
    executor::{CoordinatorLink, RenderExecutor},
    memory::{SystemResources, WorkerSizing},
    node::{NodeSettings, WorkerNode},
};

/// Map the configured exhaustion behaviour onto the pool policy.
#[must_use]
pub fn exhaustion_policy(cfg: &ExhaustionConfig) -> ExhaustionPolicy {
    match *cfg {
        ExhaustionConfig::FailFast => ExhaustionPolicy::FailFast,
        ExhaustionConfig::Block { timeout_ms } => ExhaustionPolicy::Block {
            timeout: Duration::from_millis(timeout_ms),
        },
    }
}

/// Allocate the staging buffer pool.
pub fn buffer_pool(cfg: &WorkerConfig) -> Result<BufferPool, PoolError> {
    cfg.validate().map_err(PoolError::InvalidConfig)?;
    let classes: Vec<SizeClass> = cfg
        .buffer_classes
        .iter()
        .map(|c| SizeClass {
            size: c.size_bytes,
            count: c.count,
        })
        .collect();
    BufferPool::new(&classes, exhaustion_policy(&cfg.exhaustion))
}

/// Size a node for `resources` and wire it to `link` and `executor`.
///
/// Capacity and cache size come from [`WorkerSizing::derive`]; the heartbeat
/// period is replaced by the coordinator's once the node registers.
#[cfg(feature = "tokio-runtime")]
pub fn build_worker_node<L, E>(
    cfg: &WorkerConfig,
    resources: &SystemResources,
    address: impl Into<String>,
    renderers: Vec<RendererKind>,
    link: L,
    executor: E,
) -> Result<WorkerNode<L, E>, PoolError>
where
    L: CoordinatorLink,
    E: RenderExecutor,
{
    let sizing = WorkerSizing::derive(resources, cfg);
    let buffers = buffer_pool(cfg)?;
    let cache = Arc::new(AssetCache::new(sizing.cache_bytes));
    let settings = NodeSettings {
        address: address.into(),
        renderers,
        capacity: sizing.concurrency,
        mem_available: Some(resources.available_memory),
        sample_host: true,
        slot_retry_limit: cfg.slot_retry_limit,
        slot_retry_delay: Duration::from_millis(cfg.slot_retry_delay_ms),
        heartbeat_interval: Duration::from_secs(10),
    };
    tracing::info!(
        capacity = settings.capacity,
        cache_bytes = sizing.cache_bytes,
        "worker node sized"
    );
    Ok(WorkerNode::new(link, executor, cache, buffers, settings))
}
