//! Worker-side resources and the render node agent.

pub mod asset_cache;
pub mod buffer_pool;
pub mod executor;
pub mod memory;
#[cfg(feature = "tokio-runtime")]
pub mod node;

pub use asset_cache::{AssetCache, CacheError, CacheStats};
pub use buffer_pool::{BufferPool, BufferSlot, ExhaustionPolicy, PoolError, SizeClass};
pub use executor::{CoordinatorLink, RenderExecutor};
pub use memory::{cache_capacity, recommended_concurrency, HostSampler, SystemResources, WorkerSizing};
#[cfg(feature = "tokio-runtime")]
pub use node::{NodeSettings, WorkerNode};
