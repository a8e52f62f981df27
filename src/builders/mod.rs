//! Builders that assemble coordinator and worker components from configuration.

pub mod coordinator_builder;
pub mod worker_builder;

pub use coordinator_builder::{
    build_coordinator, build_store, dispatch_timeouts, liveness_timeouts, queue_limits,
    retry_manager, Coordinator,
};
#[cfg(feature = "tokio-runtime")]
pub use coordinator_builder::{service_settings, start_coordinator};
pub use worker_builder::{buffer_pool, exhaustion_policy};
#[cfg(feature = "tokio-runtime")]
pub use worker_builder::build_worker_node;
