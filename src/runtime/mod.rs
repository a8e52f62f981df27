//! Runtime adapters and the coordinator's service surface.

pub mod api;
#[cfg(feature = "tokio-runtime")]
pub mod heartbeat;
#[cfg(feature = "tokio-runtime")]
pub mod service;
#[cfg(feature = "tokio-runtime")]
pub mod tokio_spawner;

use std::future::Future;

pub use api::{
    health, Health, HeartbeatRequest, RegisterWorkerRequest, ReportKind, ReportRequest,
    SubmitJobRequest, SubmitJobResponse,
};
#[cfg(feature = "tokio-runtime")]
pub use heartbeat::HeartbeatMonitor;
#[cfg(feature = "tokio-runtime")]
pub use service::{CoordinatorHandle, CoordinatorService, ServiceSettings};
#[cfg(feature = "tokio-runtime")]
pub use tokio_spawner::TokioSpawner;

/// Spawn abstraction so the service loops are not tied to one executor.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
