//! Configuration models for the coordinator, batching, retries, workers, and storage.

pub mod farm;

pub use farm::{
    BatchConfig, BufferClassConfig, CoordinatorConfig, ExhaustionConfig, FarmConfig, RetryConfig,
    StoreBackendConfig, WorkerConfig,
};
