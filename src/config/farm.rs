//! Render farm configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::error::AppResult;
use crate::util::serde::RendererKind;

const GIB: u64 = 1024 * 1024 * 1024;

/// State store backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendConfig {
    /// Volatile in-memory store.
    InMemory,
    /// JSON-lines files under a directory.
    File {
        /// Directory holding the table files.
        path: String,
    },
}

/// Liveness, timeouts, and service loop timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Expected heartbeat period.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a worker is offline.
    pub offline_timeout_ms: u64,
    /// Offline period after which an idle worker is removed.
    pub removal_timeout_ms: u64,
    /// Period of the liveness sweep.
    pub sweep_interval_ms: u64,
    /// Fallback period of the dispatch loop.
    pub dispatch_interval_ms: u64,
    /// Base per-batch execution timeout.
    pub job_timeout_secs: u64,
    /// Per-renderer multiplier applied to `job_timeout_secs`.
    pub renderer_timeout_multipliers: HashMap<RendererKind, f64>,
    /// How long finished jobs are kept.
    pub retention_secs: u64,
    /// Admission bound on non-terminal jobs.
    pub max_active_jobs: usize,
    /// Depth of the service command channel.
    pub command_buffer: usize,
    /// Audit events kept in memory.
    pub audit_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 10_000,
            offline_timeout_ms: 30_000,
            removal_timeout_ms: 600_000,
            sweep_interval_ms: 5_000,
            dispatch_interval_ms: 1_000,
            job_timeout_secs: 3_600,
            renderer_timeout_multipliers: HashMap::from([
                (RendererKind::Nuke, 1.0),
                (RendererKind::Silhouette, 1.5),
                (RendererKind::Fusion, 2.0),
            ]),
            retention_secs: 7 * 24 * 60 * 60,
            max_active_jobs: 10_000,
            command_buffer: 1_024,
            audit_capacity: 10_000,
        }
    }
}

impl CoordinatorConfig {
    /// Dispatch timeout for a batch of `renderer`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn timeout_for(&self, renderer: RendererKind) -> Duration {
        let factor = self
            .renderer_timeout_multipliers
            .get(&renderer)
            .copied()
            .unwrap_or(1.0);
        Duration::from_secs_f64(self.job_timeout_secs as f64 * factor)
    }

    /// Validate coordinator values.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_ms == 0 {
            return Err("heartbeat_interval_ms must be greater than 0".into());
        }
        if self.offline_timeout_ms <= self.heartbeat_interval_ms {
            return Err("offline_timeout_ms must exceed heartbeat_interval_ms".into());
        }
        if self.sweep_interval_ms == 0 || self.dispatch_interval_ms == 0 {
            return Err("sweep and dispatch intervals must be greater than 0".into());
        }
        if self.job_timeout_secs == 0 {
            return Err("job_timeout_secs must be greater than 0".into());
        }
        if let Some((kind, f)) = self
            .renderer_timeout_multipliers
            .iter()
            .find(|(_, f)| !f.is_finite() || **f <= 0.0)
        {
            return Err(format!("timeout multiplier for {kind} must be positive, got {f}"));
        }
        if self.max_active_jobs == 0 {
            return Err("max_active_jobs must be greater than 0".into());
        }
        if self.command_buffer == 0 {
            return Err("command_buffer must be greater than 0".into());
        }
        Ok(())
    }
}

/// Frame batching bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Smallest batch.
    pub min_batch_size: u64,
    /// Largest batch.
    pub max_batch_size: u64,
    /// Size used when a submission does not request one.
    pub default_batch_size: u64,
    /// Most batches one job may split into; larger submissions are rejected.
    pub max_batches_per_job: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 100,
            default_batch_size: 10,
            max_batches_per_job: 10_000,
        }
    }
}

impl BatchConfig {
    /// Validate batch bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_batch_size == 0 {
            return Err("min_batch_size must be greater than 0".into());
        }
        if self.min_batch_size > self.max_batch_size {
            return Err("min_batch_size must not exceed max_batch_size".into());
        }
        if !(self.min_batch_size..=self.max_batch_size).contains(&self.default_batch_size) {
            return Err("default_batch_size must lie within [min_batch_size, max_batch_size]".into());
        }
        if self.max_batches_per_job == 0 {
            return Err("max_batches_per_job must be greater than 0".into());
        }
        Ok(())
    }
}

/// Retry and backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed per batch for transient failures.
    pub max_retries: u32,
    /// Lower retry bound for failures that match no known pattern.
    pub unclassified_retry_cap: u32,
    /// First backoff delay.
    pub backoff_first_ms: u64,
    /// Backoff ceiling.
    pub backoff_max_ms: u64,
    /// Backoff growth factor.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            unclassified_retry_cap: 2,
            backoff_first_ms: 5_000,
            backoff_max_ms: 300_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Validate retry values.
    pub fn validate(&self) -> Result<(), String> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err("backoff_factor must be at least 1.0".into());
        }
        if self.backoff_first_ms > self.backoff_max_ms {
            return Err("backoff_first_ms must not exceed backoff_max_ms".into());
        }
        Ok(())
    }
}

/// Behaviour when a buffer pool class has no free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionConfig {
    /// Return an error immediately.
    FailFast,
    /// Wait for a slot up to the timeout.
    Block {
        /// Maximum wait.
        timeout_ms: u64,
    },
}

/// One buffer pool size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferClassConfig {
    /// Bytes per buffer.
    pub size_bytes: usize,
    /// Buffers allocated for the class.
    pub count: usize,
}

/// Worker-side resource sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Share of available memory given to the asset cache.
    pub cache_memory_fraction: f64,
    /// Hard ceiling on cache size.
    pub cache_max_bytes: Option<u64>,
    /// Buffer pool size classes.
    pub buffer_classes: Vec<BufferClassConfig>,
    /// Buffer pool exhaustion policy.
    pub exhaustion: ExhaustionConfig,
    /// Attempts to obtain a buffer slot before reporting resource exhaustion.
    pub slot_retry_limit: u32,
    /// Pause between slot attempts.
    pub slot_retry_delay_ms: u64,
    /// Share of CPU cores used for concurrent batches.
    pub cpu_fraction: f64,
    /// Share of available memory used for concurrent batches.
    pub memory_fraction: f64,
    /// Memory budgeted per concurrent batch.
    pub memory_per_batch_bytes: u64,
    /// Upper bound on concurrent batches.
    pub max_concurrency: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_memory_fraction: 0.3,
            cache_max_bytes: Some(8 * GIB),
            buffer_classes: vec![
                BufferClassConfig {
                    size_bytes: 1024 * 1024,
                    count: 32,
                },
                BufferClassConfig {
                    size_bytes: 16 * 1024 * 1024,
                    count: 8,
                },
                BufferClassConfig {
                    size_bytes: 64 * 1024 * 1024,
                    count: 2,
                },
            ],
            exhaustion: ExhaustionConfig::Block { timeout_ms: 5_000 },
            slot_retry_limit: 3,
            slot_retry_delay_ms: 500,
            cpu_fraction: 0.75,
            memory_fraction: 0.8,
            memory_per_batch_bytes: 2 * GIB,
            max_concurrency: 12,
        }
    }
}

impl WorkerConfig {
    /// Validate worker sizing values.
    pub fn validate(&self) -> Result<(), String> {
        for (name, f) in [
            ("cache_memory_fraction", self.cache_memory_fraction),
            ("cpu_fraction", self.cpu_fraction),
            ("memory_fraction", self.memory_fraction),
        ] {
            if !(f > 0.0 && f <= 1.0) {
                return Err(format!("{name} must be in (0, 1], got {f}"));
            }
        }
        if self.buffer_classes.is_empty() {
            return Err("at least one buffer class must be defined".into());
        }
        if self.buffer_classes.iter().any(|c| c.size_bytes == 0 || c.count == 0) {
            return Err("buffer classes need a positive size and count".into());
        }
        if self.memory_per_batch_bytes == 0 {
            return Err("memory_per_batch_bytes must be greater than 0".into());
        }
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    /// Coordinator timing and limits.
    pub coordinator: CoordinatorConfig,
    /// Batch sizing.
    pub batching: BatchConfig,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Worker resource sizing.
    pub worker: WorkerConfig,
    /// State store backend.
    pub store: StoreBackendConfig,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            batching: BatchConfig::default(),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            store: StoreBackendConfig::InMemory,
        }
    }
}

impl FarmConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.coordinator
            .validate()
            .map_err(|e| format!("coordinator invalid: {e}"))?;
        self.batching
            .validate()
            .map_err(|e| format!("batching invalid: {e}"))?;
        self.retry.validate().map_err(|e| format!("retry invalid: {e}"))?;
        self.worker.validate().map_err(|e| format!("worker invalid: {e}"))?;
        if let StoreBackendConfig::File { path } = &self.store {
            if path.trim().is_empty() {
                return Err("store path must not be empty".into());
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from the environment.
    ///
    /// Reads `.env` if present, starts from the JSON file named by
    /// `RENDER_FARM_CONFIG` (or defaults), then applies `RENDER_FARM_*`
    /// overrides.
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        let mut cfg = match std::env::var("RENDER_FARM_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {path}"))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))?
            }
            Err(_) => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }

    /// Apply `RENDER_FARM_*` overrides from an arbitrary lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> AppResult<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{key}={raw}: {e}"))
        }

        let c = &mut self.coordinator;
        if let Some(v) = lookup("RENDER_FARM_HEARTBEAT_INTERVAL_MS") {
            c.heartbeat_interval_ms = parse("RENDER_FARM_HEARTBEAT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("RENDER_FARM_OFFLINE_TIMEOUT_MS") {
            c.offline_timeout_ms = parse("RENDER_FARM_OFFLINE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RENDER_FARM_JOB_TIMEOUT_SECS") {
            c.job_timeout_secs = parse("RENDER_FARM_JOB_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("RENDER_FARM_MAX_ACTIVE_JOBS") {
            c.max_active_jobs = parse("RENDER_FARM_MAX_ACTIVE_JOBS", &v)?;
        }
        if let Some(v) = lookup("RENDER_FARM_MAX_RETRIES") {
            self.retry.max_retries = parse("RENDER_FARM_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("RENDER_FARM_DEFAULT_BATCH_SIZE") {
            self.batching.default_batch_size = parse("RENDER_FARM_DEFAULT_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("RENDER_FARM_MAX_BATCHES_PER_JOB") {
            self.batching.max_batches_per_job = parse("RENDER_FARM_MAX_BATCHES_PER_JOB", &v)?;
        }
        if let Some(v) = lookup("RENDER_FARM_CACHE_FRACTION") {
            self.worker.cache_memory_fraction = parse("RENDER_FARM_CACHE_FRACTION", &v)?;
        }
        if let Some(path) = lookup("RENDER_FARM_STORE_PATH") {
            self.store = StoreBackendConfig::File { path };
        }
        Ok(())
    }

    /// Heartbeat interval as a duration.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.heartbeat_interval_ms)
    }
}
