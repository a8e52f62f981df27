//! Host resource detection and the sizing rules derived from it.

use sysinfo::System;

use crate::config::WorkerConfig;
use crate::core::worker_registry::HostMetrics;

/// Cores and memory visible to the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemResources {
    /// Logical CPU cores.
    pub cores: usize,
    /// Memory available for new allocations, in bytes.
    pub available_memory: u64,
    /// Installed memory, in bytes.
    pub total_memory: u64,
}

impl SystemResources {
    /// Probe the host.
    #[must_use]
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let resources = Self {
            cores: num_cpus::get(),
            available_memory: sys.available_memory(),
            total_memory: sys.total_memory(),
        };
        tracing::info!(
            cores = resources.cores,
            available_mb = resources.available_memory / (1024 * 1024),
            total_mb = resources.total_memory / (1024 * 1024),
            "detected host resources"
        );
        resources
    }
}

/// Repeated host sampling for heartbeats.
///
/// CPU usage is a delta between refreshes, so the first sample after
/// construction reads as idle.
pub struct HostSampler {
    sys: System,
}

impl HostSampler {
    /// Start sampling.
    #[must_use]
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        Self { sys }
    }

    /// Refresh and read current usage.
    pub fn sample(&mut self) -> HostMetrics {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();
        host_metrics(
            self.sys.global_cpu_usage(),
            self.sys.available_memory(),
            self.sys.total_memory(),
        )
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn host_metrics(cpu_percent: f32, available: u64, total: u64) -> HostMetrics {
    let memory_percent = if total == 0 {
        0.0
    } else {
        (total.saturating_sub(available) as f64 * 100.0 / total as f64) as f32
    };
    HostMetrics {
        cpu_percent,
        memory_percent,
        memory_available_bytes: available,
    }
}

/// Concurrency and cache size chosen for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSizing {
    /// Concurrent batches to advertise as capacity.
    pub concurrency: u32,
    /// Asset cache capacity in bytes.
    pub cache_bytes: u64,
}

impl WorkerSizing {
    /// Derive sizing from detected resources and configuration.
    #[must_use]
    pub fn derive(resources: &SystemResources, cfg: &WorkerConfig) -> Self {
        Self {
            concurrency: recommended_concurrency(resources, cfg),
            cache_bytes: cache_capacity(resources.available_memory, cfg.cache_memory_fraction, cfg.cache_max_bytes),
        }
    }
}

/// Concurrent batches the host can sustain: the smaller of the CPU share and
/// the memory share, capped by `max_concurrency`, never below one.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn recommended_concurrency(resources: &SystemResources, cfg: &WorkerConfig) -> u32 {
    let by_cpu = (resources.cores as f64 * cfg.cpu_fraction).floor() as u64;
    let by_memory = ((resources.available_memory as f64 * cfg.memory_fraction)
        / cfg.memory_per_batch_bytes.max(1) as f64)
        .floor() as u64;
    let n = by_cpu.min(by_memory).min(u64::from(cfg.max_concurrency)).max(1);
    u32::try_from(n).unwrap_or(cfg.max_concurrency)
}

/// Cache capacity: `fraction` of available memory, optionally clamped.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn cache_capacity(available_memory: u64, fraction: f64, max_bytes: Option<u64>) -> u64 {
    let bytes = (available_memory as f64 * fraction.clamp(0.0, 1.0)).floor() as u64;
    max_bytes.map_or(bytes, |max| bytes.min(max))
}
