//! # Render Farm
//!
//! Coordination engine for a render farm: a central coordinator splits jobs
//! into frame batches, tracks worker liveness through heartbeats, dispatches
//! batches to capable workers by priority, and retries failures with
//! exponential backoff. Worker nodes run batches through a pluggable renderer
//! backed by a byte-bounded asset cache and a fixed staging buffer pool.
//!
//! ## Coordinator
//!
//! All coordinator state lives in [`core::Scheduler`]. Every operation takes
//! an explicit clock value so the state machine can be driven from tests
//! without sleeping.
//!
//! ```rust,ignore
//! use render_farm::builders::build_coordinator;
//! use render_farm::config::FarmConfig;
//! use render_farm::core::{BatchReport, BatchResult, JobSpec, WorkerInfo};
//! use render_farm::infra::InMemoryStore;
//! use render_farm::util::{now_ms, FrameRange, Priority, RendererKind};
//!
//! let coordinator = build_coordinator(&FarmConfig::default(), Arc::new(InMemoryStore::new()), now_ms())?;
//! let farm = coordinator.scheduler;
//!
//! let job = farm.submit(&JobSpec {
//!     title: "sq010_sh020_comp".into(),
//!     renderer: RendererKind::Nuke,
//!     frames: FrameRange::new(1001, 1100)?,
//!     priority: Priority::High,
//!     batch_size: Some(10),
//! }, now_ms())?;
//!
//! let ack = farm.register_worker(WorkerInfo {
//!     address: "render-07:7100".into(),
//!     capacity: 4,
//!     renderers: vec![RendererKind::Nuke],
//!     mem_available: None,
//! }, now_ms())?;
//!
//! for a in farm.tick(now_ms()) {
//!     farm.report(&BatchReport::new(&a, BatchResult::Succeeded), now_ms())?;
//! }
//! ```
//!
//! ## Service
//!
//! With the `tokio-runtime` feature, [`runtime::CoordinatorService`] runs the
//! command loop, the heartbeat monitor, and the dispatch loop as tasks and
//! hands out a cloneable [`runtime::CoordinatorHandle`].
//!
//! ## Workers
//!
//! [`worker::WorkerNode`] registers, heartbeats, and runs assignments through
//! a [`worker::RenderExecutor`]. The link to the coordinator is a
//! [`worker::CoordinatorLink`], implemented both for an in-process scheduler
//! and for a service handle.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Coordinator state machine: queue, registry, retries, scheduler.
pub mod core;
/// Configuration models for the coordinator, batching, retries, and workers.
pub mod config;
/// Builders to construct coordinator and worker components from configuration.
pub mod builders;
/// Persistence backends for coordinator state.
pub mod infra;
/// Service loops, spawner adapters, and the request surface.
pub mod runtime;
/// Worker-side components: asset cache, buffer pool, node agent.
pub mod worker;
/// Shared utilities.
pub mod util;
