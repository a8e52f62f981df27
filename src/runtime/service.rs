//! Coordinator service: command loop, liveness sweep, and dispatch loop.
//!
//! All inbound traffic goes through one bounded command channel with oneshot
//! replies. State-changing commands wake the dispatch loop through a shared
//! [`Notify`]; the loop also ticks on a fallback interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Notify};

use super::heartbeat::HeartbeatMonitor;
use super::Spawn;
use crate::core::error::SchedulerError;
use crate::core::job::{JobSpec, JobStatus};
use crate::core::job_queue::{AckEffect, CancelEffect};
use crate::core::scheduler::{BatchReport, HeartbeatAck, JobView, RegisterAck, Scheduler};
use crate::core::worker_registry::{Heartbeat, WorkerInfo};
use crate::util::clock::now_ms;
use crate::util::serde::{BatchId, JobId, WorkerId};

type Reply<T> = oneshot::Sender<Result<T, SchedulerError>>;

enum Command {
    Submit(JobSpec, Reply<JobId>),
    Status(JobId, Reply<JobView>),
    Cancel(JobId, Reply<CancelEffect>),
    Pause(JobId, Reply<JobStatus>),
    Resume(JobId, Reply<JobStatus>),
    Register(WorkerInfo, Reply<RegisterAck>),
    Heartbeat(Heartbeat, Reply<HeartbeatAck>),
    Report(BatchReport, Reply<AckEffect>),
    Deregister(WorkerId, Reply<Vec<BatchId>>),
}

/// Loop timing for the service.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    /// Period of the liveness sweep.
    pub sweep_interval: Duration,
    /// Fallback period of the dispatch loop.
    pub dispatch_interval: Duration,
    /// Depth of the command channel.
    pub command_buffer: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            dispatch_interval: Duration::from_secs(1),
            command_buffer: 1_024,
        }
    }
}

/// Starts the coordinator tasks.
pub struct CoordinatorService;

impl CoordinatorService {
    /// Spawn the command loop, heartbeat monitor, and dispatch loop on
    /// `spawner` and return a handle to them.
    pub fn start<S>(scheduler: Arc<Scheduler>, settings: ServiceSettings, spawner: &S) -> CoordinatorHandle
    where
        S: Spawn,
    {
        let (tx, rx) = mpsc::channel(settings.command_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());

        spawner.spawn(command_loop(
            Arc::clone(&scheduler),
            rx,
            Arc::clone(&wake),
            shutdown_rx.clone(),
        ));
        spawner.spawn(
            HeartbeatMonitor::new(Arc::clone(&scheduler), settings.sweep_interval, Arc::clone(&wake))
                .run(shutdown_rx.clone()),
        );
        spawner.spawn(dispatch_loop(
            Arc::clone(&scheduler),
            settings.dispatch_interval,
            wake,
            shutdown_rx,
        ));
        tracing::info!("coordinator service started");

        CoordinatorHandle {
            tx,
            shutdown: Arc::new(shutdown_tx),
            scheduler,
        }
    }
}

/// Cloneable client for a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
    shutdown: Arc<watch::Sender<bool>>,
    scheduler: Arc<Scheduler>,
}

impl CoordinatorHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SchedulerError::Backend("coordinator stopped".into()))?;
        rx.await
            .map_err(|_| SchedulerError::Backend("coordinator dropped the request".into()))?
    }

    /// Submit a job.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId, SchedulerError> {
        self.call(|r| Command::Submit(spec, r)).await
    }

    /// Job status with per-batch progress.
    pub async fn status(&self, job_id: JobId) -> Result<JobView, SchedulerError> {
        self.call(|r| Command::Status(job_id, r)).await
    }

    /// Cancel a job.
    pub async fn cancel(&self, job_id: JobId) -> Result<CancelEffect, SchedulerError> {
        self.call(|r| Command::Cancel(job_id, r)).await
    }

    /// Pause a job.
    pub async fn pause(&self, job_id: JobId) -> Result<JobStatus, SchedulerError> {
        self.call(|r| Command::Pause(job_id, r)).await
    }

    /// Resume a job.
    pub async fn resume(&self, job_id: JobId) -> Result<JobStatus, SchedulerError> {
        self.call(|r| Command::Resume(job_id, r)).await
    }

    /// Register a worker.
    pub async fn register(&self, info: WorkerInfo) -> Result<RegisterAck, SchedulerError> {
        self.call(|r| Command::Register(info, r)).await
    }

    /// Send a heartbeat.
    pub async fn heartbeat(&self, hb: Heartbeat) -> Result<HeartbeatAck, SchedulerError> {
        self.call(|r| Command::Heartbeat(hb, r)).await
    }

    /// Report a batch outcome.
    pub async fn report(&self, report: BatchReport) -> Result<AckEffect, SchedulerError> {
        self.call(|r| Command::Report(report, r)).await
    }

    /// Deregister a worker.
    pub async fn deregister(&self, worker_id: WorkerId) -> Result<Vec<BatchId>, SchedulerError> {
        self.call(|r| Command::Deregister(worker_id, r)).await
    }

    /// Direct read access for health and inspection.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Stop every service loop.
    pub async fn shutdown(&self) {
        if self.shutdown.send(true).is_err() {
            tracing::debug!("coordinator already stopped");
        }
        tokio::task::yield_now().await;
    }
}

async fn command_loop(
    scheduler: Arc<Scheduler>,
    mut rx: mpsc::Receiver<Command>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                if handle(&scheduler, cmd) {
                    wake.notify_one();
                }
            }
        }
    }
    match tokio::task::spawn_blocking(move || scheduler.flush_store()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "store flush failed on shutdown"),
        Err(e) => tracing::error!(error = %e, "store flush task failed"),
    }
    tracing::info!("coordinator command loop stopped");
}

/// Execute one command; returns whether dispatch should be re-run.
fn handle(scheduler: &Scheduler, cmd: Command) -> bool {
    let now = now_ms();
    match cmd {
        Command::Submit(spec, reply) => respond(reply, scheduler.submit(&spec, now)),
        Command::Status(id, reply) => {
            respond(reply, scheduler.job_status(id));
            false
        }
        Command::Cancel(id, reply) => respond(reply, scheduler.cancel(id, now)),
        Command::Pause(id, reply) => respond(reply, scheduler.pause(id, now)),
        Command::Resume(id, reply) => respond(reply, scheduler.resume(id, now)),
        Command::Register(info, reply) => respond(reply, scheduler.register_worker(info, now)),
        Command::Heartbeat(hb, reply) => respond(reply, scheduler.heartbeat(&hb, now)),
        Command::Report(report, reply) => respond(reply, scheduler.report(&report, now)),
        Command::Deregister(id, reply) => respond(reply, scheduler.deregister(id, now)),
    }
}

fn respond<T>(reply: Reply<T>, result: Result<T, SchedulerError>) -> bool {
    let changed = result.is_ok();
    if reply.send(result).is_err() {
        tracing::debug!("caller went away before the reply");
    }
    changed
}

async fn dispatch_loop(
    scheduler: Arc<Scheduler>,
    interval: Duration,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            () = wake.notified() => {}
            _ = ticker.tick() => {}
        }
        let placed = scheduler.tick(now_ms());
        if !placed.is_empty() {
            tracing::debug!(placed = placed.len(), "dispatch pass placed batches");
        }
    }
    tracing::info!("coordinator dispatch loop stopped");
}
