//! Job worker and runner loop.
//!
//! One cycle: claim a batch (reclaiming expired leases first), execute every
//! claimed job concurrently, wait for all of them, then sleep the poll
//! interval. Several workers may run against the same store; exclusion comes
//! from the store, not from anything in this process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use courier_core::{defaults, Error, JobStore, Result};

use crate::backoff::BackoffPolicy;
use crate::claimer::Claimer;
use crate::enqueue::Enqueuer;
use crate::executor::{ExecutionOutcome, Executor};
use crate::handler::{HandlerRegistry, JobHandler};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written to `locked_by` on claimed jobs.
    pub worker_id: String,
    /// Sleep between cycles, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum jobs claimed (and run concurrently) per cycle.
    pub batch_size: usize,
    /// Lease duration after which a `RUNNING` job counts as stuck.
    pub lease_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Attempt budget for jobs enqueued through this worker without one.
    pub max_attempts: i32,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            batch_size: defaults::JOB_BATCH_SIZE,
            lease_secs: defaults::JOB_LEASE_SECS,
            backoff_base_secs: defaults::JOB_BACKOFF_BASE_SECS,
            backoff_cap_secs: defaults::JOB_BACKOFF_CAP_SECS,
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
            enabled: true,
        }
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8])
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `COURIER_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `COURIER_WORKER_ID` | `worker-<random>` | Lease owner identity |
    /// | `COURIER_POLL_INTERVAL_MS` | `5000` | Sleep between cycles |
    /// | `COURIER_BATCH_SIZE` | `10` | Jobs claimed per cycle |
    /// | `COURIER_LEASE_SECS` | `60` | Stuck-job threshold |
    /// | `COURIER_BACKOFF_BASE_SECS` | `30` | First retry delay unit |
    /// | `COURIER_BACKOFF_CAP_SECS` | `3600` | Retry delay ceiling |
    /// | `COURIER_MAX_ATTEMPTS` | `5` | Default attempt budget |
    pub fn from_env() -> Self {
        let enabled = std::env::var("COURIER_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let worker_id = std::env::var("COURIER_WORKER_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(default_worker_id);

        Self {
            worker_id,
            poll_interval_ms: env_or("COURIER_POLL_INTERVAL_MS", defaults::JOB_POLL_INTERVAL_MS),
            batch_size: env_or("COURIER_BATCH_SIZE", defaults::JOB_BATCH_SIZE).max(1),
            lease_secs: env_or("COURIER_LEASE_SECS", defaults::JOB_LEASE_SECS),
            backoff_base_secs: env_or(
                "COURIER_BACKOFF_BASE_SECS",
                defaults::JOB_BACKOFF_BASE_SECS,
            ),
            backoff_cap_secs: env_or("COURIER_BACKOFF_CAP_SECS", defaults::JOB_BACKOFF_CAP_SECS),
            max_attempts: env_or("COURIER_MAX_ATTEMPTS", defaults::JOB_MAX_ATTEMPTS).max(1),
            enabled,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Set the poll interval in milliseconds.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the per-cycle batch size (at least 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_lease_secs(mut self, secs: u64) -> Self {
        self.lease_secs = secs;
        self
    }

    pub fn with_backoff(mut self, base_secs: u64, cap_secs: u64) -> Self {
        self.backoff_base_secs = base_secs;
        self.backoff_cap_secs = cap_secs;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::from_secs(self.backoff_base_secs, self.backoff_cap_secs)
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted { worker_id: String },
    /// A claimed job was handed to the executor.
    JobStarted { job_id: Uuid, kind: String },
    /// A job's execution finished with the given outcome.
    JobFinished {
        job_id: Uuid,
        kind: String,
        outcome: ExecutionOutcome,
    },
    /// The claim step failed; the cycle was skipped.
    ClaimFailed { error: String },
    /// A cycle finished.
    CycleCompleted { claimed: usize },
    /// Worker stopped.
    WorkerStopped { worker_id: String },
}

/// Next worker event, skipping over any the receiver fell behind on.
///
/// `None` once the worker is gone.
pub async fn recv_event(events: &mut broadcast::Receiver<WorkerEvent>) -> Option<WorkerEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    skipped,
                    "Event receiver lagged, skipped events"
                );
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    ///
    /// The in-flight cycle finishes first; jobs are never abandoned mid-run.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }

    /// Wait for the worker loop to exit.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {e}")))
    }
}

/// Job worker that processes jobs from the queue.
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    claimer: Claimer,
    executor: Executor,
    enqueuer: Enqueuer,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(store: Arc<dyn JobStore>, config: WorkerConfig, handlers: HandlerRegistry) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        let enqueuer = Enqueuer::new(store.clone()).with_default_max_attempts(config.max_attempts);
        let executor = Executor::new(store.clone(), Arc::new(handlers), config.backoff())
            .with_enqueuer(enqueuer.clone());
        Self {
            claimer: Claimer::new(store.clone(), config.lease()),
            executor,
            enqueuer,
            store,
            config,
            event_tx,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueuer bound to this worker's store and default attempt budget.
    pub fn enqueuer(&self) -> Enqueuer {
        self.enqueuer.clone()
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let task = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    /// Run the worker loop until a shutdown signal arrives or every handle
    /// is dropped.
    #[instrument(skip(self, shutdown_rx), fields(worker_id = %self.config.worker_id))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            lease_secs = self.config.lease_secs,
            handlers = ?self.executor.handlers().kinds(),
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted {
            worker_id: self.config.worker_id.clone(),
        });

        let poll_interval = self.config.poll_interval();

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            if let Err(e) = self.run_once().await {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    error = %e,
                    "Failed to claim jobs"
                );
                let _ = self.event_tx.send(WorkerEvent::ClaimFailed {
                    error: e.to_string(),
                });
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Job worker received shutdown signal");
                    break;
                }
                _ = sleep(poll_interval) => {}
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped {
            worker_id: self.config.worker_id.clone(),
        });
        info!("Job worker stopped");
    }

    /// Run one claim + execute cycle and wait for every claimed job.
    ///
    /// Returns the outcome per claimed job, in completion order. Only a
    /// failing claim query is an error.
    pub async fn run_once(&self) -> Result<Vec<(Uuid, ExecutionOutcome)>> {
        let start = Instant::now();
        let worker_id = self.config.worker_id.as_str();
        let jobs = self.claimer.claim(worker_id, self.config.batch_size).await?;
        let claimed = jobs.len();

        let mut tasks = tokio::task::JoinSet::new();
        for job in jobs {
            let _ = self.event_tx.send(WorkerEvent::JobStarted {
                job_id: job.id,
                kind: job.kind.clone(),
            });
            let executor = self.executor.clone();
            let worker_id = worker_id.to_string();
            tasks.spawn(async move {
                let job_id = job.id;
                let kind = job.kind.clone();
                let outcome = executor.execute(&worker_id, job).await;
                (job_id, kind, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(claimed);
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((job_id, kind, outcome)) => {
                    let _ = self.event_tx.send(WorkerEvent::JobFinished {
                        job_id,
                        kind,
                        outcome: outcome.clone(),
                    });
                    outcomes.push((job_id, outcome));
                }
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "worker",
                        error = ?e,
                        "Job task panicked"
                    );
                }
            }
        }

        if claimed > 0 {
            debug!(
                subsystem = "jobs",
                component = "worker",
                claimed,
                duration_ms = start.elapsed().as_millis() as u64,
                "Cycle completed"
            );
        }
        let _ = self.event_tx.send(WorkerEvent::CycleCompleted { claimed });
        Ok(outcomes)
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    store: Arc<dyn JobStore>,
    config: WorkerConfig,
    handlers: HandlerRegistry,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            config: WorkerConfig::default(),
            handlers: HandlerRegistry::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.register(handler);
        self
    }

    /// Replace the handler registry wholesale.
    pub fn with_registry(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Build and return the worker.
    pub fn build(self) -> JobWorker {
        JobWorker::new(self.store, self.config, self.handlers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::EnqueueOptions;
    use courier_db::InMemoryJobStore;
    use serde_json::json;

    use crate::handler::NoOpHandler;

    #[tokio::test]
    async fn test_recv_event_skips_lag_and_ends_on_close() {
        let (tx, mut rx) = broadcast::channel(2);
        for claimed in 0..5 {
            tx.send(WorkerEvent::CycleCompleted { claimed }).unwrap();
        }

        assert_eq!(
            recv_event(&mut rx).await,
            Some(WorkerEvent::CycleCompleted { claimed: 3 })
        );
        assert_eq!(
            recv_event(&mut rx).await,
            Some(WorkerEvent::CycleCompleted { claimed: 4 })
        );
        drop(tx);
        assert_eq!(recv_event(&mut rx).await, None);
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, 5_000);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.lease_secs, 60);
        assert_eq!(config.max_attempts, 5);
        assert!(config.enabled);
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.backoff(), BackoffPolicy::default());
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_worker_id("w-test")
            .with_poll_interval(250)
            .with_batch_size(0)
            .with_lease_secs(5)
            .with_backoff(1, 8)
            .with_max_attempts(-3)
            .with_enabled(false);

        assert_eq!(config.worker_id, "w-test");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.lease(), Duration::from_secs(5));
        assert_eq!(config.backoff(), BackoffPolicy::from_secs(1, 8));
        assert_eq!(config.max_attempts, 1);
        assert!(!config.enabled);
    }

    #[test]
    fn test_worker_config_from_env() {
        std::env::set_var("COURIER_WORKER_ID", "env-worker");
        std::env::set_var("COURIER_BATCH_SIZE", "3");
        std::env::set_var("COURIER_LEASE_SECS", "not-a-number");
        std::env::set_var("COURIER_WORKER_ENABLED", "0");

        let config = WorkerConfig::from_env();

        std::env::remove_var("COURIER_WORKER_ID");
        std::env::remove_var("COURIER_BATCH_SIZE");
        std::env::remove_var("COURIER_LEASE_SECS");
        std::env::remove_var("COURIER_WORKER_ENABLED");

        assert_eq!(config.worker_id, "env-worker");
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.lease_secs, defaults::JOB_LEASE_SECS);
        assert!(!config.enabled);
    }

    #[tokio::test]
    async fn test_run_once_processes_batch() {
        let store = Arc::new(InMemoryJobStore::new());
        let worker = WorkerBuilder::new(store.clone())
            .with_config(WorkerConfig::default().with_worker_id("w1").with_batch_size(2))
            .with_handler(NoOpHandler::new("noop"))
            .build();

        for _ in 0..3 {
            worker
                .enqueuer()
                .enqueue("noop", json!({}), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let first = worker.run_once().await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|(_, o)| *o == ExecutionOutcome::Done));

        let second = worker.run_once().await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(worker.run_once().await.unwrap().is_empty());
        assert_eq!(store.queue_stats().await.unwrap().done, 3);
    }

    #[tokio::test]
    async fn test_run_once_reports_claim_error() {
        let store = Arc::new(InMemoryJobStore::new());
        let worker = WorkerBuilder::new(store.clone()).build();
        store.set_unavailable(true);
        assert!(worker.run_once().await.is_err());
    }

    #[tokio::test]
    async fn test_run_once_emits_events() {
        let store = Arc::new(InMemoryJobStore::new());
        let worker = WorkerBuilder::new(store.clone())
            .with_handler(NoOpHandler::new("noop"))
            .build();
        let mut events = worker.events();
        let id = worker
            .enqueuer()
            .enqueue("noop", json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        worker.run_once().await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            WorkerEvent::JobStarted {
                job_id: id,
                kind: "noop".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            WorkerEvent::JobFinished {
                job_id: id,
                kind: "noop".to_string(),
                outcome: ExecutionOutcome::Done
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            WorkerEvent::CycleCompleted { claimed: 1 }
        );
    }

    #[tokio::test]
    async fn test_disabled_worker_exits_immediately() {
        let store = Arc::new(InMemoryJobStore::new());
        let handle = WorkerBuilder::new(store)
            .with_config(WorkerConfig::default().with_enabled(false))
            .build()
            .start();

        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("disabled worker should exit")
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = Arc::new(InMemoryJobStore::new());
        let worker = WorkerBuilder::new(store)
            .with_config(WorkerConfig::default().with_worker_id("w1").with_poll_interval(10))
            .build();
        let mut events = worker.events();
        let handle = worker.start();

        assert_eq!(
            events.recv().await.unwrap(),
            WorkerEvent::WorkerStarted {
                worker_id: "w1".to_string()
            }
        );

        handle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
