//! Executor: run the handler for a claimed job and record the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use courier_core::{defaults, now, truncate_error, Job, JobPatch, JobStore, Precondition};

use crate::backoff::BackoffPolicy;
use crate::enqueue::Enqueuer;
use crate::handler::{HandlerRegistry, JobContext, JobResult};

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler succeeded; job is `DONE`.
    Done,
    /// Handler failed with attempts left; job is `RETRY`.
    Retry { next_run_at: DateTime<Utc> },
    /// Handler failed on its last attempt; job is `DEAD` and dead-lettered.
    Dead,
    /// No handler for the kind; job is `FAILED`.
    Failed,
    /// The lease was taken over before the result could be written.
    LeaseLost,
    /// The final status write failed; the lease will expire and be reclaimed.
    StoreError(String),
}

/// Runs handlers and writes the resulting status transition.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    backoff: BackoffPolicy,
    enqueuer: Enqueuer,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            enqueuer: Enqueuer::new(store.clone()),
            store,
            handlers,
            backoff,
        }
    }

    /// Enqueuer handed to handlers for follow-on jobs.
    pub fn with_enqueuer(mut self, enqueuer: Enqueuer) -> Self {
        self.enqueuer = enqueuer;
        self
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Execute one claimed job. Never fails and never panics to the caller.
    ///
    /// Every status write is fenced on the lease the claim took
    /// (`RUNNING`, `locked_by`, claim-time `updated_at`).
    pub async fn execute(&self, worker_id: &str, job: Job) -> ExecutionOutcome {
        let start = Instant::now();
        let lease = Precondition::lease(&job);

        let Some(handler) = self.handlers.get(&job.kind) else {
            let message = format!("no handler registered for job kind: {}", job.kind);
            warn!(
                subsystem = "jobs",
                component = "executor",
                worker_id,
                job_id = %job.id,
                job_kind = %job.kind,
                "No handler registered for job kind"
            );
            return self
                .finish(&job, &lease, JobPatch::failed(message, now()), ExecutionOutcome::Failed)
                .await;
        };

        debug!(
            subsystem = "jobs",
            component = "executor",
            worker_id,
            job_id = %job.id,
            job_kind = %job.kind,
            attempts = job.attempts,
            "Processing job"
        );

        let ctx = JobContext::new(job.clone()).with_enqueuer(self.enqueuer.clone());
        let result = match AssertUnwindSafe(handler.execute(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => JobResult::Failed(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            JobResult::Success => {
                let outcome = self
                    .finish(&job, &lease, JobPatch::done(now()), ExecutionOutcome::Done)
                    .await;
                if outcome == ExecutionOutcome::Done {
                    info!(
                        subsystem = "jobs",
                        component = "executor",
                        worker_id,
                        job_id = %job.id,
                        job_kind = %job.kind,
                        attempts = job.attempts,
                        duration_ms,
                        "Job completed"
                    );
                }
                outcome
            }
            JobResult::Failed(message) => {
                let message = truncate_error(&message, defaults::JOB_ERROR_MAX_LEN);
                if job.has_attempts_left() {
                    let next_run_at = self.backoff.next_run_at(now(), job.attempts);
                    let outcome = self
                        .finish(
                            &job,
                            &lease,
                            JobPatch::retry(message.clone(), next_run_at, now()),
                            ExecutionOutcome::Retry { next_run_at },
                        )
                        .await;
                    if matches!(outcome, ExecutionOutcome::Retry { .. }) {
                        warn!(
                            subsystem = "jobs",
                            component = "executor",
                            worker_id,
                            job_id = %job.id,
                            job_kind = %job.kind,
                            attempts = job.attempts,
                            max_attempts = job.max_attempts,
                            next_run_at = %next_run_at,
                            duration_ms,
                            error = %message,
                            "Job failed, scheduled for retry"
                        );
                    }
                    outcome
                } else {
                    let outcome = self.finish_dead(&job, &lease, message.clone()).await;
                    if outcome == ExecutionOutcome::Dead {
                        error!(
                            subsystem = "jobs",
                            component = "executor",
                            worker_id,
                            job_id = %job.id,
                            job_kind = %job.kind,
                            attempts = job.attempts,
                            duration_ms,
                            error = %message,
                            "Job exhausted its attempts, moved to dead letters"
                        );
                    }
                    outcome
                }
            }
        }
    }

    async fn finish(
        &self,
        job: &Job,
        lease: &Precondition,
        patch: JobPatch,
        outcome: ExecutionOutcome,
    ) -> ExecutionOutcome {
        let result = self.store.compare_and_swap(job.id, lease, &patch).await;
        self.resolve(job, result.map(|updated| updated.is_some()), outcome)
    }

    async fn finish_dead(&self, job: &Job, lease: &Precondition, message: String) -> ExecutionOutcome {
        let result = self
            .store
            .mark_dead(job.id, lease, &JobPatch::dead(message, now()))
            .await;
        self.resolve(job, result.map(|updated| updated.is_some()), ExecutionOutcome::Dead)
    }

    fn resolve(
        &self,
        job: &Job,
        written: courier_core::Result<bool>,
        outcome: ExecutionOutcome,
    ) -> ExecutionOutcome {
        match written {
            Ok(true) => outcome,
            Ok(false) => {
                warn!(
                    subsystem = "jobs",
                    component = "executor",
                    job_id = %job.id,
                    job_kind = %job.kind,
                    locked_by = job.locked_by.as_deref().unwrap_or(""),
                    "Lease lost before the result was recorded, discarding outcome"
                );
                ExecutionOutcome::LeaseLost
            }
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "executor",
                    job_id = %job.id,
                    job_kind = %job.kind,
                    error = %e,
                    "Failed to record job outcome"
                );
                ExecutionOutcome::StoreError(e.to_string())
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
