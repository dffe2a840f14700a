//! Claimer: lease eligible jobs to a worker and recover expired leases.
//!
//! Exclusion comes entirely from the store's conditional update. Two workers
//! may read the same candidate; only one update matches the precondition and
//! the loser skips the record.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use courier_core::{defaults, now, Job, JobPatch, JobQuery, JobStore, Precondition, Result};

/// Error recorded on a job whose lease expired after its final attempt.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired after final attempt";

/// Claims jobs for one worker.
#[derive(Clone)]
pub struct Claimer {
    store: Arc<dyn JobStore>,
    lease: Duration,
}

impl Claimer {
    pub fn new(store: Arc<dyn JobStore>, lease: Duration) -> Self {
        Self { store, lease }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Reclaim stuck jobs, then claim up to `batch_size` eligible ones.
    ///
    /// Returns the claimed records in their post-update (`RUNNING`) state.
    /// Only the two store queries propagate errors; per-record failures are
    /// logged and skipped.
    pub async fn claim(&self, worker_id: &str, batch_size: usize) -> Result<Vec<Job>> {
        self.reclaim_stuck().await?;

        let candidates = self
            .store
            .find(&JobQuery::eligible(now(), batch_size))
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let patch = JobPatch::claim(worker_id, now());
            match self
                .store
                .compare_and_swap(candidate.id, &Precondition::unchanged(&candidate), &patch)
                .await
            {
                Ok(Some(job)) => {
                    debug!(
                        subsystem = "jobs",
                        component = "claimer",
                        worker_id,
                        job_id = %job.id,
                        job_kind = %job.kind,
                        attempts = job.attempts,
                        "Job claimed"
                    );
                    claimed.push(job);
                }
                Ok(None) => {
                    debug!(
                        subsystem = "jobs",
                        component = "claimer",
                        worker_id,
                        job_id = %candidate.id,
                        "Claim lost to another worker"
                    );
                }
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "claimer",
                        worker_id,
                        job_id = %candidate.id,
                        error = %e,
                        "Failed to claim job"
                    );
                }
            }
        }

        Ok(claimed)
    }

    /// Return every `RUNNING` job with an expired lease to `QUEUED`.
    ///
    /// `attempts` is left alone: the next claim counts the new attempt. A job
    /// that already used its last attempt goes to `DEAD` instead, so a handler
    /// that keeps crashing its worker cannot run forever.
    ///
    /// Pages through the expired set oldest lease first and stops once a page
    /// comes back short or moves nothing. Returns how many records this call
    /// moved.
    pub async fn reclaim_stuck(&self) -> Result<usize> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX);
        let cutoff = now()
            .checked_sub_signed(lease)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let page_size = defaults::RECLAIM_PAGE_SIZE;

        let mut reclaimed = 0;
        loop {
            let stuck = self.store.find(&JobQuery::stuck(cutoff, page_size)).await?;
            let fetched = stuck.len();
            let mut moved = 0;
            for job in stuck {
                if self.reclaim_one(&job).await {
                    moved += 1;
                }
            }
            reclaimed += moved;
            if fetched < page_size || moved == 0 {
                break;
            }
        }

        if reclaimed > 0 {
            info!(
                subsystem = "jobs",
                component = "claimer",
                reclaimed,
                "Reclaimed stuck jobs"
            );
        }
        Ok(reclaimed)
    }

    /// Move one stuck job; `true` if this call changed it.
    async fn reclaim_one(&self, job: &Job) -> bool {
        let precondition = Precondition::unchanged(job);
        let result = if job.has_attempts_left() {
            self.store
                .compare_and_swap(job.id, &precondition, &JobPatch::reclaim(now()))
                .await
        } else {
            self.store
                .mark_dead(job.id, &precondition, &JobPatch::dead(LEASE_EXPIRED_ERROR, now()))
                .await
        };

        match result {
            Ok(Some(updated)) if updated.status.is_terminal() => {
                warn!(
                    subsystem = "jobs",
                    component = "claimer",
                    job_id = %job.id,
                    job_kind = %job.kind,
                    attempts = job.attempts,
                    locked_by = job.locked_by.as_deref().unwrap_or(""),
                    "Stuck job exhausted its attempts, moved to dead letters"
                );
                true
            }
            Ok(Some(_)) => {
                debug!(
                    subsystem = "jobs",
                    component = "claimer",
                    job_id = %job.id,
                    locked_by = job.locked_by.as_deref().unwrap_or(""),
                    "Stuck job requeued"
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "claimer",
                    job_id = %job.id,
                    error = %e,
                    "Failed to reclaim stuck job"
                );
                false
            }
        }
    }
}
