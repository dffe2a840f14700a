//! Core traits for courier abstractions.
//!
//! The job queue never talks to a database directly. Everything goes through
//! [`JobStore`], whose only concurrency primitive is a per-record conditional
//! update. Any store with per-record atomic writes (a relational row guarded
//! by `WHERE status = ?`, a key-value store with CAS) can implement it.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// JOB STORE
// =============================================================================

/// Persistent collection of job records and their dead letters.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. A duplicate id is `Error::Conflict`.
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Point lookup.
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;

    /// Filter query ordered by `next_run_at` ascending, limited.
    async fn find(&self, query: &JobQuery) -> Result<Vec<Job>>;

    /// Apply `patch` only if `precondition` still holds for record `id`.
    ///
    /// Returns the updated record, or `None` when the precondition failed
    /// (another worker got there first; not an error). A missing record is
    /// also `None`. A patch that leaves the state machine is
    /// `Error::InvalidTransition`.
    async fn compare_and_swap(
        &self,
        id: Uuid,
        precondition: &Precondition,
        patch: &JobPatch,
    ) -> Result<Option<Job>>;

    /// Insert a dead-letter record. Idempotent per job id.
    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<()>;

    /// Conditionally move a job to `DEAD` and mirror it into the dead letters.
    ///
    /// The default implementation chains [`JobStore::compare_and_swap`] and
    /// [`JobStore::insert_dead_letter`]; stores with transactions should
    /// override it to make both writes atomic.
    async fn mark_dead(
        &self,
        id: Uuid,
        precondition: &Precondition,
        patch: &JobPatch,
    ) -> Result<Option<Job>> {
        let Some(job) = self.compare_and_swap(id, precondition, patch).await? else {
            return Ok(None);
        };
        self.insert_dead_letter(&DeadLetter::from_job(job.clone()))
            .await?;
        Ok(Some(job))
    }

    /// Get the dead-letter record for an original job id.
    async fn get_dead_letter(&self, job_id: Uuid) -> Result<Option<DeadLetter>>;

    /// List dead letters, newest first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Counts per status plus the dead-letter count.
    async fn queue_stats(&self) -> Result<QueueStats>;
}
