//! In-memory job store.
//!
//! Backs tests and single-process deployments. Every conditional update runs
//! under one write lock, which gives the same per-record atomicity as the
//! PostgreSQL store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use courier_core::{
    DeadLetter, Error, Job, JobPatch, JobQuery, JobStore, Precondition, QueueStats, Result,
};

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    dead_letters: HashMap<Uuid, DeadLetter>,
}

/// [`JobStore`] kept in process memory.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record unconditionally.
    ///
    /// Test hook for simulating writes made by another process.
    pub async fn put(&self, job: Job) {
        self.state.write().await.jobs.insert(job.id, job);
    }

    /// Make every subsequent call fail with `Error::Internal` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored job records.
    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Internal("job store unavailable".to_string()));
        }
        Ok(())
    }

    fn swap_locked(
        state: &mut State,
        id: Uuid,
        precondition: &Precondition,
        patch: &JobPatch,
    ) -> Result<Option<Job>> {
        patch.check_transition(precondition.status)?;

        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !precondition.matches(job) {
            return Ok(None);
        }
        patch.apply(job);
        Ok(Some(job.clone()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&job.id) {
            return Err(Error::Conflict(format!("job already exists: {}", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        self.check_available()?;
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn find(&self, query: &JobQuery) -> Result<Vec<Job>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| query.compare(a, b));
        jobs.truncate(query.limit);
        Ok(jobs)
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        precondition: &Precondition,
        patch: &JobPatch,
    ) -> Result<Option<Job>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        Self::swap_locked(&mut state, id, precondition, patch)
    }

    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<()> {
        self.check_available()?;
        self.state
            .write()
            .await
            .dead_letters
            .entry(entry.job_id)
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        precondition: &Precondition,
        patch: &JobPatch,
    ) -> Result<Option<Job>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let Some(job) = Self::swap_locked(&mut state, id, precondition, patch)? else {
            return Ok(None);
        };
        state
            .dead_letters
            .entry(id)
            .or_insert_with(|| DeadLetter::from_job(job.clone()));
        Ok(Some(job))
    }

    async fn get_dead_letter(&self, job_id: Uuid) -> Result<Option<DeadLetter>> {
        self.check_available()?;
        Ok(self.state.read().await.dead_letters.get(&job_id).cloned())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut entries: Vec<DeadLetter> = state.dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            stats.record(job.status);
        }
        stats.dead_letters = state.dead_letters.len() as i64;
        Ok(stats)
    }
}
