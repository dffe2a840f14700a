//! Core data models for courier.
//!
//! These types are shared across all courier crates: the job record, its
//! status machine, the patch/precondition pair that drives a conditional
//! update, and the dead-letter record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

// =============================================================================
// JOB STATUS
// =============================================================================

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for its first claim (or reset after a lease expired).
    Queued,
    /// Leased by a worker.
    Running,
    /// Failed at least once, waiting for `next_run_at`.
    Retry,
    /// Handler succeeded.
    Done,
    /// Exhausted `max_attempts`; mirrored into the dead-letter store.
    Dead,
    /// No handler registered for the kind. Never retried.
    Failed,
}

impl JobStatus {
    /// Statuses a worker may claim.
    pub const CLAIMABLE: [JobStatus; 2] = [JobStatus::Queued, JobStatus::Retry];

    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Retry,
        JobStatus::Done,
        JobStatus::Dead,
        JobStatus::Failed,
    ];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Retry => "RETRY",
            Self::Done => "DONE",
            Self::Dead => "DEAD",
            Self::Failed => "FAILED",
        }
    }

    /// Whether the job will never be picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Dead | Self::Failed)
    }

    /// Whether a worker may claim a job in this status.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Queued | Self::Retry)
    }

    /// Whether `self -> next` is an edge of the job state machine.
    ///
    /// `RUNNING -> QUEUED` is only used by lease-expiry reclamation.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Retry, Running)
                | (Running, Done)
                | (Running, Retry)
                | (Running, Dead)
                | (Running, Failed)
                | (Running, Queued)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "RETRY" => Ok(Self::Retry),
            "DONE" => Ok(Self::Done),
            "DEAD" => Ok(Self::Dead),
            "FAILED" => Ok(Self::Failed),
            _ => Err(Error::InvalidInput(format!("Invalid job status: {}", s))),
        }
    }
}

// =============================================================================
// JOB RECORD
// =============================================================================

/// A persisted unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: String,
    pub payload: JsonValue,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_run_at: DateTime<Utc>,
    /// Lease holder; present only while `RUNNING`.
    pub locked_by: Option<String>,
    pub error: Option<String>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh `QUEUED` record from enqueue options.
    ///
    /// `max_attempts` below 1 is raised to 1 so every job runs at least once.
    /// A delay past the representable range saturates at the maximum instant.
    pub fn new(kind: impl Into<String>, payload: JsonValue, options: &EnqueueOptions) -> Self {
        let now = crate::now();
        Self {
            id: crate::new_v7(),
            kind: kind.into(),
            payload,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(defaults::JOB_MAX_ATTEMPTS)
                .max(1),
            next_run_at: options.run_at(now).unwrap_or(DateTime::<Utc>::MAX_UTC),
            locked_by: None,
            error: None,
            correlation_id: options.correlation_id.clone(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether another failure may still be retried.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether the job can be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.next_run_at <= now
    }

    /// Whether a `RUNNING` job's lease has expired at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        self.status == JobStatus::Running && self.updated_at < now - lease
    }
}

/// Options accepted by `enqueue`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Attempt ceiling; `defaults::JOB_MAX_ATTEMPTS` when omitted.
    pub max_attempts: Option<i32>,
    /// Delay before the job first becomes eligible.
    pub delay_seconds: Option<u64>,
    /// Caller-supplied tracing tag.
    pub correlation_id: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn delay_seconds(mut self, delay_seconds: u64) -> Self {
        self.delay_seconds = Some(delay_seconds);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// First eligible instant for a job enqueued at `now`.
    ///
    /// `None` when the delay does not fit a timestamp.
    pub fn run_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.delay_seconds.unwrap_or(0)).ok()?;
        now.checked_add_signed(chrono::Duration::try_seconds(secs)?)
    }
}

// =============================================================================
// CONDITIONAL UPDATE
// =============================================================================

/// Field patch applied by [`crate::JobStore::compare_and_swap`].
///
/// `locked_by` is always written (so `None` clears the lease). The other
/// optional fields leave the stored value untouched when `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPatch {
    pub status: JobStatus,
    pub locked_by: Option<String>,
    pub increment_attempts: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobPatch {
    fn to_status(status: JobStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            locked_by: None,
            increment_attempts: false,
            next_run_at: None,
            started_at: None,
            finished_at: None,
            error: None,
            updated_at: now,
        }
    }

    /// `QUEUED|RETRY -> RUNNING`: take the lease and count the attempt.
    pub fn claim(worker_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            locked_by: Some(worker_id.into()),
            increment_attempts: true,
            started_at: Some(now),
            ..Self::to_status(JobStatus::Running, now)
        }
    }

    /// `RUNNING -> QUEUED`: drop an expired lease without touching `attempts`.
    pub fn reclaim(now: DateTime<Utc>) -> Self {
        Self::to_status(JobStatus::Queued, now)
    }

    /// `RUNNING -> DONE`.
    pub fn done(now: DateTime<Utc>) -> Self {
        Self {
            finished_at: Some(now),
            ..Self::to_status(JobStatus::Done, now)
        }
    }

    /// `RUNNING -> RETRY`, eligible again at `next_run_at`.
    pub fn retry(error: impl Into<String>, next_run_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            next_run_at: Some(next_run_at),
            error: Some(error.into()),
            ..Self::to_status(JobStatus::Retry, now)
        }
    }

    /// `RUNNING -> DEAD`.
    pub fn dead(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            finished_at: Some(now),
            error: Some(error.into()),
            ..Self::to_status(JobStatus::Dead, now)
        }
    }

    /// `RUNNING -> FAILED` (unknown kind).
    pub fn failed(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            finished_at: Some(now),
            error: Some(error.into()),
            ..Self::to_status(JobStatus::Failed, now)
        }
    }

    /// Reject patches that leave the state machine.
    pub fn check_transition(&self, from: JobStatus) -> Result<()> {
        if from.can_transition_to(self.status) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from,
                to: self.status,
            })
        }
    }

    /// Apply the patch to an in-memory record.
    pub fn apply(&self, job: &mut Job) {
        job.status = self.status;
        job.locked_by = self.locked_by.clone();
        if self.increment_attempts {
            job.attempts += 1;
        }
        if let Some(next_run_at) = self.next_run_at {
            job.next_run_at = next_run_at;
        }
        if let Some(started_at) = self.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(finished_at) = self.finished_at {
            job.finished_at = Some(finished_at);
        }
        if let Some(ref error) = self.error {
            job.error = Some(error.clone());
        }
        job.updated_at = self.updated_at;
    }
}

/// Guard of a conditional update.
///
/// `status` must always match. `locked_by` and `updated_at`, when set, must
/// also match the stored values; they fence off writes computed from a stale
/// snapshot (the record went through another claim between read and write).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub status: JobStatus,
    pub locked_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Precondition {
    /// Only the status has to match.
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            locked_by: None,
            updated_at: None,
        }
    }

    /// The record must be unchanged since `job` was read.
    pub fn unchanged(job: &Job) -> Self {
        Self {
            status: job.status,
            locked_by: None,
            updated_at: Some(job.updated_at),
        }
    }

    /// The lease taken by `job`'s claim must still be held by its worker.
    pub fn lease(job: &Job) -> Self {
        Self {
            status: JobStatus::Running,
            locked_by: job.locked_by.clone(),
            updated_at: Some(job.updated_at),
        }
    }

    /// Evaluate the guard against the current stored record.
    pub fn matches(&self, job: &Job) -> bool {
        job.status == self.status
            && self
                .locked_by
                .as_ref()
                .map_or(true, |w| job.locked_by.as_ref() == Some(w))
            && self.updated_at.map_or(true, |t| job.updated_at == t)
    }
}

/// Truncate an error message to at most `max_len` characters.
///
/// Cuts on a char boundary and marks the cut with `...`.
pub fn truncate_error(message: &str, max_len: usize) -> String {
    if message.chars().count() <= max_len {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(max_len.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}

// =============================================================================
// QUERIES
// =============================================================================

/// Result order of a [`JobQuery`]. Ties break on `created_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobOrder {
    /// Earliest `next_run_at` first.
    #[default]
    NextRunAt,
    /// Least recently touched first.
    UpdatedAt,
}

/// Range/filter query over job records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    /// Empty means any status.
    pub statuses: Vec<JobStatus>,
    pub next_run_at_lte: Option<DateTime<Utc>>,
    pub updated_at_lt: Option<DateTime<Utc>>,
    pub kind: Option<String>,
    pub order: JobOrder,
    pub limit: usize,
}

impl JobQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            statuses: Vec::new(),
            next_run_at_lte: None,
            updated_at_lt: None,
            kind: None,
            order: JobOrder::NextRunAt,
            limit,
        }
    }

    /// `QUEUED`/`RETRY` jobs whose `next_run_at` has passed.
    pub fn eligible(now: DateTime<Utc>, limit: usize) -> Self {
        Self {
            statuses: JobStatus::CLAIMABLE.to_vec(),
            next_run_at_lte: Some(now),
            ..Self::new(limit)
        }
    }

    /// `RUNNING` jobs not touched since `cutoff`, oldest lease first.
    pub fn stuck(cutoff: DateTime<Utc>, limit: usize) -> Self {
        Self {
            statuses: vec![JobStatus::Running],
            updated_at_lt: Some(cutoff),
            order: JobOrder::UpdatedAt,
            ..Self::new(limit)
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Sort key comparison for this query's order.
    pub fn compare(&self, a: &Job, b: &Job) -> std::cmp::Ordering {
        let primary = match self.order {
            JobOrder::NextRunAt => a.next_run_at.cmp(&b.next_run_at),
            JobOrder::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        };
        primary.then(a.created_at.cmp(&b.created_at))
    }

    /// Evaluate the filter (ordering and limit excluded).
    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.next_run_at_lte.map_or(true, |t| job.next_run_at <= t)
            && self.updated_at_lt.map_or(true, |t| job.updated_at < t)
            && self.kind.as_ref().map_or(true, |k| &job.kind == k)
    }
}

// =============================================================================
// QUARANTINE
// =============================================================================

/// Quarantine copy of a job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Original job id (key).
    pub job_id: Uuid,
    /// Full final record.
    pub job: Job,
    pub final_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_job(job: Job) -> Self {
        Self {
            job_id: job.id,
            final_error: job.error.clone().unwrap_or_default(),
            dead_lettered_at: job.finished_at.unwrap_or(job.updated_at),
            job,
        }
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub retry: i64,
    pub done: i64,
    pub dead: i64,
    pub failed: i64,
    pub dead_letters: i64,
}

impl QueueStats {
    /// Count one job in `status`.
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    /// Count `n` jobs in `status`.
    pub fn add(&mut self, status: JobStatus, n: i64) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Running => self.running += n,
            JobStatus::Retry => self.retry += n,
            JobStatus::Done => self.done += n,
            JobStatus::Dead => self.dead += n,
            JobStatus::Failed => self.failed += n,
        }
    }

    /// Jobs that are not yet in a terminal status.
    pub fn in_flight(&self) -> i64 {
        self.queued + self.running + self.retry
    }

    pub fn total(&self) -> i64 {
        self.in_flight() + self.done + self.dead + self.failed
    }
}
