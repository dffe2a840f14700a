//! # courier-core
//!
//! Core types, traits, and abstractions for the courier job queue.
//!
//! This crate provides the job record model, its status machine, and the
//! [`JobStore`] port that every persistent backend implements. The worker
//! crate (`courier-jobs`) and the storage crate (`courier-db`) depend on it.
//!
//! ## Logging conventions
//!
//! `tracing` events in the workspace carry `subsystem` (`"jobs"` or
//! `"database"`) and `component`, plus whichever of `op`, `worker_id`,
//! `job_id`, `job_kind`, `attempts`, `duration_ms` and `error` apply.
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Store unreachable, a status write failed, a job exhausted its attempts |
//! | WARN  | Lease lost, stuck job dead-lettered, handler missing, retry scheduled |
//! | INFO  | Worker lifecycle, reclaim sweeps, completions |
//! | DEBUG | Claims, enqueues, race losses |

pub mod defaults;
pub mod error;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{extract_timestamp, is_v7, new_v7};

/// Current instant, truncated to microsecond precision.
///
/// PostgreSQL `timestamptz` stores microseconds, so every timestamp written by
/// the core goes through this function. A value read back from the store then
/// compares equal to the one that was written, which the `updated_at`
/// precondition of a conditional update relies on.
pub fn now() -> chrono::DateTime<chrono::Utc> {
    use chrono::SubsecRound;
    chrono::Utc::now().trunc_subsecs(6)
}
