//! Centralized default constants for the courier job queue.
//!
//! **This module is the single source of truth** for all shared default values.
//! The worker configuration, the enqueuer, and the storage backends reference
//! these constants instead of defining their own magic numbers.

// =============================================================================
// ENQUEUE
// =============================================================================

/// Default attempt ceiling when a caller does not supply one.
pub const JOB_MAX_ATTEMPTS: i32 = 5;

/// Maximum stored length (in characters) of a job's last error message.
pub const JOB_ERROR_MAX_LEN: usize = 1000;

// =============================================================================
// CLAIMING
// =============================================================================

/// Lease duration in seconds. A `RUNNING` job whose `updated_at` is older
/// than this is presumed abandoned and gets reclaimed.
pub const JOB_LEASE_SECS: u64 = 60;

/// Default number of jobs claimed per poll cycle.
pub const JOB_BATCH_SIZE: usize = 10;

/// Page size of the stuck-lease sweep. The sweep pages until the expired
/// set is drained, so this bounds one query, not one cycle.
pub const RECLAIM_PAGE_SIZE: usize = 100;

/// Default sleep between poll cycles in milliseconds.
pub const JOB_POLL_INTERVAL_MS: u64 = 5_000;

// =============================================================================
// BACKOFF
// =============================================================================

/// Base retry delay in seconds (`delay = base * 2^attempts`).
pub const JOB_BACKOFF_BASE_SECS: u64 = 30;

/// Upper bound for a single retry delay in seconds.
pub const JOB_BACKOFF_CAP_SECS: u64 = 3_600;

// =============================================================================
// WORKER
// =============================================================================

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_cap_exceeds_base() {
        const {
            assert!(JOB_BACKOFF_CAP_SECS > JOB_BACKOFF_BASE_SECS);
        }
    }

    #[test]
    fn lease_longer_than_poll_interval() {
        // A lease shorter than one poll cycle would reclaim healthy jobs.
        const {
            assert!(JOB_LEASE_SECS * 1_000 > JOB_POLL_INTERVAL_MS);
        }
    }

    #[test]
    fn max_attempts_positive() {
        const {
            assert!(JOB_MAX_ATTEMPTS > 0);
            assert!(JOB_BATCH_SIZE > 0);
            assert!(RECLAIM_PAGE_SIZE > 0);
        }
    }
}
