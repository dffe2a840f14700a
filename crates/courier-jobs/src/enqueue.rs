//! Enqueue surface: create jobs and replay quarantined ones.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, info};
use uuid::Uuid;

use courier_core::{defaults, now, EnqueueOptions, Error, Job, JobStore, Result};

/// Writes new `QUEUED` records. Cheap to clone; never waits on handlers.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn JobStore>,
    default_max_attempts: i32,
}

impl Enqueuer {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            default_max_attempts: defaults::JOB_MAX_ATTEMPTS,
        }
    }

    /// Attempt budget for jobs enqueued without an explicit `max_attempts`.
    pub fn with_default_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueue a job and return its id.
    ///
    /// The payload is stored as-is; validating it is the handler's job.
    /// A delay too large to schedule is `Error::InvalidInput`.
    pub async fn enqueue(
        &self,
        kind: impl Into<String>,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        if options.run_at(now()).is_none() {
            return Err(Error::InvalidInput(format!(
                "delay_seconds out of range: {}",
                options.delay_seconds.unwrap_or(0)
            )));
        }
        let options = EnqueueOptions {
            max_attempts: Some(options.max_attempts.unwrap_or(self.default_max_attempts)),
            ..options
        };
        let job = Job::new(kind, payload, &options);
        self.store.insert(&job).await?;

        debug!(
            subsystem = "jobs",
            component = "enqueuer",
            job_id = %job.id,
            job_kind = %job.kind,
            correlation_id = job.correlation_id.as_deref().unwrap_or(""),
            max_attempts = job.max_attempts,
            next_run_at = %job.next_run_at,
            "Job enqueued"
        );
        Ok(job.id)
    }

    /// Re-enqueue a dead-lettered job as a fresh record.
    ///
    /// The new job keeps kind, payload, attempt budget and correlation id of
    /// the original; the dead letter itself is left in place for the audit
    /// trail.
    pub async fn replay_dead_letter(&self, job_id: Uuid) -> Result<Uuid> {
        let entry = self
            .store
            .get_dead_letter(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))?;

        let mut options = EnqueueOptions::new().max_attempts(entry.job.max_attempts);
        options.correlation_id = entry.job.correlation_id.clone();

        let new_id = self
            .enqueue(entry.job.kind.clone(), entry.job.payload.clone(), options)
            .await?;

        info!(
            subsystem = "jobs",
            component = "enqueuer",
            op = "replay_dead_letter",
            original_job_id = %job_id,
            job_id = %new_id,
            job_kind = %entry.job.kind,
            "Dead letter replayed"
        );
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{JobPatch, JobStatus, Precondition};
    use courier_db::InMemoryJobStore;
    use serde_json::json;

    fn enqueuer() -> (Arc<InMemoryJobStore>, Enqueuer) {
        let store = Arc::new(InMemoryJobStore::new());
        (store.clone(), Enqueuer::new(store))
    }

    #[tokio::test]
    async fn test_enqueue_creates_queued_job() {
        let (store, enqueuer) = enqueuer();
        let before = now();
        let id = enqueuer
            .enqueue(
                "send_welcome",
                json!({"user": 1}),
                EnqueueOptions::new().correlation_id("req-1"),
            )
            .await
            .unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.kind, "send_welcome");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, defaults::JOB_MAX_ATTEMPTS);
        assert_eq!(job.correlation_id.as_deref(), Some("req-1"));
        assert!(job.next_run_at >= before);
        assert!(job.next_run_at <= now());
    }

    #[tokio::test]
    async fn test_enqueue_with_delay() {
        let (store, enqueuer) = enqueuer();
        let id = enqueuer
            .enqueue("report", json!(null), EnqueueOptions::new().delay_seconds(120))
            .await
            .unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.next_run_at - job.created_at, chrono::Duration::seconds(120));
    }

    #[tokio::test]
    async fn test_enqueue_default_max_attempts() {
        let (store, enqueuer) = enqueuer();
        let enqueuer = enqueuer.with_default_max_attempts(2);

        let implicit = enqueuer
            .enqueue("a", json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        let explicit = enqueuer
            .enqueue("a", json!({}), EnqueueOptions::new().max_attempts(9))
            .await
            .unwrap();
        let zero = enqueuer
            .enqueue("a", json!({}), EnqueueOptions::new().max_attempts(0))
            .await
            .unwrap();

        assert_eq!(store.get(implicit).await.unwrap().unwrap().max_attempts, 2);
        assert_eq!(store.get(explicit).await.unwrap().unwrap().max_attempts, 9);
        assert_eq!(store.get(zero).await.unwrap().unwrap().max_attempts, 1);
    }

    #[tokio::test]
    async fn test_enqueue_propagates_store_error() {
        let (store, enqueuer) = enqueuer();
        store.set_unavailable(true);
        let result = enqueuer.enqueue("a", json!({}), EnqueueOptions::default()).await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_replay_dead_letter() {
        let (store, enqueuer) = enqueuer();
        let id = enqueuer
            .enqueue(
                "send_welcome",
                json!({"user": 7}),
                EnqueueOptions::new().max_attempts(1).correlation_id("c-7"),
            )
            .await
            .unwrap();
        let running = store
            .compare_and_swap(
                id,
                &Precondition::status(JobStatus::Queued),
                &JobPatch::claim("w", now()),
            )
            .await
            .unwrap()
            .unwrap();
        store
            .mark_dead(id, &Precondition::lease(&running), &JobPatch::dead("boom", now()))
            .await
            .unwrap()
            .unwrap();

        let replayed = enqueuer.replay_dead_letter(id).await.unwrap();
        assert_ne!(replayed, id);

        let job = store.get(replayed).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.kind, "send_welcome");
        assert_eq!(job.payload, json!({"user": 7}));
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.correlation_id.as_deref(), Some("c-7"));
        assert!(store.get_dead_letter(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_out_of_range_delay() {
        let (store, enqueuer) = enqueuer();
        for delay in [u64::MAX, 10_000_000_000_000] {
            let err = enqueuer
                .enqueue("report", json!(null), EnqueueOptions::new().delay_seconds(delay))
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)));
        }
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_replay_missing_dead_letter() {
        let (_store, enqueuer) = enqueuer();
        let missing = Uuid::new_v4();
        let err = enqueuer.replay_dead_letter(missing).await.unwrap_err();
        assert!(matches!(err, Error::JobNotFound(id) if id == missing));
    }
}
