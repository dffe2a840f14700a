//! PostgreSQL job store.
//!
//! The conditional update is a single `UPDATE … WHERE id = $ AND status = $`
//! statement: PostgreSQL row locking makes the check and the write atomic, so
//! of two workers racing for the same row exactly one sees a returned row.

use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, Pool, Postgres, Row};
use tracing::{debug, trace};
use uuid::Uuid;

use courier_core::{
    DeadLetter, Error, Job, JobOrder, JobPatch, JobQuery, JobStatus, JobStore, Precondition,
    QueueStats, Result,
};

macro_rules! job_columns {
    () => {
        "id, kind, payload, status, attempts, max_attempts, next_run_at, locked_by, error, \
         correlation_id, created_at, updated_at, started_at, finished_at"
    };
}

const INSERT_JOB: &str = concat!(
    "INSERT INTO job_queue (",
    job_columns!(),
    ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
);

const SELECT_JOB_BY_ID: &str = concat!("SELECT ", job_columns!(), " FROM job_queue WHERE id = $1");

const FIND_JOBS: &str = concat!(
    "SELECT ",
    job_columns!(),
    " FROM job_queue
     WHERE (cardinality($1::text[]) = 0 OR status = ANY($1))
       AND ($2::timestamptz IS NULL OR next_run_at <= $2)
       AND ($3::timestamptz IS NULL OR updated_at < $3)
       AND ($4::text IS NULL OR kind = $4)
     ORDER BY CASE WHEN $6 THEN updated_at END ASC, next_run_at ASC, created_at ASC
     LIMIT $5"
);

const COMPARE_AND_SWAP: &str = concat!(
    "UPDATE job_queue
     SET status = $1,
         locked_by = $2,
         attempts = attempts + $3,
         next_run_at = COALESCE($4, next_run_at),
         started_at = COALESCE($5, started_at),
         finished_at = COALESCE($6, finished_at),
         error = COALESCE($7, error),
         updated_at = $8
     WHERE id = $9
       AND status = $10
       AND ($11::text IS NULL OR locked_by = $11)
       AND ($12::timestamptz IS NULL OR updated_at = $12)
     RETURNING ",
    job_columns!()
);

const INSERT_DEAD_LETTER: &str =
    "INSERT INTO job_dead_letter (job_id, job, final_error, dead_lettered_at)
     VALUES ($1, $2, $3, $4)
     ON CONFLICT (job_id) DO NOTHING";

/// PostgreSQL implementation of [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

/// `LIMIT` bind value; `usize` beyond `i64` means no limit.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl PgJobStore {
    /// Create a new PgJobStore with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: PgRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        Ok(Job {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            status: JobStatus::from_str(&status)?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            locked_by: row.try_get("locked_by")?,
            error: row.try_get("error")?,
            correlation_id: row.try_get("correlation_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    /// Parse a dead-letter row; the full record lives in the `job` JSONB column.
    fn parse_dead_letter_row(row: PgRow) -> Result<DeadLetter> {
        let job: JsonValue = row.try_get("job")?;
        Ok(DeadLetter {
            job_id: row.try_get("job_id")?,
            job: serde_json::from_value(job)?,
            final_error: row.try_get("final_error")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
        })
    }

    async fn compare_and_swap_on<'c, E>(
        executor: E,
        id: Uuid,
        precondition: &Precondition,
        patch: &JobPatch,
    ) -> Result<Option<Job>>
    where
        E: PgExecutor<'c>,
    {
        patch.check_transition(precondition.status)?;

        let row = sqlx::query(COMPARE_AND_SWAP)
            .bind(patch.status.as_str())
            .bind(&patch.locked_by)
            .bind(i32::from(patch.increment_attempts))
            .bind(patch.next_run_at)
            .bind(patch.started_at)
            .bind(patch.finished_at)
            .bind(&patch.error)
            .bind(patch.updated_at)
            .bind(id)
            .bind(precondition.status.as_str())
            .bind(&precondition.locked_by)
            .bind(precondition.updated_at)
            .fetch_optional(executor)
            .await?;

        match row {
            Some(row) => Self::parse_job_row(row).map(Some),
            None => {
                trace!(
                    subsystem = "database",
                    op = "compare_and_swap",
                    job_id = %id,
                    expected = %precondition.status,
                    "Precondition failed"
                );
                Ok(None)
            }
        }
    }

    async fn insert_dead_letter_on<'c, E>(executor: E, entry: &DeadLetter) -> Result<()>
    where
        E: PgExecutor<'c>,
    {
        sqlx::query(INSERT_DEAD_LETTER)
            .bind(entry.job_id)
            .bind(serde_json::to_value(&entry.job)?)
            .bind(&entry.final_error)
            .bind(entry.dead_lettered_at)
            .execute(executor)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(INSERT_JOB)
            .bind(job.id)
            .bind(&job.kind)
            .bind(&job.payload)
            .bind(job.status.as_str())
            .bind(job.attempts)
            .bind(job.max_attempts)
            .bind(job.next_run_at)
            .bind(&job.locked_by)
            .bind(&job.error)
            .bind(&job.correlation_id)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.started_at)
            .bind(job.finished_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(Error::Conflict(
                format!("job already exists: {}", job.id),
            )),
            Err(e) => Err(Error::Database(e)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(SELECT_JOB_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn find(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let statuses: Vec<&str> = query.statuses.iter().map(JobStatus::as_str).collect();

        let rows = sqlx::query(FIND_JOBS)
            .bind(&statuses)
            .bind(query.next_run_at_lte)
            .bind(query.updated_at_lt)
            .bind(&query.kind)
            .bind(sql_limit(query.limit))
            .bind(query.order == JobOrder::UpdatedAt)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn compare_and_swap(
        &self,
        id: Uuid,
        precondition: &Precondition,
        patch: &JobPatch,
    ) -> Result<Option<Job>> {
        Self::compare_and_swap_on(&self.pool, id, precondition, patch).await
    }

    async fn insert_dead_letter(&self, entry: &DeadLetter) -> Result<()> {
        Self::insert_dead_letter_on(&self.pool, entry).await
    }

    async fn mark_dead(
        &self,
        id: Uuid,
        precondition: &Precondition,
        patch: &JobPatch,
    ) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let Some(job) = Self::compare_and_swap_on(&mut *tx, id, precondition, patch).await? else {
            tx.rollback().await?;
            return Ok(None);
        };
        Self::insert_dead_letter_on(&mut *tx, &DeadLetter::from_job(job.clone())).await?;

        tx.commit().await?;
        debug!(
            subsystem = "database",
            op = "mark_dead",
            job_id = %id,
            attempts = job.attempts,
            "Job moved to dead letters"
        );
        Ok(Some(job))
    }

    async fn get_dead_letter(&self, job_id: Uuid) -> Result<Option<DeadLetter>> {
        let row = sqlx::query(
            "SELECT job_id, job, final_error, dead_lettered_at
             FROM job_dead_letter WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::parse_dead_letter_row).transpose()
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT job_id, job, final_error, dead_lettered_at
             FROM job_dead_letter
             ORDER BY dead_lettered_at DESC
             LIMIT $1",
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::parse_dead_letter_row).collect()
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            stats.add(JobStatus::from_str(&status)?, count);
        }

        stats.dead_letters = sqlx::query_scalar("SELECT COUNT(*) FROM job_dead_letter")
            .fetch_one(&self.pool)
            .await?;

        Ok(stats)
    }
}
