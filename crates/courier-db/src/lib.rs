//! # courier-db
//!
//! Storage layer for courier.
//!
//! This crate provides:
//! - Connection pool management
//! - [`PgJobStore`]: the PostgreSQL [`JobStore`] (`job_queue` and `job_dead_letter` tables)
//! - [`InMemoryJobStore`]: a process-local [`JobStore`] for tests and embedded use
//!
//! ## Example
//!
//! ```rust,ignore
//! use courier_db::{Database, EnqueueOptions, Job, JobStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/courier").await?;
//!     db.migrate().await?;
//!
//!     let job = Job::new("send_email", serde_json::json!({"to": "a@b.c"}), &EnqueueOptions::default());
//!     db.jobs.insert(&job).await?;
//!     Ok(())
//! }
//! ```
pub mod jobs;
pub mod memory;
pub mod pool;

// Test fixtures for integration tests
// Note: Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

use std::sync::Arc;

// Re-export core types
pub use courier_core::*;

pub use jobs::PgJobStore;
pub use memory::InMemoryJobStore;
pub use pool::{create_pool, log_pool_metrics, PoolConfig};

/// Database context: the pool plus the job store built on it.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job store backed by `job_queue`.
    pub jobs: Arc<PgJobStore>,
}

impl Database {
    /// Create a new Database instance from an existing pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: Arc::new(PgJobStore::new(pool.clone())),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Connect with an explicit pool configuration.
    pub async fn connect_with_config(config: &PoolConfig) -> Result<Self> {
        let pool = config.connect().await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// The job store as a trait object, for wiring into workers and enqueuers.
    pub fn job_store(&self) -> Arc<dyn JobStore> {
        self.jobs.clone()
    }
}
