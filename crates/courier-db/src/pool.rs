//! Connection pool for the job store.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use courier_core::{Error, Result};

/// Default maximum number of connections in the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default acquire timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Connections a worker needs beyond one per in-flight job: the claim and
/// reclaim queries, plus follow-on enqueues from handlers.
pub const WORKER_CONNECTION_HEADROOM: u32 = 2;

/// Where and how the job store connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// How long a claim or status write may wait for a free connection.
    pub connect_timeout: Duration,
}

impl PoolConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Read the pool settings from the process environment.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DATABASE_URL` | required | `postgres://` connection string |
    /// | `COURIER_DB_MAX_CONNECTIONS` | `10` | Pool size ceiling |
    /// | `COURIER_DB_CONNECT_TIMEOUT_SECS` | `30` | Acquire timeout |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`PoolConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::Config("DATABASE_URL is not set".into()))?;
        if !(database_url.starts_with("postgres://") || database_url.starts_with("postgresql://"))
        {
            return Err(Error::Config(
                "DATABASE_URL must start with postgres:// or postgresql://".into(),
            ));
        }

        let mut config = Self::new(database_url);
        if let Some(max) = parse_var::<u32>(&lookup, "COURIER_DB_MAX_CONNECTIONS")? {
            if max == 0 {
                return Err(Error::Config(
                    "COURIER_DB_MAX_CONNECTIONS must be at least 1".into(),
                ));
            }
            config.max_connections = max;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "COURIER_DB_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n.max(1);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Grow the pool so a worker claiming `batch_size` jobs never waits on
    /// its own connections. Never shrinks a larger configured size.
    pub fn sized_for_batch(mut self, batch_size: usize) -> Self {
        let needed = u32::try_from(batch_size)
            .unwrap_or(u32::MAX)
            .saturating_add(WORKER_CONNECTION_HEADROOM);
        self.max_connections = self.max_connections.max(needed);
        self
    }

    /// Open the pool.
    pub async fn connect(&self) -> Result<PgPool> {
        let start = Instant::now();

        info!(
            subsystem = "database",
            component = "pool",
            op = "create",
            max_connections = self.max_connections,
            connect_timeout_secs = self.connect_timeout.as_secs(),
            "Creating database connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.database_url)
            .await
            .map_err(Error::Database)?;

        info!(
            subsystem = "database",
            component = "pool",
            op = "established",
            pool_size = pool.size(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Database connection pool established"
        );
        Ok(pool)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} is not a valid number: {raw:?}"))),
    }
}

/// Open a pool with default sizing.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PoolConfig::new(database_url).connect().await
}

/// Log pool occupancy after a failed claim.
///
/// Warns when no idle connection is left: every claim and every status write
/// then waits on the acquire timeout.
pub fn log_pool_metrics(pool: &PgPool) {
    let size = pool.size();
    let idle = pool.num_idle();

    debug!(
        subsystem = "database",
        component = "pool",
        op = "metrics",
        pool_size = size,
        pool_idle = idle,
        "Pool health check"
    );

    if idle == 0 && size > 0 {
        warn!(
            subsystem = "database",
            component = "pool",
            pool_size = size,
            "Connection pool has no idle connections"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config =
            PoolConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/courier")]))
                .unwrap();
        assert_eq!(config.database_url, "postgres://localhost/courier");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(
            config.connect_timeout,
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = PoolConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgresql://db/courier"),
            ("COURIER_DB_MAX_CONNECTIONS", "25"),
            ("COURIER_DB_CONNECT_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.max_connections, 25);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_database_url_is_config_error() {
        let err = PoolConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("DATABASE_URL")));
    }

    #[test]
    fn test_non_postgres_url_is_config_error() {
        let err = PoolConfig::from_lookup(lookup(&[("DATABASE_URL", "mysql://db/courier")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_pool_size_is_config_error() {
        for bad in ["lots", "0", "-3"] {
            let err = PoolConfig::from_lookup(lookup(&[
                ("DATABASE_URL", "postgres://db/courier"),
                ("COURIER_DB_MAX_CONNECTIONS", bad),
            ]))
            .unwrap_err();
            assert!(matches!(err, Error::Config(msg) if msg.contains("COURIER_DB_MAX_CONNECTIONS")));
        }
    }

    #[test]
    fn test_sized_for_batch_grows_but_never_shrinks() {
        let config = PoolConfig::new("postgres://db/courier").max_connections(4);
        assert_eq!(config.clone().sized_for_batch(10).max_connections, 12);
        assert_eq!(
            config.max_connections(50).sized_for_batch(10).max_connections,
            50
        );
        assert_eq!(
            PoolConfig::new("postgres://db/courier")
                .sized_for_batch(usize::MAX)
                .max_connections,
            u32::MAX
        );
    }
}
