//! Database connection pool management.

use std::str::FromStr;
use std::time::{Duration, Instant};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, warn};

use aumeta_core::defaults;
use aumeta_core::{Error, Result};

use crate::retry::RetryPolicy;

/// Database configuration, read from the environment by [`DbConfig::from_env`].
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite URL, e.g. `sqlite://aumeta.db` or `sqlite::memory:`.
    pub database_url: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
    /// How long to wait for a free pooled connection.
    pub acquire_timeout: Duration,
    /// Retry behavior for transient failures.
    pub retry: RetryPolicy,
    /// Skip asynchronous schema upgrade steps during startup.
    pub skip_async_upgrades: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: defaults::DATABASE_URL.to_string(),
            max_connections: defaults::DB_MAX_CONNECTIONS,
            busy_timeout: Duration::from_millis(defaults::DB_BUSY_TIMEOUT_MS),
            acquire_timeout: Duration::from_secs(defaults::DB_ACQUIRE_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            skip_async_upgrades: false,
        }
    }
}

impl DbConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Reads:
    /// - `DATABASE_URL` (default: `sqlite://aumeta.db`)
    /// - `DB_MAX_CONNECTIONS` (default: 5)
    /// - `DB_MAX_RETRY_COUNT` (default: 10)
    /// - `DB_RETRY_DELAY_MS` (default: 3000)
    /// - `DB_BUSY_TIMEOUT_MS` (default: 5000)
    /// - `DB_SKIP_ASYNC_UPGRADES` (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| defaults.database_url.clone());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_connections);

        let max_retries = std::env::var("DB_MAX_RETRY_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.retry.max_retries);

        let retry_delay = std::env::var("DB_RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry.delay);

        let busy_timeout = std::env::var("DB_BUSY_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.busy_timeout);

        let skip_async_upgrades = std::env::var("DB_SKIP_ASYNC_UPGRADES")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Self {
            database_url,
            max_connections,
            busy_timeout,
            acquire_timeout: defaults.acquire_timeout,
            retry: RetryPolicy::new(max_retries, retry_delay),
            skip_async_upgrades,
        }
    }

    /// Set the maximum number of connections.
    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    /// Set the connection acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Skip asynchronous schema upgrade steps during startup.
    pub fn with_skip_async_upgrades(mut self, skip: bool) -> Self {
        self.skip_async_upgrades = skip;
        self
    }

    fn is_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

/// Create a new SQLite connection pool with default configuration.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    create_pool_with_config(&DbConfig::new(database_url)).await
}

/// Create a new SQLite connection pool with custom configuration.
///
/// In-memory databases live only as long as their connection, so they get a
/// single connection that is never recycled.
pub async fn create_pool_with_config(config: &DbConfig) -> Result<SqlitePool> {
    let start = Instant::now();
    let memory = config.is_memory();
    let max_connections = if memory { 1 } else { config.max_connections };

    info!(
        subsystem = "db",
        component = "pool",
        op = "create",
        max_connections,
        busy_timeout_ms = config.busy_timeout.as_millis() as u64,
        memory,
        "Creating database connection pool"
    );

    let mut connect = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(Error::Database)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(config.busy_timeout);
    if !memory {
        connect = connect.journal_mode(SqliteJournalMode::Wal);
    }

    let mut options = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(config.acquire_timeout);
    if memory {
        options = options
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    let pool = options
        .connect_with(connect)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "established",
        pool_size = pool.size(),
        pool_idle = pool.num_idle(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}

/// Log current pool health metrics.
pub fn log_pool_metrics(pool: &SqlitePool) {
    let size = pool.size();
    let idle = pool.num_idle();

    debug!(
        subsystem = "db",
        component = "pool",
        op = "metrics",
        pool_size = size,
        pool_idle = idle,
        "Pool health check"
    );

    if idle == 0 && size > 0 {
        warn!(
            subsystem = "db",
            component = "pool",
            pool_size = size,
            "Connection pool has no idle connections"
        );
    }
}
