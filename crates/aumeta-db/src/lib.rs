//! # aumeta-db
//!
//! SQLite metadata store for aumeta.
//!
//! This crate provides:
//! - Connection pool management and bounded retry of transient failures
//! - The versioned schema evolution engine
//! - Repositories for recorded metadata and the pending-work queue
//! - The recorder that writes an AU's extracted records
//!
//! ## Example
//!
//! ```rust,ignore
//! use aumeta_db::{Database, DbConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open(&DbConfig::from_env()).await?;
//!     db.pending.add("org|lockss|plugin|Plugin&base_url~http%3A%2F%2Fx%2F", false).await?;
//!     Ok(())
//! }
//! ```

pub mod metadata;
pub mod pending;
pub mod pool;
pub mod recorder;
pub mod retry;
pub mod schema;

// Test fixtures shared with integration tests in tests/.
pub mod test_fixtures;

// Re-export core types
pub use aumeta_core::*;

pub use metadata::{AuRow, SqliteMetadataRepository};
pub use pending::SqlitePendingRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, DbConfig};
pub use recorder::{normalize, AuRecordingContext, MetadataRecorder, RecordSummary};
pub use retry::{with_retry, RetryPolicy};
pub use schema::{SchemaEngine, StepMode, UpgradeReport, UpgradeStep, UPGRADE_STEPS};

use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::info;

/// Combined database context with all repositories.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: SqlitePool,
    /// Recorded metadata.
    pub metadata: SqliteMetadataRepository,
    /// AUs awaiting indexing.
    pub pending: SqlitePendingRepository,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            metadata: SqliteMetadataRepository::new(pool.clone()),
            pending: SqlitePendingRepository::new(pool.clone()),
            retry: RetryPolicy::default(),
            pool,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Connect to the given URL without touching the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Connect and bring the schema up to date.
    ///
    /// With `skip_async_upgrades` set, deferred steps are queued rather than
    /// run; call [`SchemaEngine::run_deferred`] (or `spawn_deferred`) later.
    pub async fn open(config: &DbConfig) -> Result<Self> {
        let pool = with_retry(config.retry, "connect", || create_pool_with_config(config)).await?;
        let db = Self::new(pool).with_retry(config.retry);
        let report = db
            .schema()
            .with_fast_start(config.skip_async_upgrades)
            .upgrade_to_latest()
            .await?;

        info!(
            subsystem = "db",
            component = "database",
            op = "open",
            from = report.from,
            to = report.to,
            deferred = report.deferred.len(),
            "Metadata store ready"
        );
        Ok(db)
    }

    /// Schema engine over this database's pool.
    pub fn schema(&self) -> SchemaEngine {
        SchemaEngine::new(self.pool.clone()).with_retry(self.retry)
    }

    /// Begin a transaction, retrying transient connection failures.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        let pool = &self.pool;
        with_retry(self.retry, "begin", || async move {
            pool.begin().await.map_err(Error::Database)
        })
        .await
    }

    /// Flag an AU for a full reindex and queue it.
    ///
    /// AUs never recorded are simply queued; they are indexed in full anyway.
    pub async fn mark_full_reindex(&self, au_id: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        self.metadata.set_full_reindex_tx(&mut tx, au_id, true).await?;
        self.pending.add_tx(&mut tx, au_id, true).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
