//! Versioned schema evolution.
//!
//! The store records every applied version in `schema_version`. Upgrades run
//! forward one version at a time from the registered [`UPGRADE_STEPS`] table,
//! each in its own transaction, so a restart resumes at the first version not
//! yet committed.
//!
//! Steps tagged [`StepMode::Deferred`] only rewrite existing data. On the
//! fast-start path they are recorded as applied, queued in `deferred_upgrade`
//! and executed later by [`SchemaEngine::run_deferred`].
//!
//! # Step rules
//!
//! 1. Never modify a registered step; add a new version instead.
//! 2. Every change must be idempotent (`IF NOT EXISTS`, [`Change::AddColumn`]).
//! 3. Deferred steps must not change the shape of the store.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use aumeta_core::defaults::TARGET_SCHEMA_VERSION;
use aumeta_core::{Error, Result};

use crate::retry::{with_retry, RetryPolicy};

/// Whether a step must run before the store is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Sync,
    Deferred,
}

/// One idempotent change within an upgrade step.
#[derive(Debug, Clone, Copy)]
pub enum Change {
    /// A single SQL statement.
    Sql(&'static str),
    /// Add a column unless the table already has it.
    AddColumn {
        table: &'static str,
        column: &'static str,
        decl: &'static str,
    },
}

/// A named transformation bringing the store to `version`.
#[derive(Debug, Clone, Copy)]
pub struct UpgradeStep {
    pub version: u32,
    pub name: &'static str,
    pub mode: StepMode,
    pub changes: &'static [Change],
}

/// Outcome of [`SchemaEngine::upgrade`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    pub from: u32,
    pub to: u32,
    /// Versions whose changes ran.
    pub applied: Vec<u32>,
    /// Versions recorded as applied but queued for later execution.
    pub deferred: Vec<u32>,
}

const fn sync(version: u32, name: &'static str, changes: &'static [Change]) -> UpgradeStep {
    UpgradeStep {
        version,
        name,
        mode: StepMode::Sync,
        changes,
    }
}

const fn deferred(version: u32, name: &'static str, changes: &'static [Change]) -> UpgradeStep {
    UpgradeStep {
        version,
        name,
        mode: StepMode::Deferred,
        changes,
    }
}

/// Registered upgrade steps, indexed by `version - 1`.
pub static UPGRADE_STEPS: &[UpgradeStep] = &[
    sync(
        1,
        "base tables",
        &[
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS publisher (
                    publisher_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    publisher_name TEXT NOT NULL UNIQUE
                )",
            ),
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS plugin (
                    plugin_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    plugin_id TEXT NOT NULL UNIQUE
                )",
            ),
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS au (
                    au_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    plugin_seq INTEGER NOT NULL REFERENCES plugin (plugin_seq) ON DELETE CASCADE,
                    au_key TEXT NOT NULL,
                    UNIQUE (plugin_seq, au_key)
                )",
            ),
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS au_md (
                    au_md_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    au_seq INTEGER NOT NULL UNIQUE REFERENCES au (au_seq) ON DELETE CASCADE,
                    md_version INTEGER NOT NULL,
                    extract_time INTEGER NOT NULL
                )",
            ),
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS publication (
                    publication_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    publisher_seq INTEGER NOT NULL REFERENCES publisher (publisher_seq) ON DELETE CASCADE,
                    publication_name TEXT NOT NULL,
                    UNIQUE (publisher_seq, publication_name)
                )",
            ),
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS md_item (
                    md_item_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    publication_seq INTEGER REFERENCES publication (publication_seq) ON DELETE CASCADE,
                    au_md_seq INTEGER NOT NULL REFERENCES au_md (au_md_seq) ON DELETE CASCADE,
                    date TEXT,
                    article_title TEXT
                )",
            ),
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS pending_au (
                    pending_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    au_id TEXT NOT NULL UNIQUE,
                    priority INTEGER NOT NULL DEFAULT 0
                )",
            ),
        ],
    ),
    sync(
        2,
        "serial and book identifiers",
        &[
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS issn (
                    publication_seq INTEGER NOT NULL REFERENCES publication (publication_seq) ON DELETE CASCADE,
                    issn TEXT NOT NULL,
                    issn_type TEXT NOT NULL,
                    UNIQUE (publication_seq, issn, issn_type)
                )",
            ),
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS isbn (
                    publication_seq INTEGER NOT NULL REFERENCES publication (publication_seq) ON DELETE CASCADE,
                    isbn TEXT NOT NULL,
                    isbn_type TEXT NOT NULL,
                    UNIQUE (publication_seq, isbn, isbn_type)
                )",
            ),
        ],
    ),
    sync(
        3,
        "bibliographic item",
        &[Change::Sql(
            "CREATE TABLE IF NOT EXISTS bib_item (
                md_item_seq INTEGER NOT NULL UNIQUE REFERENCES md_item (md_item_seq) ON DELETE CASCADE,
                volume TEXT,
                issue TEXT,
                start_page TEXT,
                end_page TEXT
            )",
        )],
    ),
    sync(
        4,
        "authors and keywords",
        &[
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS author (
                    md_item_seq INTEGER NOT NULL REFERENCES md_item (md_item_seq) ON DELETE CASCADE,
                    author_name TEXT NOT NULL,
                    author_idx INTEGER NOT NULL
                )",
            ),
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS keyword (
                    md_item_seq INTEGER NOT NULL REFERENCES md_item (md_item_seq) ON DELETE CASCADE,
                    keyword TEXT NOT NULL
                )",
            ),
        ],
    ),
    sync(
        5,
        "urls and dois",
        &[
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS url (
                    md_item_seq INTEGER NOT NULL REFERENCES md_item (md_item_seq) ON DELETE CASCADE,
                    feature TEXT NOT NULL,
                    url TEXT NOT NULL
                )",
            ),
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS doi (
                    md_item_seq INTEGER NOT NULL REFERENCES md_item (md_item_seq) ON DELETE CASCADE,
                    doi TEXT NOT NULL
                )",
            ),
        ],
    ),
    sync(
        6,
        "platforms",
        &[
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS platform (
                    platform_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    platform_name TEXT NOT NULL UNIQUE
                )",
            ),
            Change::AddColumn {
                table: "plugin",
                column: "platform_seq",
                decl: "INTEGER REFERENCES platform (platform_seq)",
            },
        ],
    ),
    sync(
        7,
        "item coverage",
        &[Change::AddColumn {
            table: "md_item",
            column: "coverage",
            decl: "TEXT",
        }],
    ),
    sync(
        8,
        "publication type",
        &[Change::AddColumn {
            table: "publication",
            column: "publication_type",
            decl: "TEXT",
        }],
    ),
    sync(
        9,
        "providers",
        &[
            Change::Sql(
                "CREATE TABLE IF NOT EXISTS provider (
                    provider_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    provider_name TEXT NOT NULL UNIQUE
                )",
            ),
            Change::AddColumn {
                table: "au_md",
                column: "provider_seq",
                decl: "INTEGER REFERENCES provider (provider_seq)",
            },
        ],
    ),
    deferred(
        10,
        "backfill au providers from publishers",
        &[
            Change::Sql(
                "INSERT OR IGNORE INTO provider (provider_name)
                 SELECT DISTINCT p.publisher_name
                 FROM publisher p
                 JOIN publication pu ON pu.publisher_seq = p.publisher_seq
                 JOIN md_item m ON m.publication_seq = pu.publication_seq
                 JOIN au_md am ON am.au_md_seq = m.au_md_seq
                 WHERE am.provider_seq IS NULL",
            ),
            Change::Sql(
                "UPDATE au_md SET provider_seq = (
                    SELECT pr.provider_seq
                    FROM md_item m
                    JOIN publication pu ON pu.publication_seq = m.publication_seq
                    JOIN publisher p ON p.publisher_seq = pu.publisher_seq
                    JOIN provider pr ON pr.provider_name = p.publisher_name
                    WHERE m.au_md_seq = au_md.au_md_seq
                    LIMIT 1
                 )
                 WHERE provider_seq IS NULL",
            ),
        ],
    ),
    sync(
        11,
        "au metadata creation time",
        &[Change::AddColumn {
            table: "au_md",
            column: "creation_time",
            decl: "INTEGER NOT NULL DEFAULT 0",
        }],
    ),
    sync(
        12,
        "pending full reindex flag",
        &[Change::AddColumn {
            table: "pending_au",
            column: "full_reindex",
            decl: "INTEGER NOT NULL DEFAULT 0",
        }],
    ),
    sync(
        13,
        "au full reindex flag",
        &[Change::AddColumn {
            table: "au_md",
            column: "full_reindex",
            decl: "INTEGER NOT NULL DEFAULT 0",
        }],
    ),
    sync(
        14,
        "item lookup indexes",
        &[
            Change::Sql("CREATE INDEX IF NOT EXISTS idx_md_item_au_md ON md_item (au_md_seq)"),
            Change::Sql(
                "CREATE INDEX IF NOT EXISTS idx_md_item_publication ON md_item (publication_seq)",
            ),
            Change::Sql(
                "CREATE INDEX IF NOT EXISTS idx_publication_publisher ON publication (publisher_seq)",
            ),
        ],
    ),
    deferred(
        15,
        "normalize stored identifiers",
        &[
            Change::Sql("UPDATE OR IGNORE issn SET issn = UPPER(REPLACE(issn, '-', '')) WHERE issn LIKE '%-%'"),
            Change::Sql("DELETE FROM issn WHERE issn LIKE '%-%'"),
            Change::Sql("UPDATE OR IGNORE isbn SET isbn = REPLACE(isbn, '-', '') WHERE isbn LIKE '%-%'"),
            Change::Sql("DELETE FROM isbn WHERE isbn LIKE '%-%'"),
        ],
    ),
    sync(
        16,
        "item fetch time",
        &[Change::AddColumn {
            table: "md_item",
            column: "fetch_time",
            decl: "INTEGER",
        }],
    ),
    deferred(
        17,
        "backfill item fetch times",
        &[Change::Sql(
            "UPDATE md_item SET fetch_time = (
                SELECT am.extract_time FROM au_md am WHERE am.au_md_seq = md_item.au_md_seq
             )
             WHERE fetch_time IS NULL",
        )],
    ),
    sync(
        18,
        "au problems",
        &[Change::Sql(
            "CREATE TABLE IF NOT EXISTS au_problem (
                au_id TEXT NOT NULL,
                problem TEXT NOT NULL,
                UNIQUE (au_id, problem)
            )",
        )],
    ),
    sync(
        19,
        "bulk content plugins",
        &[Change::AddColumn {
            table: "plugin",
            column: "is_bulk_content",
            decl: "INTEGER NOT NULL DEFAULT 0",
        }],
    ),
    deferred(
        20,
        "remove orphan publications",
        &[Change::Sql(
            "DELETE FROM publication WHERE NOT EXISTS (
                SELECT 1 FROM md_item m WHERE m.publication_seq = publication.publication_seq
             )",
        )],
    ),
    sync(
        21,
        "publication proprietary ids",
        &[Change::Sql(
            "CREATE TABLE IF NOT EXISTS publication_proprietary_id (
                publication_seq INTEGER NOT NULL REFERENCES publication (publication_seq) ON DELETE CASCADE,
                proprietary_id TEXT NOT NULL,
                UNIQUE (publication_seq, proprietary_id)
            )",
        )],
    ),
    sync(
        22,
        "au active flag",
        &[Change::AddColumn {
            table: "au_md",
            column: "active",
            decl: "INTEGER NOT NULL DEFAULT 1",
        }],
    ),
    sync(
        23,
        "provider lockss id",
        &[Change::AddColumn {
            table: "provider",
            column: "provider_lid",
            decl: "TEXT",
        }],
    ),
    sync(
        24,
        "bibliographic item number",
        &[Change::AddColumn {
            table: "bib_item",
            column: "item_no",
            decl: "TEXT",
        }],
    ),
    sync(
        25,
        "pending queue order index",
        &[Change::Sql(
            "CREATE INDEX IF NOT EXISTS idx_pending_au_priority ON pending_au (priority DESC, pending_seq)",
        )],
    ),
    sync(
        26,
        "doi index",
        &[Change::Sql("CREATE INDEX IF NOT EXISTS idx_doi ON doi (doi)")],
    ),
    sync(
        27,
        "issn index",
        &[Change::Sql("CREATE INDEX IF NOT EXISTS idx_issn ON issn (issn)")],
    ),
];

const BOOTSTRAP: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        applied_at INTEGER NOT NULL,
        deferred INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS deferred_upgrade (
        version INTEGER PRIMARY KEY,
        name TEXT NOT NULL
    )",
];

/// Applies registered upgrade steps to a store.
#[derive(Clone)]
pub struct SchemaEngine {
    pool: SqlitePool,
    steps: &'static [UpgradeStep],
    retry: RetryPolicy,
    fast_start: bool,
}

impl SchemaEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_steps(pool, UPGRADE_STEPS)
    }

    /// Engine over a custom step table; versions must be `1..=steps.len()`.
    pub fn with_steps(pool: SqlitePool, steps: &'static [UpgradeStep]) -> Self {
        Self {
            pool,
            steps,
            retry: RetryPolicy::default(),
            fast_start: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Skip deferred steps during [`upgrade`](Self::upgrade), queueing them instead.
    pub fn with_fast_start(mut self, fast_start: bool) -> Self {
        self.fast_start = fast_start;
        self
    }

    /// Highest version registered in the step table.
    pub fn latest_version(&self) -> u32 {
        self.steps.last().map(|s| s.version).unwrap_or(0)
    }

    /// Current version recorded in the store, 0 for an empty store.
    pub async fn current_version(&self) -> Result<u32> {
        with_retry(self.retry, "current_version", || async move {
            self.bootstrap().await?;
            let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
            Ok(version.unwrap_or(0) as u32)
        })
        .await
    }

    /// Bring the store to [`TARGET_SCHEMA_VERSION`].
    pub async fn upgrade_to_latest(&self) -> Result<UpgradeReport> {
        self.upgrade(TARGET_SCHEMA_VERSION.min(self.latest_version())).await
    }

    /// Apply every step from the current version up to `target`, in order.
    ///
    /// A store already at or past `target` is left untouched.
    pub async fn upgrade(&self, target: u32) -> Result<UpgradeReport> {
        let from = self.current_version().await?;
        let mut report = UpgradeReport {
            from,
            to: from,
            ..Default::default()
        };

        if from >= target {
            if from > target {
                warn!(
                    subsystem = "db",
                    component = "schema",
                    op = "upgrade",
                    current = from,
                    target,
                    "Store schema is newer than requested target; not downgrading"
                );
            } else {
                debug!(
                    subsystem = "db",
                    component = "schema",
                    op = "upgrade",
                    version = from,
                    "Store schema is up to date"
                );
            }
            return Ok(report);
        }

        info!(
            subsystem = "db",
            component = "schema",
            op = "upgrade",
            from,
            target,
            fast_start = self.fast_start,
            "Upgrading store schema"
        );

        for version in (from + 1)..=target {
            let step = self.step(version)?;
            let defer = self.fast_start && step.mode == StepMode::Deferred;
            let start = Instant::now();

            with_retry(self.retry, "upgrade_step", || self.apply_step(step, defer))
                .await
                .map_err(|e| schema_error(version, e))?;

            if defer {
                report.deferred.push(version);
            } else {
                report.applied.push(version);
            }
            report.to = version;

            info!(
                subsystem = "db",
                component = "schema",
                op = "upgrade",
                version,
                step = step.name,
                deferred = defer,
                duration_ms = start.elapsed().as_millis() as u64,
                "Schema upgrade step committed"
            );
        }

        Ok(report)
    }

    /// Versions queued for deferred execution, in ascending order.
    pub async fn pending_deferred(&self) -> Result<Vec<u32>> {
        self.bootstrap().await?;
        let rows: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM deferred_upgrade ORDER BY version")
                .fetch_all(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(rows.into_iter().map(|v| v as u32).collect())
    }

    /// Execute queued deferred steps in version order.
    ///
    /// Each step and the removal of its queue entry commit together, so the
    /// queue can be drained again after a crash.
    pub async fn run_deferred(&self) -> Result<Vec<u32>> {
        let mut completed = Vec::new();
        for version in self.pending_deferred().await? {
            let step = self.step(version)?;
            let start = Instant::now();

            with_retry(self.retry, "deferred_step", || self.complete_deferred(step))
                .await
                .map_err(|e| schema_error(version, e))?;

            info!(
                subsystem = "db",
                component = "schema",
                op = "run_deferred",
                version,
                step = step.name,
                duration_ms = start.elapsed().as_millis() as u64,
                "Deferred schema step completed"
            );
            completed.push(version);
        }
        Ok(completed)
    }

    /// Run [`run_deferred`](Self::run_deferred) on a background task.
    pub fn spawn_deferred(self: Arc<Self>) -> JoinHandle<Result<Vec<u32>>> {
        tokio::spawn(async move {
            let result = self.run_deferred().await;
            if let Err(e) = &result {
                error!(
                    subsystem = "db",
                    component = "schema",
                    op = "run_deferred",
                    error = %e,
                    "Deferred schema upgrade failed"
                );
            }
            result
        })
    }

    fn step(&self, version: u32) -> Result<&'static UpgradeStep> {
        self.steps
            .get(version.saturating_sub(1) as usize)
            .filter(|s| s.version == version)
            .ok_or_else(|| Error::Schema {
                version,
                message: "no upgrade step registered".to_string(),
            })
    }

    async fn bootstrap(&self) -> Result<()> {
        for sql in BOOTSTRAP {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
        }
        Ok(())
    }

    async fn apply_step(&self, step: &UpgradeStep, defer: bool) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if !defer {
            for change in step.changes {
                apply_change(&mut tx, change).await?;
            }
        }

        sqlx::query(
            "INSERT INTO schema_version (version, name, applied_at, deferred) VALUES (?, ?, ?, ?)",
        )
        .bind(step.version as i64)
        .bind(step.name)
        .bind(Utc::now().timestamp_millis())
        .bind(defer)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if defer {
            sqlx::query("INSERT OR IGNORE INTO deferred_upgrade (version, name) VALUES (?, ?)")
                .bind(step.version as i64)
                .bind(step.name)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)
    }

    async fn complete_deferred(&self, step: &UpgradeStep) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        for change in step.changes {
            apply_change(&mut tx, change).await?;
        }
        sqlx::query("DELETE FROM deferred_upgrade WHERE version = ?")
            .bind(step.version as i64)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query("UPDATE schema_version SET deferred = 0 WHERE version = ?")
            .bind(step.version as i64)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)
    }
}

async fn apply_change(tx: &mut Transaction<'_, Sqlite>, change: &Change) -> Result<()> {
    match change {
        Change::Sql(sql) => {
            sqlx::query(sql)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
        }
        Change::AddColumn {
            table,
            column,
            decl,
        } => {
            let exists: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?",
            )
            .bind(*table)
            .bind(*column)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)?;

            if exists == 0 {
                let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {decl}");
                sqlx::query(&sql)
                    .execute(&mut **tx)
                    .await
                    .map_err(Error::Database)?;
            }
        }
    }
    Ok(())
}

fn schema_error(version: u32, err: Error) -> Error {
    match err {
        Error::Schema { .. } => err,
        other => Error::Schema {
            version,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pool::create_pool;

    static LOGGED_STEPS: &[UpgradeStep] = &[
        sync(
            1,
            "log table",
            &[Change::Sql(
                "CREATE TABLE IF NOT EXISTS upgrade_log (version INTEGER NOT NULL)",
            )],
        ),
        sync(2, "two", &[Change::Sql("INSERT INTO upgrade_log VALUES (2)")]),
        deferred(3, "three", &[Change::Sql("INSERT INTO upgrade_log VALUES (3)")]),
        sync(4, "four", &[Change::Sql("INSERT INTO upgrade_log VALUES (4)")]),
    ];

    static BROKEN_STEPS: &[UpgradeStep] = &[
        sync(1, "ok", &[Change::Sql("CREATE TABLE IF NOT EXISTS t (x INTEGER)")]),
        sync(2, "broken", &[Change::Sql("INSERT INTO missing_table VALUES (1)")]),
    ];

    async fn memory_pool() -> SqlitePool {
        create_pool("sqlite::memory:").await.unwrap()
    }

    fn engine(pool: &SqlitePool, steps: &'static [UpgradeStep]) -> SchemaEngine {
        SchemaEngine::with_steps(pool.clone(), steps)
            .with_retry(RetryPolicy::new(1, Duration::from_millis(1)))
    }

    async fn logged(pool: &SqlitePool) -> Vec<i64> {
        sqlx::query_scalar("SELECT version FROM upgrade_log ORDER BY rowid")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[test]
    fn test_registered_steps_are_contiguous() {
        for (i, step) in UPGRADE_STEPS.iter().enumerate() {
            assert_eq!(step.version as usize, i + 1);
        }
        assert_eq!(UPGRADE_STEPS.len() as u32, TARGET_SCHEMA_VERSION);
    }

    #[test]
    fn test_deferred_steps() {
        let deferred: Vec<u32> = UPGRADE_STEPS
            .iter()
            .filter(|s| s.mode == StepMode::Deferred)
            .map(|s| s.version)
            .collect();
        assert_eq!(deferred, vec![10, 15, 17, 20]);
    }

    #[tokio::test]
    async fn test_empty_store_is_version_zero() {
        let pool = memory_pool().await;
        assert_eq!(SchemaEngine::new(pool).current_version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_upgrade() {
        let pool = memory_pool().await;
        let engine = SchemaEngine::new(pool.clone());
        let report = engine.upgrade_to_latest().await.unwrap();

        assert_eq!(report.from, 0);
        assert_eq!(report.to, TARGET_SCHEMA_VERSION);
        assert_eq!(report.applied.len(), TARGET_SCHEMA_VERSION as usize);
        assert!(report.deferred.is_empty());
        assert_eq!(engine.current_version().await.unwrap(), TARGET_SCHEMA_VERSION);

        // Running again is a no-op.
        let again = engine.upgrade_to_latest().await.unwrap();
        assert!(again.applied.is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_resumes_after_restart() {
        let pool = memory_pool().await;
        let first = engine(&pool, LOGGED_STEPS).upgrade(2).await.unwrap();
        assert_eq!(first.applied, vec![1, 2]);

        // A fresh engine picks up at version 3.
        let second = engine(&pool, LOGGED_STEPS).upgrade(4).await.unwrap();
        assert_eq!(second.from, 2);
        assert_eq!(second.applied, vec![3, 4]);
        assert_eq!(logged(&pool).await, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_fast_start_defers_async_steps() {
        let pool = memory_pool().await;
        let engine = engine(&pool, LOGGED_STEPS).with_fast_start(true);

        let report = engine.upgrade(4).await.unwrap();
        assert_eq!(report.applied, vec![1, 2, 4]);
        assert_eq!(report.deferred, vec![3]);
        assert_eq!(engine.current_version().await.unwrap(), 4);
        assert_eq!(logged(&pool).await, vec![2, 4]);
        assert_eq!(engine.pending_deferred().await.unwrap(), vec![3]);

        assert_eq!(engine.run_deferred().await.unwrap(), vec![3]);
        assert_eq!(logged(&pool).await, vec![2, 4, 3]);
        assert!(engine.pending_deferred().await.unwrap().is_empty());

        // Draining an empty queue does nothing.
        assert!(engine.run_deferred().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_deferred() {
        let pool = memory_pool().await;
        let engine = Arc::new(engine(&pool, LOGGED_STEPS).with_fast_start(true));
        engine.upgrade(4).await.unwrap();

        let done = engine.clone().spawn_deferred().await.unwrap().unwrap();
        assert_eq!(done, vec![3]);
    }

    #[tokio::test]
    async fn test_failed_step_is_fatal_and_not_recorded() {
        let pool = memory_pool().await;
        let engine = engine(&pool, BROKEN_STEPS);

        let err = engine.upgrade(2).await.unwrap_err();
        assert!(matches!(err, Error::Schema { version: 2, .. }));
        assert_eq!(engine.current_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_downgrade() {
        let pool = memory_pool().await;
        let engine = engine(&pool, LOGGED_STEPS);
        engine.upgrade(4).await.unwrap();

        let report = engine.upgrade(2).await.unwrap();
        assert_eq!(report.from, 4);
        assert!(report.applied.is_empty());
        assert_eq!(engine.current_version().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_missing_step_is_reported() {
        let pool = memory_pool().await;
        let err = engine(&pool, LOGGED_STEPS).upgrade(5).await.unwrap_err();
        assert!(matches!(err, Error::Schema { version: 5, .. }));
    }

    #[tokio::test]
    async fn test_add_column_is_idempotent() {
        let pool = memory_pool().await;
        SchemaEngine::new(pool.clone()).upgrade(13).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        apply_change(
            &mut tx,
            &Change::AddColumn {
                table: "au_md",
                column: "full_reindex",
                decl: "INTEGER NOT NULL DEFAULT 0",
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }
}
