//! Pending-work queue of AUs awaiting indexing.
//!
//! Entries are removed before a task works on an AU and re-added only when
//! the task does not succeed, in the same transaction as the removal.

use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use aumeta_core::defaults::{DEFAULT_INDEX_PRIORITY, FAILED_INDEX_PRIORITY, MIN_INDEX_PRIORITY};
use aumeta_core::{Error, PendingAu, Result};

/// SQLite repository for the pending queue.
#[derive(Clone)]
pub struct SqlitePendingRepository {
    pool: SqlitePool,
}

impl SqlitePendingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Queue an AU unless it is already queued. See [`add_tx`](Self::add_tx).
    pub async fn add(&self, au_id: &str, full_reindex: bool) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let added = self.add_tx(&mut tx, au_id, full_reindex).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(added)
    }

    pub async fn remove(&self, au_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let removed = self.remove_tx(&mut tx, au_id).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(removed)
    }

    /// Queue an AU at the default priority unless it is already queued.
    ///
    /// An existing entry keeps its place; a full-reindex request upgrades it.
    /// Returns true when a new entry was created.
    pub async fn add_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        au_id: &str,
        full_reindex: bool,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO pending_au (au_id, priority, full_reindex) VALUES (?, ?, ?)",
        )
        .bind(au_id)
        .bind(DEFAULT_INDEX_PRIORITY)
        .bind(full_reindex)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?
        .rows_affected()
            > 0;

        if !inserted && full_reindex {
            sqlx::query("UPDATE pending_au SET full_reindex = 1 WHERE au_id = ?")
                .bind(au_id)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
        }
        Ok(inserted)
    }

    /// Queue an AU whose indexing failed at the penalized priority.
    pub async fn add_failed_tx(&self, tx: &mut Transaction<'_, Sqlite>, au_id: &str) -> Result<()> {
        self.set_priority_tx(tx, au_id, FAILED_INDEX_PRIORITY).await
    }

    /// Queue an AU (or move an existing entry) at an explicit priority.
    ///
    /// Entries at or below the minimum priority are never admitted.
    pub async fn set_priority_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        au_id: &str,
        priority: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_au (au_id, priority) VALUES (?, ?)
            ON CONFLICT (au_id) DO UPDATE SET priority = excluded.priority
            "#,
        )
        .bind(au_id)
        .bind(priority)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    pub async fn remove_tx(&self, tx: &mut Transaction<'_, Sqlite>, au_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_au WHERE au_id = ?")
            .bind(au_id)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Admissible AUs in admission order.
    ///
    /// Highest priority first, then (optionally) never-indexed AUs, then
    /// first-queued first.
    pub async fn list_prioritized(&self, limit: i64, prioritize_new: bool) -> Result<Vec<PendingAu>> {
        let order = if prioritize_new {
            "p.priority DESC, is_new DESC, p.pending_seq"
        } else {
            "p.priority DESC, p.pending_seq"
        };
        let sql = format!(
            r#"
            SELECT p.au_id, p.priority, p.full_reindex,
                NOT EXISTS (
                    SELECT 1 FROM au a
                    JOIN plugin pl ON pl.plugin_seq = a.plugin_seq
                    JOIN au_md am ON am.au_seq = a.au_seq
                    WHERE pl.plugin_id || '&' || a.au_key = p.au_id
                ) AS is_new
            FROM pending_au p
            WHERE p.priority > ?
            ORDER BY {order}
            LIMIT ?
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(MIN_INDEX_PRIORITY)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|r| PendingAu {
                au_id: r.get("au_id"),
                priority: r.get("priority"),
                full_reindex: r.get("full_reindex"),
                is_new: r.get("is_new"),
            })
            .collect())
    }

    pub async fn get(&self, au_id: &str) -> Result<Option<PendingAu>> {
        let row = sqlx::query("SELECT au_id, priority, full_reindex FROM pending_au WHERE au_id = ?")
            .bind(au_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(|r| PendingAu {
            au_id: r.get("au_id"),
            priority: r.get("priority"),
            full_reindex: r.get("full_reindex"),
            is_new: false,
        }))
    }

    /// Number of queued AUs, including those that will never be admitted.
    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM pending_au")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)
    }
}
