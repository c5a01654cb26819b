//! Metadata store repository: plugins, AUs, publishers, publications and items.

use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use aumeta_core::{au_key_of, plugin_id_of, Error, Result};

/// Version of the per-AU metadata layout written by this recorder.
pub const MD_VERSION: i64 = 1;

/// ISSN/ISBN kinds stored alongside a publication.
pub const PRINT: &str = "p";
pub const ELECTRONIC: &str = "e";

/// URL role under which an item's access URL is stored.
pub const ACCESS_URL_FEATURE: &str = "Access";

/// Locator for the stored rows of one AU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuRow {
    pub au_seq: i64,
    pub au_md_seq: Option<i64>,
    pub extract_time: Option<i64>,
    pub full_reindex: bool,
}

/// SQLite repository for recorded metadata.
#[derive(Clone)]
pub struct SqliteMetadataRepository {
    pool: SqlitePool,
}

impl SqliteMetadataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Stored rows of an AU, or `None` if it was never recorded.
    pub async fn find_au(&self, au_id: &str) -> Result<Option<AuRow>> {
        let row = sqlx::query(
            r#"
            SELECT a.au_seq, am.au_md_seq, am.extract_time, am.full_reindex
            FROM au a
            JOIN plugin p ON p.plugin_seq = a.plugin_seq
            LEFT JOIN au_md am ON am.au_seq = a.au_seq
            WHERE p.plugin_id = ? AND a.au_key = ?
            "#,
        )
        .bind(plugin_id_of(au_id))
        .bind(au_key_of(au_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| AuRow {
            au_seq: r.get("au_seq"),
            au_md_seq: r.get("au_md_seq"),
            extract_time: r.get("extract_time"),
            full_reindex: r.get::<Option<bool>, _>("full_reindex").unwrap_or(false),
        }))
    }

    /// Time in epoch millis of the AU's last recorded extraction.
    pub async fn get_extraction_time(&self, au_id: &str) -> Result<Option<i64>> {
        Ok(self.find_au(au_id).await?.and_then(|au| au.extract_time))
    }

    /// Whether the AU has been flagged for a full (non-incremental) reindex.
    pub async fn needs_full_reindex(&self, au_id: &str) -> Result<bool> {
        Ok(self
            .find_au(au_id)
            .await?
            .map(|au| au.full_reindex)
            .unwrap_or(false))
    }

    /// Number of metadata items recorded for an AU.
    pub async fn count_items(&self, au_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM md_item m
            JOIN au_md am ON am.au_md_seq = m.au_md_seq
            JOIN au a ON a.au_seq = am.au_seq
            JOIN plugin p ON p.plugin_seq = a.plugin_seq
            WHERE p.plugin_id = ? AND a.au_key = ?
            "#,
        )
        .bind(plugin_id_of(au_id))
        .bind(au_key_of(au_id))
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    /// Problems recorded for an AU.
    pub async fn list_au_problems(&self, au_id: &str) -> Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT problem FROM au_problem WHERE au_id = ? ORDER BY rowid")
                .bind(au_id)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(rows)
    }

    // =========================================================================
    // TRANSACTION METHODS
    // =========================================================================

    pub async fn find_or_create_platform_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        name: &str,
    ) -> Result<i64> {
        sqlx::query("INSERT OR IGNORE INTO platform (platform_name) VALUES (?)")
            .bind(name)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query_scalar("SELECT platform_seq FROM platform WHERE platform_name = ?")
            .bind(name)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)
    }

    /// Find or create a plugin row, updating its platform and bulk flag.
    pub async fn find_or_create_plugin_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        plugin_id: &str,
        platform: Option<&str>,
        is_bulk_content: bool,
    ) -> Result<i64> {
        let platform_seq = match platform {
            Some(name) => Some(self.find_or_create_platform_tx(tx, name).await?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO plugin (plugin_id, platform_seq, is_bulk_content)
            VALUES (?, ?, ?)
            ON CONFLICT (plugin_id) DO UPDATE SET
                platform_seq = COALESCE(excluded.platform_seq, plugin.platform_seq),
                is_bulk_content = excluded.is_bulk_content
            "#,
        )
        .bind(plugin_id)
        .bind(platform_seq)
        .bind(is_bulk_content)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query_scalar("SELECT plugin_seq FROM plugin WHERE plugin_id = ?")
            .bind(plugin_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)
    }

    pub async fn find_or_create_au_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        plugin_seq: i64,
        au_key: &str,
    ) -> Result<i64> {
        sqlx::query("INSERT OR IGNORE INTO au (plugin_seq, au_key) VALUES (?, ?)")
            .bind(plugin_seq)
            .bind(au_key)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query_scalar("SELECT au_seq FROM au WHERE plugin_seq = ? AND au_key = ?")
            .bind(plugin_seq)
            .bind(au_key)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)
    }

    /// Find the AU's metadata row, creating it with `now` as creation time.
    pub async fn find_or_create_au_md_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        au_seq: i64,
        now: i64,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO au_md (au_seq, md_version, extract_time, creation_time)
            VALUES (?, ?, 0, ?)
            "#,
        )
        .bind(au_seq)
        .bind(MD_VERSION)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        sqlx::query_scalar("SELECT au_md_seq FROM au_md WHERE au_seq = ?")
            .bind(au_seq)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)
    }

    pub async fn find_or_create_publisher_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        name: &str,
    ) -> Result<i64> {
        sqlx::query("INSERT OR IGNORE INTO publisher (publisher_name) VALUES (?)")
            .bind(name)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        sqlx::query_scalar("SELECT publisher_seq FROM publisher WHERE publisher_name = ?")
            .bind(name)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)
    }

    pub async fn find_or_create_provider_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        name: &str,
        lid: Option<&str>,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO provider (provider_name, provider_lid) VALUES (?, ?)
            ON CONFLICT (provider_name) DO UPDATE SET
                provider_lid = COALESCE(excluded.provider_lid, provider.provider_lid)
            "#,
        )
        .bind(name)
        .bind(lid)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        sqlx::query_scalar("SELECT provider_seq FROM provider WHERE provider_name = ?")
            .bind(name)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)
    }

    pub async fn find_or_create_publication_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        publisher_seq: i64,
        name: &str,
        publication_type: Option<&str>,
    ) -> Result<i64> {
        sqlx::query(
            r#"
            INSERT INTO publication (publisher_seq, publication_name, publication_type)
            VALUES (?, ?, ?)
            ON CONFLICT (publisher_seq, publication_name) DO UPDATE SET
                publication_type = COALESCE(publication.publication_type, excluded.publication_type)
            "#,
        )
        .bind(publisher_seq)
        .bind(name)
        .bind(publication_type)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        sqlx::query_scalar(
            "SELECT publication_seq FROM publication WHERE publisher_seq = ? AND publication_name = ?",
        )
        .bind(publisher_seq)
        .bind(name)
        .fetch_one(&mut **tx)
        .await
        .map_err(Error::Database)
    }

    pub async fn add_issn_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        publication_seq: i64,
        issn: &str,
        kind: &str,
    ) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO issn (publication_seq, issn, issn_type) VALUES (?, ?, ?)")
            .bind(publication_seq)
            .bind(issn)
            .bind(kind)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    pub async fn add_isbn_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        publication_seq: i64,
        isbn: &str,
        kind: &str,
    ) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO isbn (publication_seq, isbn, isbn_type) VALUES (?, ?, ?)")
            .bind(publication_seq)
            .bind(isbn)
            .bind(kind)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    /// Record a publication's proprietary (publisher-assigned) identifier.
    pub async fn add_proprietary_id_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        publication_seq: i64,
        proprietary_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO publication_proprietary_id (publication_seq, proprietary_id) VALUES (?, ?)",
        )
        .bind(publication_seq)
        .bind(proprietary_id)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    pub async fn add_au_problem_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        au_id: &str,
        problem: &str,
    ) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO au_problem (au_id, problem) VALUES (?, ?)")
            .bind(au_id)
            .bind(problem)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    /// Item of an AU already recorded under `access_url`, if any.
    pub async fn find_md_item_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        au_md_seq: i64,
        access_url: &str,
    ) -> Result<Option<i64>> {
        sqlx::query_scalar(
            r#"
            SELECT m.md_item_seq FROM md_item m
            JOIN url u ON u.md_item_seq = m.md_item_seq
            WHERE m.au_md_seq = ? AND u.feature = ? AND u.url = ?
            ORDER BY m.md_item_seq
            LIMIT 1
            "#,
        )
        .bind(au_md_seq)
        .bind(ACCESS_URL_FEATURE)
        .bind(access_url)
        .fetch_optional(&mut **tx)
        .await
        .map_err(Error::Database)
    }

    /// Drop the bibliographic details, authors, keywords, DOI and URLs of an
    /// item so they can be written again.
    pub async fn clear_md_item_details_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        md_item_seq: i64,
    ) -> Result<()> {
        for table in ["bib_item", "author", "keyword", "doi", "url"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE md_item_seq = ?"))
                .bind(md_item_seq)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
        }
        Ok(())
    }

    /// Stamp the AU's extraction watermark and clear its full-reindex flag.
    pub async fn update_extraction_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        au_md_seq: i64,
        extract_time: i64,
        provider_seq: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE au_md SET
                extract_time = ?,
                full_reindex = 0,
                md_version = ?,
                provider_seq = COALESCE(?, provider_seq)
            WHERE au_md_seq = ?
            "#,
        )
        .bind(extract_time)
        .bind(MD_VERSION)
        .bind(provider_seq)
        .bind(au_md_seq)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    /// Set or clear the full-reindex flag of a recorded AU.
    ///
    /// Returns false when the AU has never been recorded.
    pub async fn set_full_reindex_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        au_id: &str,
        full_reindex: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE au_md SET full_reindex = ?
            WHERE au_seq = (
                SELECT a.au_seq FROM au a
                JOIN plugin p ON p.plugin_seq = a.plugin_seq
                WHERE p.plugin_id = ? AND a.au_key = ?
            )
            "#,
        )
        .bind(full_reindex)
        .bind(plugin_id_of(au_id))
        .bind(au_key_of(au_id))
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every metadata item recorded for an AU, keeping the AU itself.
    ///
    /// Returns the number of items removed.
    pub async fn remove_au_metadata_items_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        au_id: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM md_item WHERE au_md_seq IN (
                SELECT am.au_md_seq FROM au_md am
                JOIN au a ON a.au_seq = am.au_seq
                JOIN plugin p ON p.plugin_seq = a.plugin_seq
                WHERE p.plugin_id = ? AND a.au_key = ?
            )
            "#,
        )
        .bind(plugin_id_of(au_id))
        .bind(au_key_of(au_id))
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "metadata",
            op = "remove_items",
            au_id,
            record_count = result.rows_affected(),
            "Removed AU metadata items"
        );
        Ok(result.rows_affected())
    }

    /// Delete an AU with all of its metadata. Returns the number of items removed.
    pub async fn delete_au_tx(&self, tx: &mut Transaction<'_, Sqlite>, au_id: &str) -> Result<u64> {
        let removed = self.remove_au_metadata_items_tx(tx, au_id).await?;
        sqlx::query(
            r#"
            DELETE FROM au WHERE au_seq IN (
                SELECT a.au_seq FROM au a
                JOIN plugin p ON p.plugin_seq = a.plugin_seq
                WHERE p.plugin_id = ? AND a.au_key = ?
            )
            "#,
        )
        .bind(plugin_id_of(au_id))
        .bind(au_key_of(au_id))
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        sqlx::query("DELETE FROM au_problem WHERE au_id = ?")
            .bind(au_id)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        Ok(removed)
    }
}
