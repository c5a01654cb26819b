//! Writes an AU's extracted records into the metadata store.

use std::collections::BTreeSet;

use chrono::Utc;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, trace, warn};

use aumeta_core::defaults::{
    MAX_AUTHOR_COLUMN, MAX_DOI_COLUMN, MAX_FEATURE_COLUMN, MAX_KEYWORD_COLUMN, MAX_NAME_COLUMN,
    MAX_PROPRIETARY_ID_COLUMN, MAX_SHORT_COLUMN, MAX_URL_COLUMN, UNKNOWN_PUBLISHER_PREFIX,
};
use aumeta_core::metadata_util::{
    fit, is_truncated, strip_doi_prefix, synthesize_unknown_title, to_unpunctuated_isbn,
    to_unpunctuated_issn,
};
use aumeta_core::{au_key_of, plugin_id_of, Error, ExtractedRecord, ReferenceRecord, Result};

pub use crate::metadata::ACCESS_URL_FEATURE;
use crate::metadata::{SqliteMetadataRepository, ELECTRONIC, PRINT};

/// What the recorder needs to know about the AU being recorded.
#[derive(Debug, Clone, Default)]
pub struct AuRecordingContext {
    pub au_id: String,
    pub platform: Option<String>,
    pub is_bulk_content: bool,
    pub reference: Option<ReferenceRecord>,
}

impl AuRecordingContext {
    pub fn new(au_id: impl Into<String>) -> Self {
        Self {
            au_id: au_id.into(),
            ..Default::default()
        }
    }

    pub fn with_reference(mut self, reference: Option<ReferenceRecord>) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_bulk_content(mut self, is_bulk_content: bool) -> Self {
        self.is_bulk_content = is_bulk_content;
        self
    }

    pub fn with_platform(mut self, platform: Option<String>) -> Self {
        self.platform = platform;
        self
    }
}

/// Result of recording one AU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordSummary {
    pub au_md_seq: i64,
    pub items: u64,
    pub extract_time: i64,
}

/// Records buffered metadata for an AU inside a caller-owned transaction.
pub struct MetadataRecorder<'a> {
    repo: &'a SqliteMetadataRepository,
    context: &'a AuRecordingContext,
    unknown_publisher: Option<String>,
}

impl<'a> MetadataRecorder<'a> {
    pub fn new(repo: &'a SqliteMetadataRepository, context: &'a AuRecordingContext) -> Self {
        Self {
            repo,
            context,
            unknown_publisher: None,
        }
    }

    /// Record every item of `records`, then stamp the AU's extraction time.
    ///
    /// An empty `records` still stamps the extraction time. `on_item` is told
    /// the running count after each stored item. The first failure aborts the
    /// recording; the caller is expected to roll back.
    pub async fn record_tx<I>(
        &mut self,
        tx: &mut Transaction<'_, Sqlite>,
        records: I,
        mut on_item: impl FnMut(u64) + Send,
    ) -> Result<RecordSummary>
    where
        I: IntoIterator<Item = Result<ExtractedRecord>>,
        I::IntoIter: Send,
    {
        let now = Utc::now().timestamp_millis();
        let repo = self.repo;
        let context = self.context;
        let au_id = context.au_id.as_str();

        let plugin_seq = repo
            .find_or_create_plugin_tx(
                tx,
                plugin_id_of(au_id),
                context.platform.as_deref(),
                context.is_bulk_content,
            )
            .await?;
        let au_seq = repo.find_or_create_au_tx(tx, plugin_seq, au_key_of(au_id)).await?;
        let au_md_seq = repo.find_or_create_au_md_tx(tx, au_seq, now).await?;

        let mut items = 0u64;
        let mut provider_seq = None;
        for record in records {
            let record = normalize(record?);
            let seq = self.record_item_tx(tx, au_md_seq, &record).await?;
            if provider_seq.is_none() {
                provider_seq = Some(seq);
            }
            items += 1;
            on_item(items);
        }

        repo.update_extraction_tx(tx, au_md_seq, now, provider_seq)
            .await?;

        debug!(
            subsystem = "db",
            component = "recorder",
            op = "record",
            au_id,
            record_count = items,
            "Recorded AU metadata"
        );

        Ok(RecordSummary {
            au_md_seq,
            items,
            extract_time: now,
        })
    }

    /// Store one normalized item; returns the provider it was filed under.
    async fn record_item_tx(
        &mut self,
        tx: &mut Transaction<'_, Sqlite>,
        au_md_seq: i64,
        record: &ExtractedRecord,
    ) -> Result<i64> {
        let Some(access_url) = record.access_url.as_deref() else {
            return Err(Error::metadata(
                format!("no access URL for item in AU '{}'", self.context.au_id),
                record,
            ));
        };

        let publisher = self.publisher_name_tx(tx, record).await?;
        let publisher_seq = self.repo.find_or_create_publisher_tx(tx, &publisher).await?;
        let provider = record.provider.clone().unwrap_or_else(|| publisher.clone());
        let provider_seq = self
            .repo
            .find_or_create_provider_tx(tx, &provider, None)
            .await?;

        let title = self.publication_title(record);
        let publication_seq = self
            .repo
            .find_or_create_publication_tx(
                tx,
                publisher_seq,
                &title,
                record.publication_type.as_deref(),
            )
            .await?;

        if let Some(issn) = &record.issn {
            self.repo.add_issn_tx(tx, publication_seq, issn, PRINT).await?;
        }
        if let Some(eissn) = &record.eissn {
            self.repo.add_issn_tx(tx, publication_seq, eissn, ELECTRONIC).await?;
        }
        if let Some(isbn) = &record.isbn {
            self.repo.add_isbn_tx(tx, publication_seq, isbn, PRINT).await?;
        }
        if let Some(eisbn) = &record.eisbn {
            self.repo.add_isbn_tx(tx, publication_seq, eisbn, ELECTRONIC).await?;
        }
        let proprietary_id = record.proprietary_id.clone().or_else(|| {
            self.context
                .reference
                .as_ref()
                .and_then(|r| r.proprietary_id.clone())
        });
        if let Some(id) = fit(proprietary_id.as_deref(), MAX_PROPRIETARY_ID_COLUMN) {
            self.repo.add_proprietary_id_tx(tx, publication_seq, &id).await?;
        }

        let existing = self.repo.find_md_item_tx(tx, au_md_seq, access_url).await?;
        let md_item_seq: i64 = match existing {
            Some(md_item_seq) => {
                sqlx::query(
                    r#"
                    UPDATE md_item SET
                        publication_seq = ?, date = ?, article_title = ?, coverage = ?,
                        fetch_time = COALESCE(?, fetch_time)
                    WHERE md_item_seq = ?
                    "#,
                )
                .bind(publication_seq)
                .bind(&record.pub_date)
                .bind(&record.article_title)
                .bind(&record.coverage)
                .bind(record.fetch_time)
                .bind(md_item_seq)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
                self.repo.clear_md_item_details_tx(tx, md_item_seq).await?;
                md_item_seq
            }
            None => sqlx::query_scalar(
                r#"
                INSERT INTO md_item (publication_seq, au_md_seq, date, article_title, coverage, fetch_time)
                VALUES (?, ?, ?, ?, ?, ?)
                RETURNING md_item_seq
                "#,
            )
            .bind(publication_seq)
            .bind(au_md_seq)
            .bind(&record.pub_date)
            .bind(&record.article_title)
            .bind(&record.coverage)
            .bind(record.fetch_time)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::Database)?,
        };

        sqlx::query(
            r#"
            INSERT INTO bib_item (md_item_seq, volume, issue, start_page, end_page, item_no)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(md_item_seq)
        .bind(&record.volume)
        .bind(&record.issue)
        .bind(&record.start_page)
        .bind(&record.end_page)
        .bind(&record.item_number)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;

        for (idx, author) in record.author_set.iter().enumerate() {
            sqlx::query("INSERT INTO author (md_item_seq, author_name, author_idx) VALUES (?, ?, ?)")
                .bind(md_item_seq)
                .bind(author)
                .bind(idx as i64)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
        }

        for keyword in &record.keywords {
            sqlx::query("INSERT INTO keyword (md_item_seq, keyword) VALUES (?, ?)")
                .bind(md_item_seq)
                .bind(keyword)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
        }

        if let Some(doi) = &record.doi {
            sqlx::query("INSERT INTO doi (md_item_seq, doi) VALUES (?, ?)")
                .bind(md_item_seq)
                .bind(doi)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
        }

        let urls = std::iter::once((ACCESS_URL_FEATURE, access_url)).chain(
            record
                .featured_urls
                .iter()
                .map(|(feature, url)| (feature.as_str(), url.as_str())),
        );
        for (feature, url) in urls {
            sqlx::query("INSERT INTO url (md_item_seq, feature, url) VALUES (?, ?, ?)")
                .bind(md_item_seq)
                .bind(feature)
                .bind(url)
                .execute(&mut **tx)
                .await
                .map_err(Error::Database)?;
        }

        trace!(
            subsystem = "db",
            component = "recorder",
            op = "record_item",
            md_item_seq,
            access_url,
            replaced = existing.is_some(),
            "Recorded metadata item"
        );
        Ok(provider_seq)
    }

    /// Publisher from the record, then the reference catalog, else a
    /// synthesized name shared by the whole AU and reported as a problem.
    async fn publisher_name_tx(
        &mut self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &ExtractedRecord,
    ) -> Result<String> {
        if let Some(publisher) = &record.publisher {
            return Ok(publisher.clone());
        }
        if let Some(publisher) = self
            .context
            .reference
            .as_ref()
            .and_then(|r| fit(r.publisher.as_deref(), MAX_NAME_COLUMN))
        {
            return Ok(publisher);
        }
        if let Some(name) = &self.unknown_publisher {
            return Ok(name.clone());
        }

        let name = format!(
            "{UNKNOWN_PUBLISHER_PREFIX}{}",
            Utc::now().timestamp_millis()
        );
        warn!(
            subsystem = "db",
            component = "recorder",
            op = "record",
            au_id = %self.context.au_id,
            publisher = %name,
            "No publisher known for AU; using synthesized name"
        );
        self.repo
            .add_au_problem_tx(tx, &self.context.au_id, &name)
            .await?;
        self.unknown_publisher = Some(name.clone());
        Ok(name)
    }

    fn publication_title(&self, record: &ExtractedRecord) -> String {
        if let Some(title) = &record.publication_title {
            return title.clone();
        }
        let reference_title = self
            .context
            .reference
            .as_ref()
            .filter(|r| !r.bulk_content)
            .and_then(|r| fit(r.journal_title.as_deref(), MAX_NAME_COLUMN));
        reference_title.unwrap_or_else(|| {
            synthesize_unknown_title(
                record.isbn.as_deref(),
                record.eisbn.as_deref(),
                record.issn.as_deref(),
                record.eissn.as_deref(),
                record.journal_id.as_deref(),
                Utc::now().timestamp_millis(),
            )
        })
    }
}

/// Trim, normalize identifiers and fit every field to its column width.
pub fn normalize(mut record: ExtractedRecord) -> ExtractedRecord {
    let short = |v: &Option<String>| fit_logged("short", v, MAX_SHORT_COLUMN);

    record.publisher = fit_logged("publisher", &record.publisher, MAX_NAME_COLUMN);
    record.provider = fit_logged("provider", &record.provider, MAX_NAME_COLUMN);
    record.publication_title =
        fit_logged("publication_title", &record.publication_title, MAX_NAME_COLUMN);
    record.series_title = fit_logged("series_title", &record.series_title, MAX_NAME_COLUMN);
    record.article_title = fit_logged("article_title", &record.article_title, MAX_NAME_COLUMN);
    record.access_url = fit_logged("access_url", &record.access_url, MAX_URL_COLUMN);
    record.doi = record
        .doi
        .as_deref()
        .map(strip_doi_prefix)
        .and_then(|doi| fit(Some(doi), MAX_DOI_COLUMN));

    record.isbn = record.isbn.as_deref().and_then(to_unpunctuated_isbn);
    record.eisbn = record.eisbn.as_deref().and_then(to_unpunctuated_isbn);
    record.issn = record.issn.as_deref().and_then(to_unpunctuated_issn);
    record.eissn = record.eissn.as_deref().and_then(to_unpunctuated_issn);

    record.pub_date = short(&record.pub_date);
    record.volume = short(&record.volume);
    record.issue = short(&record.issue);
    record.start_page = short(&record.start_page);
    record.end_page = short(&record.end_page);
    record.item_number = short(&record.item_number);
    record.coverage = short(&record.coverage);

    record.author_set = record
        .author_set
        .iter()
        .filter_map(|a| fit(Some(a.as_str()), MAX_AUTHOR_COLUMN))
        .collect();
    record.keywords = record
        .keywords
        .iter()
        .filter_map(|k| fit(Some(k.as_str()), MAX_KEYWORD_COLUMN))
        .collect::<BTreeSet<_>>();
    record.featured_urls = record
        .featured_urls
        .iter()
        .filter_map(|(feature, url)| {
            Some((
                fit(Some(feature.as_str()), MAX_FEATURE_COLUMN)?,
                fit(Some(url.as_str()), MAX_URL_COLUMN)?,
            ))
        })
        .collect();
    record
}

fn fit_logged(field: &'static str, value: &Option<String>, max: usize) -> Option<String> {
    let fitted = fit(value.as_deref(), max);
    if let Some(v) = &fitted {
        if is_truncated(v) {
            warn!(
                subsystem = "db",
                component = "recorder",
                op = "normalize",
                field,
                max,
                "Metadata value too long; truncated"
            );
        }
    }
    fitted
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_normalize_identifiers_and_widths() {
        let record = ExtractedRecord {
            issn: Some("1234-567x".into()),
            eissn: Some("bogus".into()),
            isbn: Some("978-0-306-40615-7".into()),
            doi: Some("doi:10.1000/182".into()),
            volume: Some(" 12 ".into()),
            issue: Some("x".repeat(40)),
            author_set: vec!["a".repeat(200), "   ".into()],
            keywords: ["k".repeat(100)].into_iter().collect(),
            featured_urls: BTreeMap::from([("f".repeat(40), "http://x".to_string())]),
            ..Default::default()
        };

        let n = normalize(record);
        assert_eq!(n.issn.as_deref(), Some("1234567X"));
        assert_eq!(n.eissn, None);
        assert_eq!(n.isbn.as_deref(), Some("9780306406157"));
        assert_eq!(n.doi.as_deref(), Some("10.1000/182"));
        assert_eq!(n.volume.as_deref(), Some("12"));
        assert_eq!(n.issue.as_ref().map(|s| s.chars().count()), Some(16));
        assert_eq!(n.author_set.len(), 1);
        assert_eq!(n.author_set[0].chars().count(), MAX_AUTHOR_COLUMN);
        assert!(n.keywords.iter().all(|k| k.chars().count() == MAX_KEYWORD_COLUMN));
        assert!(n
            .featured_urls
            .keys()
            .all(|f| f.chars().count() == MAX_FEATURE_COLUMN));
    }
}
