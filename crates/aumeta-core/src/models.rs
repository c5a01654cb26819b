//! Domain types shared across aumeta crates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::defaults::{MAX_AUTHOR_LIST, MAX_NAME_COLUMN};

// =============================================================================
// ARCHIVAL UNIT IDENTITY
// =============================================================================

/// Identifier of the plugin portion of an AU id (everything before `&`).
pub fn plugin_id_of(au_id: &str) -> &str {
    au_id.split_once('&').map(|(plugin, _)| plugin).unwrap_or(au_id)
}

/// Key portion of an AU id (everything after the first `&`).
pub fn au_key_of(au_id: &str) -> &str {
    au_id.split_once('&').map(|(_, key)| key).unwrap_or("")
}

// =============================================================================
// EXTRACTION INPUT
// =============================================================================

/// One content item of an AU handed to an extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleFiles {
    /// URL of the article's full text.
    pub full_text_url: String,
    /// Role name to URL for the article's other files (abstract, pdf, ...).
    pub role_map: BTreeMap<String, String>,
    /// Fetch time in epoch millis of each URL belonging to the article.
    pub fetch_times: BTreeMap<String, i64>,
}

impl ArticleFiles {
    pub fn new(full_text_url: impl Into<String>) -> Self {
        Self {
            full_text_url: full_text_url.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>, url: impl Into<String>) -> Self {
        self.role_map.insert(role.into(), url.into());
        self
    }

    pub fn with_fetch_time(mut self, url: impl Into<String>, millis: i64) -> Self {
        self.fetch_times.insert(url.into(), millis);
        self
    }

    /// Earliest fetch time among the article's URLs, if any is known.
    pub fn earliest_fetch_time(&self) -> Option<i64> {
        self.fetch_times.values().copied().min()
    }

    /// Latest fetch time among the article's URLs, if any is known.
    pub fn latest_fetch_time(&self) -> Option<i64> {
        self.fetch_times.values().copied().max()
    }
}

/// Restricts which content of an AU an extractor visits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataTarget {
    /// Skip articles whose files were all fetched at or before this epoch
    /// millis watermark. `None` visits everything.
    pub include_files_changed_after: Option<i64>,
}

impl MetadataTarget {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn changed_after(watermark: i64) -> Self {
        Self {
            include_files_changed_after: Some(watermark),
        }
    }

    /// Whether an article passes the watermark.
    pub fn includes(&self, article: &ArticleFiles) -> bool {
        match self.include_files_changed_after {
            None => true,
            Some(cutoff) => article
                .latest_fetch_time()
                .map(|fetched| fetched > cutoff)
                .unwrap_or(true),
        }
    }
}

/// Raw metadata fields pushed by an extractor for one article.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetadata {
    pub publisher: Option<String>,
    pub provider: Option<String>,
    pub publication_title: Option<String>,
    pub series_title: Option<String>,
    pub isbn: Option<String>,
    pub eisbn: Option<String>,
    pub issn: Option<String>,
    pub eissn: Option<String>,
    pub journal_id: Option<String>,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub start_page: Option<String>,
    pub end_page: Option<String>,
    pub date: Option<String>,
    pub article_title: Option<String>,
    pub authors: Vec<String>,
    pub doi: Option<String>,
    pub access_url: Option<String>,
    pub keywords: Vec<String>,
    pub coverage: Option<String>,
    pub item_number: Option<String>,
    pub proprietary_identifier: Option<String>,
    pub publication_type: Option<String>,
}

// =============================================================================
// EXTRACTED RECORD
// =============================================================================

/// One article's metadata as buffered and recorded.
///
/// Built once from [`RawMetadata`] and enriched with article context before
/// it enters the spill buffer; not modified afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub publisher: Option<String>,
    pub provider: Option<String>,
    pub publication_title: Option<String>,
    pub series_title: Option<String>,
    pub isbn: Option<String>,
    pub eisbn: Option<String>,
    pub issn: Option<String>,
    pub eissn: Option<String>,
    pub journal_id: Option<String>,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub start_page: Option<String>,
    pub end_page: Option<String>,
    pub pub_date: Option<String>,
    pub pub_year: Option<String>,
    pub article_title: Option<String>,
    /// Semicolon-joined author list, bounded by the author list width.
    pub authors: Option<String>,
    /// Every author reported by the extractor, in order, without duplicates.
    pub author_set: Vec<String>,
    pub doi: Option<String>,
    pub access_url: Option<String>,
    /// Role name to URL ("featured URL map").
    pub featured_urls: BTreeMap<String, String>,
    pub keywords: BTreeSet<String>,
    pub coverage: Option<String>,
    pub item_number: Option<String>,
    pub proprietary_id: Option<String>,
    pub publication_type: Option<String>,
    /// Earliest fetch time in epoch millis of the article's files.
    pub fetch_time: Option<i64>,
}

impl ExtractedRecord {
    pub fn from_raw(raw: RawMetadata) -> Self {
        let authors = join_authors(&raw.authors);
        let mut author_set: Vec<String> = Vec::with_capacity(raw.authors.len());
        for author in raw.authors {
            if !author_set.contains(&author) {
                author_set.push(author);
            }
        }
        let pub_year = raw.date.as_deref().and_then(year_of);

        Self {
            publisher: raw.publisher,
            provider: raw.provider,
            publication_title: raw.publication_title,
            series_title: raw.series_title,
            isbn: raw.isbn,
            eisbn: raw.eisbn,
            issn: raw.issn,
            eissn: raw.eissn,
            journal_id: raw.journal_id,
            volume: raw.volume,
            issue: raw.issue,
            start_page: raw.start_page,
            end_page: raw.end_page,
            pub_date: raw.date,
            pub_year,
            article_title: raw.article_title.map(|t| hard_truncate(&t, MAX_NAME_COLUMN)),
            authors,
            author_set,
            doi: raw.doi,
            access_url: raw.access_url,
            featured_urls: BTreeMap::new(),
            keywords: raw.keywords.into_iter().collect(),
            coverage: raw.coverage,
            item_number: raw.item_number,
            proprietary_id: raw.proprietary_identifier,
            publication_type: raw.publication_type,
            fetch_time: None,
        }
    }

    /// Fill in what the extractor does not report from the article it came from.
    pub fn with_article_context(mut self, article: &ArticleFiles) -> Self {
        if self.access_url.is_none() && !article.full_text_url.is_empty() {
            self.access_url = Some(article.full_text_url.clone());
        }
        if self.featured_urls.is_empty() {
            self.featured_urls = article.role_map.clone();
        }
        if self.fetch_time.is_none() {
            self.fetch_time = article.earliest_fetch_time();
        }
        self
    }

    /// Whether this record describes part of a book rather than a serial.
    pub fn is_book(&self) -> bool {
        self.isbn.is_some() || self.eisbn.is_some()
    }
}

/// First `max` characters of `value`.
fn hard_truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Join authors with `;` into at most [`MAX_AUTHOR_LIST`] characters.
///
/// A first author longer than the budget is cut to the budget and nothing
/// else is added. Later authors are added while they fit; the first that does
/// not fit ends the list.
fn join_authors(authors: &[String]) -> Option<String> {
    let mut iter = authors.iter();
    let first = iter.next()?;
    let first_len = first.chars().count();
    if first_len > MAX_AUTHOR_LIST {
        return Some(hard_truncate(first, MAX_AUTHOR_LIST));
    }

    let mut joined = first.clone();
    let mut len = first_len;
    for author in iter {
        let author_len = author.chars().count();
        if len + 1 + author_len > MAX_AUTHOR_LIST {
            break;
        }
        joined.push(';');
        joined.push_str(author);
        len += 1 + author_len;
    }
    Some(joined)
}

/// Four-digit year at the start of a publication date.
fn year_of(date: &str) -> Option<String> {
    let year: String = date.trim().chars().take(4).collect();
    if year.len() == 4 && year.chars().all(|c| c.is_ascii_digit()) {
        Some(year)
    } else {
        None
    }
}

// =============================================================================
// REFERENCE CATALOG
// =============================================================================

/// Trusted bibliographic data for an AU from the reference catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub publisher: Option<String>,
    pub journal_title: Option<String>,
    pub isbn: Option<String>,
    pub print_issn: Option<String>,
    pub eissn: Option<String>,
    /// Coverage years as a comma-separated list of years or `start-end` ranges.
    pub year: Option<String>,
    pub proprietary_id: Option<String>,
    /// Bulk-content AUs carry a placeholder title rather than a real one.
    pub bulk_content: bool,
}

impl ReferenceRecord {
    /// Whether `year` falls within the coverage described by `self.year`.
    ///
    /// Unparseable coverage entries never match.
    pub fn includes_year(&self, year: &str) -> bool {
        let Some(coverage) = self.year.as_deref() else {
            return false;
        };
        let Ok(target) = year.trim().parse::<i32>() else {
            return false;
        };
        coverage.split(',').map(str::trim).any(|range| {
            match range.split_once('-') {
                Some((start, end)) => match (start.trim().parse::<i32>(), end.trim().parse::<i32>()) {
                    (Ok(start), Ok(end)) => (start..=end).contains(&target),
                    _ => false,
                },
                None => range.parse::<i32>().map(|y| y == target).unwrap_or(false),
            }
        })
    }
}

// =============================================================================
// TASK STATE
// =============================================================================

/// Status of a reindexing or removal task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TaskStatus {
    Running = 0,
    Success = 1,
    Failed = 2,
    Rescheduled = 3,
}

impl TaskStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TaskStatus::Running),
            1 => Some(TaskStatus::Success),
            2 => Some(TaskStatus::Failed),
            3 => Some(TaskStatus::Rescheduled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Rescheduled => "rescheduled",
        };
        f.write_str(s)
    }
}

/// Kind of work a task performs on an AU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Reindexing,
    Removal,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Reindexing => f.write_str("reindexing"),
            TaskKind::Removal => f.write_str("removal"),
        }
    }
}

// =============================================================================
// PENDING WORK
// =============================================================================

/// An AU waiting in the pending queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAu {
    pub au_id: String,
    pub priority: i64,
    pub full_reindex: bool,
    /// Whether the AU has never been indexed before.
    pub is_new: bool,
}
