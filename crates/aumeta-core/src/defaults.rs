//! Centralized default constants for aumeta.
//!
//! All crates reference these constants instead of defining their own magic
//! numbers. Organized by domain area.

// =============================================================================
// DATABASE
// =============================================================================

/// Default database URL when `DATABASE_URL` is not set.
pub const DATABASE_URL: &str = "sqlite://aumeta.db";

/// Default maximum pool connections.
pub const DB_MAX_CONNECTIONS: u32 = 5;

/// Number of times a transient database failure is retried.
pub const DB_MAX_RETRY_COUNT: usize = 10;

/// Delay between retries of a transient database failure.
pub const DB_RETRY_DELAY_MS: u64 = 3000;

/// SQLite busy timeout applied to each connection.
pub const DB_BUSY_TIMEOUT_MS: u64 = 5000;

/// Seconds to wait when acquiring a pooled connection.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// SCHEMA
// =============================================================================

/// Schema version this build of aumeta expects.
pub const TARGET_SCHEMA_VERSION: u32 = 27;

// =============================================================================
// INDEXING
// =============================================================================

/// Maximum number of reindexing tasks running at once.
pub const MAX_REINDEXING_TASKS: usize = 1;

/// Number of articles processed per `step` call.
pub const STEPS_PER_CALL: usize = 10;

/// Number of finished task snapshots kept for status surfaces.
pub const HISTORY_MAX: usize = 200;

/// Number of pending AUs read per admission query.
pub const PENDING_BATCH: i64 = 1000;

/// Interval between pending-queue scans when no task has finished.
pub const ADMISSION_POLL_INTERVAL_MS: u64 = 5000;

/// Capacity of the indexer event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default pending-queue priority.
pub const DEFAULT_INDEX_PRIORITY: i64 = 0;

/// Priority given to an AU whose last indexing attempt failed.
pub const FAILED_INDEX_PRIORITY: i64 = -1000;

/// AUs at or below this priority are never admitted.
pub const MIN_INDEX_PRIORITY: i64 = -10000;

// =============================================================================
// COLUMN WIDTHS
// =============================================================================

/// Publisher, provider, publication and article title names.
pub const MAX_NAME_COLUMN: usize = 512;

/// Single author name.
pub const MAX_AUTHOR_COLUMN: usize = 128;

/// Semicolon-joined author list on an extracted record.
pub const MAX_AUTHOR_LIST: usize = 512;

/// Keyword.
pub const MAX_KEYWORD_COLUMN: usize = 64;

/// DOI.
pub const MAX_DOI_COLUMN: usize = 256;

/// URL.
pub const MAX_URL_COLUMN: usize = 4096;

/// URL role ("feature") name.
pub const MAX_FEATURE_COLUMN: usize = 32;

/// Date, volume, issue, page, item number and coverage fields.
pub const MAX_SHORT_COLUMN: usize = 16;

/// Proprietary identifier.
pub const MAX_PROPRIETARY_ID_COLUMN: usize = 32;

/// Character replacing the final character of a truncated value.
pub const TRUNCATION_INDICATOR: char = '\u{19}';

// =============================================================================
// SYNTHESIZED NAMES
// =============================================================================

/// Prefix of the publisher name used when none is known.
pub const UNKNOWN_PUBLISHER_PREFIX: &str = "UNKNOWN_PUBLISHER_";

/// Prefix of the publication title used when none is known.
pub const UNKNOWN_TITLE_PREFIX: &str = "UNKNOWN_TITLE";
