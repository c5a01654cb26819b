//! Test fixtures for database tests.
//!
//! Every [`TestDatabase`] is a private in-memory SQLite store brought to the
//! latest schema, so tests need no external server and never share state.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use aumeta_db::test_fixtures::TestDatabase;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let test_db = TestDatabase::new().await;
//!     test_db.db.pending.add("p&k", false).await.unwrap();
//! }
//! ```

use std::time::Duration;

use crate::{Database, DbConfig, ExtractedRecord, RetryPolicy};

/// URL of a private in-memory store.
pub const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

/// Schema-ready in-memory database.
pub struct TestDatabase {
    pub db: Database,
}

impl TestDatabase {
    /// Create an in-memory database at the latest schema version.
    ///
    /// # Panics
    ///
    /// Panics if the store cannot be opened.
    pub async fn new() -> Self {
        let config = DbConfig::new(MEMORY_DATABASE_URL)
            .with_acquire_timeout(Duration::from_secs(5))
            .with_retry(RetryPolicy::new(1, Duration::from_millis(10)));
        let db = Database::open(&config)
            .await
            .expect("failed to open in-memory test database");
        Self { db }
    }
}

/// A minimal recordable article with the given access URL.
pub fn record(access_url: &str) -> ExtractedRecord {
    ExtractedRecord {
        publisher: Some("Test Publisher".to_string()),
        publication_title: Some("Journal of Tests".to_string()),
        article_title: Some(format!("Article at {access_url}")),
        access_url: Some(access_url.to_string()),
        ..Default::default()
    }
}
