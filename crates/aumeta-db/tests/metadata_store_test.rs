//! Integration tests for the metadata store.
//!
//! Covers recording, removal, the pending queue and schema persistence
//! across reopen of an on-disk store.

use std::time::Duration;

use aumeta_db::defaults::{FAILED_INDEX_PRIORITY, MIN_INDEX_PRIORITY, TARGET_SCHEMA_VERSION};
use aumeta_db::test_fixtures::{record, TestDatabase};
use aumeta_db::{
    AuRecordingContext, Database, DbConfig, Error, MetadataRecorder, ReferenceRecord, RetryPolicy,
};

const AU: &str = "org|test|Plugin&base_url~http%3A%2F%2Fexample.org%2F&volume~1";

async fn record_items(db: &Database, context: &AuRecordingContext, urls: &[&str]) -> u64 {
    let mut tx = db.pool.begin().await.unwrap();
    let records: Vec<aumeta_db::Result<_>> = urls.iter().map(|u| Ok(record(u))).collect();
    let summary = MetadataRecorder::new(&db.metadata, context)
        .record_tx(&mut tx, records, |_| {})
        .await
        .unwrap();
    tx.commit().await.unwrap();
    summary.items
}

#[tokio::test]
async fn test_record_and_count_items() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let context = AuRecordingContext::new(AU);

    let mut seen = Vec::new();
    let mut tx = db.pool.begin().await.unwrap();
    let summary = MetadataRecorder::new(&db.metadata, &context)
        .record_tx(
            &mut tx,
            vec![Ok(record("http://x/1")), Ok(record("http://x/2"))],
            |n| seen.push(n),
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(summary.items, 2);
    assert_eq!(seen, vec![1, 2]);
    assert_eq!(db.metadata.count_items(AU).await.unwrap(), 2);

    let au = db.metadata.find_au(AU).await.unwrap().unwrap();
    assert_eq!(au.extract_time, Some(summary.extract_time));
    assert!(!au.full_reindex);
}

#[tokio::test]
async fn test_empty_recording_stamps_watermark() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;

    assert_eq!(db.metadata.get_extraction_time(AU).await.unwrap(), None);
    record_items(db, &AuRecordingContext::new(AU), &[]).await;
    assert!(db.metadata.get_extraction_time(AU).await.unwrap().is_some());
}

#[tokio::test]
async fn test_missing_access_url_is_metadata_error_and_rolls_back() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let context = AuRecordingContext::new(AU);

    let mut bad = record("http://x/2");
    bad.access_url = None;

    let mut tx = db.pool.begin().await.unwrap();
    let err = MetadataRecorder::new(&db.metadata, &context)
        .record_tx(&mut tx, vec![Ok(record("http://x/1")), Ok(bad)], |_| {})
        .await
        .unwrap_err();
    tx.rollback().await.unwrap();

    assert!(matches!(err, Error::Metadata { record: Some(_), .. }));
    assert_eq!(db.metadata.count_items(AU).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_publisher_is_synthesized_once_and_reported() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let context = AuRecordingContext::new(AU);

    let mut first = record("http://x/1");
    first.publisher = None;
    let mut second = record("http://x/2");
    second.publisher = None;

    let mut tx = db.pool.begin().await.unwrap();
    MetadataRecorder::new(&db.metadata, &context)
        .record_tx(&mut tx, vec![Ok(first), Ok(second)], |_| {})
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let problems = db.metadata.list_au_problems(AU).await.unwrap();
    assert_eq!(problems.len(), 1);
    assert!(problems[0].starts_with("UNKNOWN_PUBLISHER_"));

    let publishers: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM publisher WHERE publisher_name LIKE 'UNKNOWN_PUBLISHER_%'",
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(publishers, 1);
}

#[tokio::test]
async fn test_reference_publisher_used_when_record_has_none() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let context = AuRecordingContext::new(AU).with_reference(Some(ReferenceRecord {
        publisher: Some("Reference Press".into()),
        ..Default::default()
    }));

    let mut item = record("http://x/1");
    item.publisher = None;
    let mut tx = db.pool.begin().await.unwrap();
    MetadataRecorder::new(&db.metadata, &context)
        .record_tx(&mut tx, vec![Ok(item)], |_| {})
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let name: String = sqlx::query_scalar("SELECT publisher_name FROM publisher")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(name, "Reference Press");
    assert!(db.metadata.list_au_problems(AU).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_items_returns_count_and_cascades() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    record_items(db, &AuRecordingContext::new(AU), &["http://x/1", "http://x/2", "http://x/3"])
        .await;

    let mut tx = db.pool.begin().await.unwrap();
    let removed = db.metadata.remove_au_metadata_items_tx(&mut tx, AU).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(removed, 3);
    assert_eq!(db.metadata.count_items(AU).await.unwrap(), 0);
    let urls: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM url")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(urls, 0);
    // The AU itself survives.
    assert!(db.metadata.find_au(AU).await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_au_removes_everything() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    record_items(db, &AuRecordingContext::new(AU), &["http://x/1"]).await;

    let mut tx = db.pool.begin().await.unwrap();
    let removed = db.metadata.delete_au_tx(&mut tx, AU).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(removed, 1);
    assert!(db.metadata.find_au(AU).await.unwrap().is_none());
}

#[tokio::test]
async fn test_pending_queue_order_and_priorities() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;

    // "old" has been indexed before; "new" has not.
    record_items(db, &AuRecordingContext::new("p&old"), &[]).await;
    db.pending.add("p&old", false).await.unwrap();
    db.pending.add("p&new", false).await.unwrap();
    db.pending.add("p&failed", false).await.unwrap();
    db.pending.add("p&never", false).await.unwrap();

    let mut tx = db.pool.begin().await.unwrap();
    db.pending.remove_tx(&mut tx, "p&failed").await.unwrap();
    db.pending.add_failed_tx(&mut tx, "p&failed").await.unwrap();
    db.pending
        .set_priority_tx(&mut tx, "p&never", MIN_INDEX_PRIORITY)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let fifo: Vec<String> = db
        .pending
        .list_prioritized(10, false)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.au_id)
        .collect();
    assert_eq!(fifo, vec!["p&old", "p&new", "p&failed"]);

    let new_first = db.pending.list_prioritized(10, true).await.unwrap();
    assert_eq!(new_first[0].au_id, "p&new");
    assert!(new_first[0].is_new);
    assert!(!new_first[1].is_new);
    assert_eq!(new_first[2].priority, FAILED_INDEX_PRIORITY);

    assert_eq!(db.pending.count().await.unwrap(), 4);
}

#[tokio::test]
async fn test_add_if_not_there_keeps_position() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;

    assert!(db.pending.add("p&a", false).await.unwrap());
    assert!(db.pending.add("p&b", false).await.unwrap());
    assert!(!db.pending.add("p&a", true).await.unwrap());

    let queued = db.pending.list_prioritized(10, false).await.unwrap();
    assert_eq!(queued[0].au_id, "p&a");
    assert!(queued[0].full_reindex);
}

#[tokio::test]
async fn test_mark_full_reindex() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    record_items(db, &AuRecordingContext::new(AU), &["http://x/1"]).await;

    db.mark_full_reindex(AU).await.unwrap();

    assert!(db.metadata.needs_full_reindex(AU).await.unwrap());
    let pending = db.pending.get(AU).await.unwrap().unwrap();
    assert!(pending.full_reindex);

    // Recording clears the flag.
    record_items(db, &AuRecordingContext::new(AU), &[]).await;
    assert!(!db.metadata.needs_full_reindex(AU).await.unwrap());
}

#[tokio::test]
async fn test_on_disk_store_keeps_schema_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("aumeta.db").display());
    let config = DbConfig::new(url).with_skip_async_upgrades(true);

    let db = Database::open(&config).await.unwrap();
    assert_eq!(
        db.schema().pending_deferred().await.unwrap(),
        vec![10, 15, 17, 20]
    );
    db.pool.close().await;

    let reopened = Database::open(&config).await.unwrap();
    let engine = reopened.schema();
    assert_eq!(engine.current_version().await.unwrap(), TARGET_SCHEMA_VERSION);
    assert_eq!(engine.run_deferred().await.unwrap(), vec![10, 15, 17, 20]);
    assert!(engine.pending_deferred().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rerecording_access_url_updates_existing_item() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let context = AuRecordingContext::new(AU);
    record_items(db, &context, &["http://x/1", "http://x/2"]).await;

    let mut revised = record("http://x/1");
    revised.article_title = Some("Revised title".to_string());
    let mut tx = db.begin().await.unwrap();
    MetadataRecorder::new(&db.metadata, &context)
        .record_tx(&mut tx, vec![Ok(revised), Ok(record("http://x/3"))], |_| {})
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(db.metadata.count_items(AU).await.unwrap(), 3);
    let titles: Vec<String> = sqlx::query_scalar(
        "SELECT article_title FROM md_item ORDER BY md_item_seq",
    )
    .fetch_all(&db.pool)
    .await
    .unwrap();
    assert_eq!(titles[0], "Revised title");

    let access_urls: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM url WHERE url = 'http://x/1'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
    assert_eq!(access_urls, 1);
}

#[tokio::test]
async fn test_begin_retries_while_pool_is_exhausted() {
    let config = DbConfig::new("sqlite::memory:")
        .with_acquire_timeout(Duration::from_millis(50))
        .with_retry(RetryPolicy::new(10, Duration::from_millis(20)));
    let db = Database::open(&config).await.unwrap();

    let held = db.pool.acquire().await.unwrap();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(held);
    });

    let tx = db.begin().await.unwrap();
    tx.rollback().await.unwrap();
    release.await.unwrap();
}

#[tokio::test]
async fn test_begin_without_retry_gives_up() {
    let config = DbConfig::new("sqlite::memory:")
        .with_acquire_timeout(Duration::from_millis(50))
        .with_retry(RetryPolicy::none());
    let db = Database::open(&config).await.unwrap();

    let _held = db.pool.acquire().await.unwrap();
    let err = db.begin().await.unwrap_err();
    assert!(err.is_transient());
}
