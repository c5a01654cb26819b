//! Integration tests for the indexing manager.
//!
//! This test suite validates:
//! - Queued AUs are admitted, indexed and dequeued
//! - AUs that no longer resolve get a removal task
//! - AUs without an extractor are dropped from the queue
//! - Failed AUs are parked until re-queued
//! - Manager lifecycle (start/shutdown)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::Receiver;
use tokio::time::timeout;

use aumeta_db::defaults::FAILED_INDEX_PRIORITY;
use aumeta_db::test_fixtures::{record, TestDatabase};
use aumeta_db::{AuRecordingContext, Database, MetadataRecorder};
use aumeta_jobs::test_support::{Failure, FakeAu, FakeExtractor, StaticCatalog, StaticResolver};
use aumeta_jobs::{
    Error, IndexerConfig, IndexerEvent, IndexingManager, TaskKind, TaskSnapshot, TaskStatus,
};

const AU_A: &str = "org|test|Plugin&base_url~http%3A%2F%2Fa.example%2F";
const AU_B: &str = "org|test|Plugin&base_url~http%3A%2F%2Fb.example%2F";
const AU_GONE: &str = "org|test|Plugin&base_url~http%3A%2F%2Fgone.example%2F";
const AU_GONE_TOO: &str = "org|test|Plugin&base_url~http%3A%2F%2Fgone-too.example%2F";

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn manager(db: &Database, resolver: StaticResolver, spill_dir: &std::path::Path) -> IndexingManager {
    let config = IndexerConfig::default()
        .with_spill_dir(spill_dir)
        .with_steps_per_call(4)
        .with_poll_interval(50);
    IndexingManager::new(
        db.clone(),
        Arc::new(resolver),
        Arc::new(StaticCatalog::new()),
        config,
    )
}

/// Wait for `n` finished tasks.
async fn finished(events: &mut Receiver<IndexerEvent>, n: usize) -> Vec<TaskSnapshot> {
    let mut done = Vec::new();
    timeout(Duration::from_secs(10), async {
        while done.len() < n {
            match events.recv().await {
                Ok(IndexerEvent::TaskFinished(snapshot)) => done.push(snapshot),
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for tasks to finish");
    done
}

async fn seed_items(db: &Database, au_id: &str, count: usize) {
    let context = AuRecordingContext::new(au_id);
    let mut tx = db.pool.begin().await.unwrap();
    MetadataRecorder::new(&db.metadata, &context)
        .record_tx(
            &mut tx,
            (1..=count).map(|n| Ok(record(&format!("http://seed/{n}")))),
            |_| {},
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

// ============================================================================
// ADMISSION
// ============================================================================

#[tokio::test]
async fn test_queued_aus_are_indexed_one_at_a_time() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let spill = tempfile::tempdir().unwrap();
    db.pending.add(AU_A, false).await.unwrap();
    db.pending.add(AU_B, false).await.unwrap();

    let resolver = StaticResolver::new()
        .with_au(FakeAu::with_articles(AU_A, "AU A", 5), Some(Arc::new(FakeExtractor::new())))
        .with_au(FakeAu::with_articles(AU_B, "AU B", 7), Some(Arc::new(FakeExtractor::new())));
    let manager = manager(db, resolver, spill.path());
    let mut events = manager.events();
    let handle = manager.start().unwrap();

    let done = finished(&mut events, 2).await;
    let order: Vec<_> = done.iter().map(|s| s.au_id.as_str()).collect();
    assert_eq!(order, vec![AU_A, AU_B]);
    assert!(done.iter().all(|s| s.status == TaskStatus::Success));
    assert!(done.iter().all(|s| s.kind == TaskKind::Reindexing && s.is_new));

    assert_eq!(db.metadata.count_items(AU_A).await.unwrap(), 5);
    assert_eq!(db.metadata.count_items(AU_B).await.unwrap(), 7);
    assert_eq!(manager.pending_count().await.unwrap(), 0);
    assert!(manager.active_tasks().await.is_empty());

    let history = manager.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].au_id, AU_B, "history is most recent first");
    assert!(manager.failed_tasks().is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unresolvable_au_is_removed() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let spill = tempfile::tempdir().unwrap();
    seed_items(db, AU_GONE, 3).await;
    db.pending.add(AU_GONE, false).await.unwrap();

    let manager = manager(db, StaticResolver::new(), spill.path());
    let mut events = manager.events();
    let handle = manager.start().unwrap();

    let done = finished(&mut events, 1).await;
    assert_eq!(done[0].kind, TaskKind::Removal);
    assert_eq!(done[0].status, TaskStatus::Success);

    assert!(db.metadata.find_au(AU_GONE).await.unwrap().is_none());
    assert!(db.pending.get(AU_GONE).await.unwrap().is_none());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_removals_count_against_task_limit() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let spill = tempfile::tempdir().unwrap();
    db.pending.add(AU_GONE, false).await.unwrap();
    db.pending.add(AU_GONE_TOO, false).await.unwrap();

    let manager = IndexingManager::new(
        db.clone(),
        Arc::new(StaticResolver::new()),
        Arc::new(StaticCatalog::new()),
        IndexerConfig::default()
            .with_max_reindexing_tasks(1)
            .with_spill_dir(spill.path()),
    );

    assert_eq!(manager.admit().await.unwrap(), 1);
    let active = manager.active_tasks().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].kind, TaskKind::Removal);

    // The slot stays taken until the manager retires the finished task.
    assert_eq!(manager.admit().await.unwrap(), 0);
}

#[tokio::test]
async fn test_au_without_extractor_is_dropped() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let spill = tempfile::tempdir().unwrap();
    db.pending.add(AU_A, false).await.unwrap();

    let resolver = StaticResolver::new().with_au(FakeAu::with_articles(AU_A, "AU A", 2), None);
    let manager = manager(db, resolver, spill.path());

    assert_eq!(manager.admit().await.unwrap(), 0);
    assert!(db.pending.get(AU_A).await.unwrap().is_none());
}

#[tokio::test]
async fn test_disabled_manager_admits_nothing() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let spill = tempfile::tempdir().unwrap();
    db.pending.add(AU_A, false).await.unwrap();

    let resolver = StaticResolver::new()
        .with_au(FakeAu::with_articles(AU_A, "AU A", 2), Some(Arc::new(FakeExtractor::new())));
    let manager = IndexingManager::new(
        db.clone(),
        Arc::new(resolver),
        Arc::new(StaticCatalog::new()),
        IndexerConfig::default()
            .with_enabled(false)
            .with_spill_dir(spill.path()),
    );

    assert_eq!(manager.admit().await.unwrap(), 0);
    assert_eq!(manager.pending_count().await.unwrap(), 1);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_failed_au_is_parked_until_requeued() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let spill = tempfile::tempdir().unwrap();
    db.pending.add(AU_A, false).await.unwrap();

    let extractor = Arc::new(FakeExtractor::new().failing_at(2, Failure::Unexpected));
    let resolver = StaticResolver::new()
        .with_au(FakeAu::with_articles(AU_A, "AU A", 3), Some(extractor));
    let manager = manager(db, resolver, spill.path());
    let mut events = manager.events();
    let handle = manager.start().unwrap();

    let done = finished(&mut events, 1).await;
    assert_eq!(done[0].status, TaskStatus::Failed);
    assert_eq!(manager.failed_tasks().len(), 1);

    let parked = db.pending.get(AU_A).await.unwrap().unwrap();
    assert_eq!(parked.priority, FAILED_INDEX_PRIORITY);
    assert_eq!(manager.admit().await.unwrap(), 0);

    assert!(manager.queue_au(AU_A, false).await.unwrap());
    let done = finished(&mut events, 1).await;
    assert_eq!(done[0].au_id, AU_A);
    assert_eq!(done[0].status, TaskStatus::Failed);
    assert_eq!(manager.failed_tasks().len(), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_au_with_full_reindex() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    let spill = tempfile::tempdir().unwrap();
    seed_items(db, AU_A, 4).await;

    let resolver = StaticResolver::new()
        .with_au(FakeAu::with_articles(AU_A, "AU A", 2), Some(Arc::new(FakeExtractor::new())));
    let manager = manager(db, resolver, spill.path());
    let mut events = manager.events();
    let handle = manager.start().unwrap();

    assert!(manager.queue_au(AU_A, true).await.unwrap());
    let done = finished(&mut events, 1).await;
    assert_eq!(done[0].status, TaskStatus::Success);
    assert!(done[0].full_reindex);
    assert!(!done[0].is_new);

    assert_eq!(db.metadata.count_items(AU_A).await.unwrap(), 2);
    assert!(!db.metadata.needs_full_reindex(AU_A).await.unwrap());

    handle.shutdown().await.unwrap();
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_second_start_is_rejected() {
    let test_db = TestDatabase::new().await;
    let spill = tempfile::tempdir().unwrap();
    let manager = manager(&test_db.db, StaticResolver::new(), spill.path());

    let handle = manager.start().unwrap();
    assert!(matches!(manager.start(), Err(Error::InvalidState(_))));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_emits_stopped_event() {
    let test_db = TestDatabase::new().await;
    let spill = tempfile::tempdir().unwrap();
    let manager = manager(&test_db.db, StaticResolver::new(), spill.path());
    let mut events = manager.events();

    let handle = manager.start().unwrap();
    handle.shutdown().await.unwrap();

    let stopped = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(IndexerEvent::ManagerStopped) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await
    .expect("manager did not stop");
    assert!(stopped);
}

