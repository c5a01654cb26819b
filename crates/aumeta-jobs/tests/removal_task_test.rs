//! Integration tests for removal tasks.

use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};

use aumeta_db::defaults::FAILED_INDEX_PRIORITY;
use aumeta_db::test_fixtures::{record, TestDatabase};
use aumeta_db::{AuRecordingContext, Database, MetadataRecorder};
use aumeta_jobs::{RemovalTask, TaskDriver, TaskKind, TaskStatus};

const AU: &str = "org|test|Plugin&base_url~http%3A%2F%2Fexample.org%2F&volume~3";

async fn seed_items(db: &Database, count: usize) {
    let context = AuRecordingContext::new(AU);
    let mut tx = db.pool.begin().await.unwrap();
    MetadataRecorder::new(&db.metadata, &context)
        .record_tx(
            &mut tx,
            (1..=count).map(|n| Ok(record(&format!("http://x/{n}")))),
            |_| {},
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn test_removal_deletes_au_and_pending_entry() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    seed_items(db, 3).await;
    db.pending.add(AU, false).await.unwrap();

    let mut driver = TaskDriver::new(RemovalTask::new(AU, "Volume 3", db.clone()));
    assert_eq!(driver.control().kind(), TaskKind::Removal);

    let status = driver.run_to_completion(1).await.unwrap();
    assert_eq!(status, TaskStatus::Success);
    assert_eq!(driver.task().removed(), 3);

    assert!(db.metadata.find_au(AU).await.unwrap().is_none());
    assert_eq!(db.metadata.count_items(AU).await.unwrap(), 0);
    assert!(db.pending.get(AU).await.unwrap().is_none());
}

#[tokio::test]
async fn test_removal_of_unknown_au_succeeds() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;

    let mut driver = TaskDriver::new(RemovalTask::new(AU, "Volume 3", db.clone()));
    let status = driver.run_to_completion(1).await.unwrap();

    assert_eq!(status, TaskStatus::Success);
    assert_eq!(driver.task().removed(), 0);
}

#[tokio::test]
async fn test_cancel_aborts_blocked_removal_and_parks_au() {
    let test_db = TestDatabase::new().await;
    let db = test_db.db.clone();
    seed_items(&db, 2).await;
    db.pending.add(AU, false).await.unwrap();

    // The in-memory pool has a single connection; holding it blocks the task.
    let conn = db.pool.acquire().await.unwrap();

    let mut driver = TaskDriver::new(RemovalTask::new(AU, "Volume 3", db.clone()));
    let control = driver.control().clone();
    let started = Instant::now();
    let run = tokio::spawn(async move { driver.run_to_completion(1).await });

    sleep(Duration::from_millis(50)).await;
    assert!(control.cancel());
    assert!(!control.reschedule());
    // Released so FINISH can park the AU.
    drop(conn);

    let status = timeout(Duration::from_secs(2), run)
        .await
        .expect("removal did not stop after cancel")
        .unwrap()
        .unwrap();
    assert_eq!(status, TaskStatus::Failed);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(control.error().as_deref(), Some("cancelled"));

    assert_eq!(db.metadata.count_items(AU).await.unwrap(), 2);
    let parked = db.pending.get(AU).await.unwrap().unwrap();
    assert_eq!(parked.priority, FAILED_INDEX_PRIORITY);
}

#[tokio::test]
async fn test_finish_without_step_is_not_success() {
    let test_db = TestDatabase::new().await;
    let db = &test_db.db;
    seed_items(db, 1).await;

    let mut driver = TaskDriver::new(RemovalTask::new(AU, "Volume 3", db.clone()));
    driver.start().await.unwrap();
    driver.finish().await.unwrap();

    assert_eq!(driver.control().status(), TaskStatus::Failed);
    assert_eq!(db.metadata.count_items(AU).await.unwrap(), 1);
    let parked = db.pending.get(AU).await.unwrap().unwrap();
    assert_eq!(parked.priority, FAILED_INDEX_PRIORITY);
}
