//! Indexing manager: admits pending AUs and tracks their tasks.
//!
//! The manager owns the registry of active tasks. A task that finishes is
//! removed from the registry and the next pending AU is admitted inside the
//! same critical section, so the active count and the admission decision can
//! never disagree.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use aumeta_core::defaults::{
    DEFAULT_INDEX_PRIORITY, EVENT_CHANNEL_CAPACITY, FAILED_INDEX_PRIORITY,
};
use aumeta_core::{
    ArchivalUnit, ArticleMetadataExtractor, AuResolver, Error, PendingAu, ReferenceCatalog,
    Result, TaskKind, TaskStatus,
};
use aumeta_db::Database;

use crate::config::IndexerConfig;
use crate::reindex::ReindexingTask;
use crate::removal::RemovalTask;
use crate::task::{SchedulableTask, TaskDriver, TaskEvent, TaskHandle, TaskSnapshot};

/// Event emitted by the indexing manager.
#[derive(Debug, Clone)]
pub enum IndexerEvent {
    /// A task delivered START.
    TaskStarted { au_id: String, kind: TaskKind },
    /// A task finished and left the active registry.
    TaskFinished(TaskSnapshot),
    /// Manager loop started.
    ManagerStarted,
    /// Manager loop stopped.
    ManagerStopped,
}

/// Handle for controlling a running manager.
pub struct IndexerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<IndexerEvent>,
}

impl IndexerHandle {
    /// Signal the manager to stop. Active tasks are rescheduled.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for manager events.
    pub fn events(&self) -> broadcast::Receiver<IndexerEvent> {
        self.event_rx.resubscribe()
    }
}

struct Inner {
    db: Database,
    resolver: Arc<dyn AuResolver>,
    catalog: Arc<dyn ReferenceCatalog>,
    config: IndexerConfig,
    active: Mutex<HashMap<String, TaskHandle>>,
    history: StdMutex<VecDeque<TaskSnapshot>>,
    failed: StdMutex<VecDeque<TaskSnapshot>>,
    event_tx: broadcast::Sender<IndexerEvent>,
    done_tx: mpsc::UnboundedSender<TaskSnapshot>,
    done_rx: StdMutex<Option<mpsc::UnboundedReceiver<TaskSnapshot>>>,
}

/// Schedules reindexing and removal tasks for the AUs in the pending queue.
#[derive(Clone)]
pub struct IndexingManager {
    inner: Arc<Inner>,
}

impl IndexingManager {
    pub fn new(
        db: Database,
        resolver: Arc<dyn AuResolver>,
        catalog: Arc<dyn ReferenceCatalog>,
        config: IndexerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                db,
                resolver,
                catalog,
                config,
                active: Mutex::new(HashMap::new()),
                history: StdMutex::new(VecDeque::new()),
                failed: StdMutex::new(VecDeque::new()),
                event_tx,
                done_tx,
                done_rx: StdMutex::new(Some(done_rx)),
            }),
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.inner.config
    }

    /// Get a receiver for manager events.
    pub fn events(&self) -> broadcast::Receiver<IndexerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Start the manager loop and return a handle for control.
    ///
    /// Fails if the manager was already started.
    pub fn start(&self) -> Result<IndexerHandle> {
        let done_rx = self
            .inner
            .done_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::InvalidState("indexing manager already started".into()))?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let event_rx = self.inner.event_tx.subscribe();

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(done_rx, shutdown_rx).await;
        });

        Ok(IndexerHandle {
            shutdown_tx,
            event_rx,
        })
    }

    #[instrument(skip_all)]
    async fn run(
        self,
        mut done_rx: mpsc::UnboundedReceiver<TaskSnapshot>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let config = &self.inner.config;
        info!(
            subsystem = "jobs",
            component = "manager",
            enabled = config.enabled,
            max_reindexing_tasks = config.max_reindexing_tasks,
            "Indexing manager started"
        );
        let _ = self.inner.event_tx.send(IndexerEvent::ManagerStarted);

        let poll_interval = Duration::from_millis(config.poll_interval_ms);
        if let Err(e) = self.admit().await {
            error!(error = %e, "Failed to admit pending AUs");
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Indexing manager received shutdown signal");
                    break;
                }
                Some(snapshot) = done_rx.recv() => {
                    self.complete(snapshot).await;
                }
                _ = sleep(poll_interval) => {
                    if let Err(e) = self.admit().await {
                        error!(error = %e, "Failed to admit pending AUs");
                    }
                }
            }
        }

        self.stop_all().await;
        let _ = self.inner.event_tx.send(IndexerEvent::ManagerStopped);
        info!("Indexing manager stopped");
    }

    /// Admit pending AUs until the task limit is reached.
    ///
    /// Entries below the default priority (AUs whose indexing failed) stay
    /// parked until re-queued with [`queue_au`](Self::queue_au). Returns the
    /// number of tasks started.
    pub async fn admit(&self) -> Result<usize> {
        let mut active = self.inner.active.lock().await;
        self.admit_locked(&mut active).await
    }

    async fn admit_locked(&self, active: &mut HashMap<String, TaskHandle>) -> Result<usize> {
        let inner = &self.inner;
        let config = &inner.config;
        if !config.enabled {
            return Ok(0);
        }

        // Removals share the limit with reindexing tasks.
        let mut running = active.len();
        if running >= config.max_reindexing_tasks {
            return Ok(0);
        }

        let pending = inner
            .db
            .pending
            .list_prioritized(config.pending_batch, config.prioritize_new_aus)
            .await?;

        let mut started = 0;
        for entry in pending {
            if running >= config.max_reindexing_tasks {
                break;
            }
            if entry.priority < DEFAULT_INDEX_PRIORITY || active.contains_key(&entry.au_id) {
                continue;
            }

            let Some(au) = inner.resolver.resolve(&entry.au_id) else {
                debug!(au_id = %entry.au_id, "Pending AU no longer exists, removing its metadata");
                let task = RemovalTask::new(entry.au_id.clone(), entry.au_id.clone(), inner.db.clone());
                active.insert(entry.au_id.clone(), self.launch(task));
                running += 1;
                started += 1;
                continue;
            };

            let Some(extractor) = inner.resolver.extractor_for(au.as_ref()) else {
                debug!(au_id = %entry.au_id, "AU has no metadata extractor, dropping from pending");
                inner.db.pending.remove(&entry.au_id).await?;
                continue;
            };

            let task = self.reindexing_task(&entry, au, extractor).await?;
            active.insert(entry.au_id.clone(), self.launch(task));
            running += 1;
            started += 1;
        }

        if started > 0 {
            debug!(
                subsystem = "jobs",
                component = "manager",
                op = "admit",
                started,
                active = active.len(),
                "Admitted pending AUs"
            );
        }
        Ok(started)
    }

    async fn reindexing_task(
        &self,
        entry: &PendingAu,
        au: Arc<dyn ArchivalUnit>,
        extractor: Arc<dyn ArticleMetadataExtractor>,
    ) -> Result<ReindexingTask> {
        let inner = &self.inner;
        let row = inner.db.metadata.find_au(&entry.au_id).await?;
        let is_new = row.as_ref().map_or(true, |r| r.au_md_seq.is_none());
        let full_reindex = entry.full_reindex || row.as_ref().is_some_and(|r| r.full_reindex);
        let last_extract_time = row.and_then(|r| r.extract_time);

        Ok(ReindexingTask::builder(au, extractor, inner.db.clone())
            .reference(inner.catalog.lookup(&entry.au_id))
            .new_au(is_new)
            .full_reindex(full_reindex)
            .last_extract_time(last_extract_time)
            .spill_dir(inner.config.spill_dir.clone())
            .build())
    }

    /// Run `task` to completion on its own tokio task.
    fn launch<T: SchedulableTask + 'static>(&self, task: T) -> TaskHandle {
        let handle = Arc::clone(task.control());
        let event_tx = self.inner.event_tx.clone();
        let done_tx = self.inner.done_tx.clone();
        let steps = self.inner.config.steps_per_call;

        let mut driver = TaskDriver::new(task).with_listener(move |event, control| match event {
            TaskEvent::Start => {
                let _ = event_tx.send(IndexerEvent::TaskStarted {
                    au_id: control.au_id().to_string(),
                    kind: control.kind(),
                });
            }
            TaskEvent::Finish => {
                let _ = done_tx.send(control.snapshot());
            }
        });

        tokio::spawn(async move {
            if let Err(e) = driver.run_to_completion(steps).await {
                error!(au_id = %driver.control().au_id(), error = %e, "Task driver failed");
            }
        });
        handle
    }

    /// Retire a finished task and admit the next pending AU.
    async fn complete(&self, snapshot: TaskSnapshot) {
        let mut active = self.inner.active.lock().await;
        active.remove(&snapshot.au_id);
        self.remember(snapshot.clone());
        let _ = self.inner.event_tx.send(IndexerEvent::TaskFinished(snapshot));

        if let Err(e) = self.admit_locked(&mut active).await {
            warn!(error = %e, "Failed to admit pending AUs after task completion");
        }
    }

    fn remember(&self, snapshot: TaskSnapshot) {
        let max = self.inner.config.history_max;
        if snapshot.status != TaskStatus::Success {
            let mut failed = self.inner.failed.lock().unwrap_or_else(|e| e.into_inner());
            failed.push_front(snapshot.clone());
            failed.truncate(max);
        }
        let mut history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_front(snapshot);
        history.truncate(max);
    }

    /// Reschedule every active reindexing task; used when the manager stops.
    ///
    /// Removal tasks are left to finish their single transaction.
    async fn stop_all(&self) {
        let mut active = self.inner.active.lock().await;
        debug!(count = active.len(), "Stopping active tasks");
        for handle in active.values() {
            if handle.kind() == TaskKind::Reindexing {
                handle.reschedule();
            }
        }
        active.clear();
    }

    /// Cancel the active task of an AU. Returns false if none is active.
    pub async fn cancel_task(&self, au_id: &str) -> bool {
        let active = self.inner.active.lock().await;
        match active.get(au_id) {
            Some(handle) => handle.cancel(),
            None => false,
        }
    }

    /// Queue an AU and try to admit it right away.
    ///
    /// An AU parked after a failed task gets its normal priority back. With
    /// `full_reindex` the AU's recorded items are replaced on the next run.
    /// Returns true if the AU was not admissible before.
    pub async fn queue_au(&self, au_id: &str, full_reindex: bool) -> Result<bool> {
        let db = &self.inner.db;
        let parked = db
            .pending
            .get(au_id)
            .await?
            .is_some_and(|p| p.priority == FAILED_INDEX_PRIORITY);

        let mut tx = db.begin().await?;
        if parked {
            db.pending
                .set_priority_tx(&mut tx, au_id, DEFAULT_INDEX_PRIORITY)
                .await?;
        }
        let added = db.pending.add_tx(&mut tx, au_id, full_reindex).await?;
        if full_reindex {
            db.metadata.set_full_reindex_tx(&mut tx, au_id, true).await?;
        }
        tx.commit().await?;

        self.admit().await?;
        Ok(added || parked)
    }

    /// Snapshots of the tasks currently active.
    pub async fn active_tasks(&self) -> Vec<TaskSnapshot> {
        let active = self.inner.active.lock().await;
        active.values().map(|h| h.snapshot()).collect()
    }

    /// Finished tasks, most recent first.
    pub fn history(&self) -> Vec<TaskSnapshot> {
        let history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }

    /// Finished tasks that did not succeed, most recent first.
    pub fn failed_tasks(&self) -> Vec<TaskSnapshot> {
        let failed = self.inner.failed.lock().unwrap_or_else(|e| e.into_inner());
        failed.iter().cloned().collect()
    }

    pub async fn pending_count(&self) -> Result<i64> {
        self.inner.db.pending.count().await
    }
}
