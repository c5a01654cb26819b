//! Removal task: deletes everything recorded for an AU.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use aumeta_core::{Error, Result, TaskKind, TaskStatus};
use aumeta_db::Database;

use crate::task::{SchedulableTask, TaskControl, TaskHandle};

/// Deletes an AU's recorded metadata and its pending entry.
///
/// The whole deletion happens in the first step. Cancelling the task aborts a
/// deletion still in flight and rolls it back. A failed removal leaves the AU
/// parked in the pending queue until it is queued again.
pub struct RemovalTask {
    control: TaskHandle,
    db: Database,
    removed: u64,
}

impl RemovalTask {
    pub fn new(au_id: impl Into<String>, au_name: impl Into<String>, db: Database) -> Self {
        Self {
            control: Arc::new(TaskControl::new(TaskKind::Removal, au_id, au_name)),
            db,
            removed: 0,
        }
    }

    /// Metadata items deleted, once the task succeeded.
    pub fn removed(&self) -> u64 {
        self.removed
    }
}

async fn delete_au(db: &Database, au_id: &str) -> Result<u64> {
    let mut tx = db.begin().await?;
    let removed = db.metadata.delete_au_tx(&mut tx, au_id).await?;
    db.pending.remove_tx(&mut tx, au_id).await?;
    tx.commit().await?;
    Ok(removed)
}

async fn park(db: &Database, au_id: &str) -> Result<()> {
    let mut tx = db.begin().await?;
    db.pending.add_failed_tx(&mut tx, au_id).await?;
    tx.commit().await?;
    Ok(())
}

#[async_trait]
impl SchedulableTask for RemovalTask {
    fn control(&self) -> &TaskHandle {
        &self.control
    }

    async fn on_start(&mut self) -> Result<()> {
        info!(
            subsystem = "jobs",
            component = "removal",
            op = "start",
            au_id = %self.control.au_id(),
            "Starting removal task for AU '{}'",
            self.control.au_name()
        );
        Ok(())
    }

    async fn step(&mut self, _n: usize) -> usize {
        let control = Arc::clone(&self.control);
        let token = control.token().clone();

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled(format!(
                "removal of AU '{}' aborted",
                control.au_id()
            ))),
            result = delete_au(&self.db, control.au_id()) => result,
        };

        match outcome {
            Ok(removed) => {
                self.removed = removed;
                control.conclude(TaskStatus::Success);
            }
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "removal",
                    op = "step",
                    au_id = %control.au_id(),
                    error = %e,
                    "Error removing AU metadata"
                );
                if control.conclude(TaskStatus::Failed) {
                    control.set_error(e.to_string());
                }
            }
        }
        control.set_finished();
        1
    }

    async fn on_finish(&mut self) {
        let control = &self.control;
        if control.conclude(TaskStatus::Failed) {
            control.set_error("finished before the AU was removed");
        }
        let snapshot = control.snapshot();
        match snapshot.status {
            TaskStatus::Success => info!(
                subsystem = "jobs",
                component = "removal",
                op = "finish",
                au_id = %control.au_id(),
                record_count = self.removed,
                "Removed {} metadata items of AU '{}'",
                self.removed,
                control.au_name()
            ),
            status => {
                warn!(
                    subsystem = "jobs",
                    component = "removal",
                    op = "finish",
                    au_id = %control.au_id(),
                    %status,
                    error = snapshot.error.as_deref().unwrap_or(""),
                    "Removal task for AU '{}' did not complete",
                    control.au_name()
                );
                if let Err(e) = park(&self.db, control.au_id()).await {
                    warn!(
                        subsystem = "jobs",
                        component = "removal",
                        op = "finish",
                        au_id = %control.au_id(),
                        error = %e,
                        "Error updating pending queue at FINISH"
                    );
                }
            }
        }
    }
}
