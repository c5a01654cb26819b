//! Cooperative task execution contract.
//!
//! A task does its work in bounded [`SchedulableTask::step`] calls so that a
//! single scheduler can interleave many tasks without any one of them holding
//! the worker for long. [`TaskDriver`] owns the lifecycle: exactly one
//! [`TaskEvent::Start`] before the first step and exactly one
//! [`TaskEvent::Finish`] after the task has latched itself finished.
//!
//! Status, counters and the cancellation token live in a shared
//! [`TaskControl`] so that other threads can observe or cancel a task without
//! waiting for the thread that is stepping it.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use aumeta_core::{Error, Result, TaskKind, TaskStatus};

/// Lifecycle notification delivered to a driver's listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Start,
    Finish,
}

/// Point-in-time view of a task for status surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub au_id: String,
    pub au_name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub is_new: bool,
    pub full_reindex: bool,
    pub indexed: u64,
    pub updated: u64,
    pub errors: u64,
    /// Epoch millis; `None` until the event happened.
    pub start_time: Option<i64>,
    pub start_update_time: Option<i64>,
    pub end_time: Option<i64>,
    pub error: Option<String>,
}

impl TaskSnapshot {
    /// Wall time between start and end, if both are known.
    pub fn elapsed_ms(&self) -> Option<i64> {
        Some(self.end_time? - self.start_time?)
    }
}

/// Shared, thread-safe state of one task.
#[derive(Debug)]
pub struct TaskControl {
    au_id: String,
    au_name: String,
    kind: TaskKind,
    is_new: bool,
    full_reindex: bool,
    status: AtomicU8,
    finished: AtomicBool,
    token: CancellationToken,
    indexed: AtomicU64,
    updated: AtomicU64,
    errors: AtomicU64,
    // 0 means "not yet".
    start_time: AtomicI64,
    start_update_time: AtomicI64,
    end_time: AtomicI64,
    error: Mutex<Option<String>>,
}

/// Cloneable handle used to observe or cancel a task from elsewhere.
pub type TaskHandle = Arc<TaskControl>;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn stamp(value: i64) -> Option<i64> {
    (value != 0).then_some(value)
}

impl TaskControl {
    pub fn new(kind: TaskKind, au_id: impl Into<String>, au_name: impl Into<String>) -> Self {
        Self {
            au_id: au_id.into(),
            au_name: au_name.into(),
            kind,
            is_new: false,
            full_reindex: false,
            status: AtomicU8::new(TaskStatus::Running.as_u8()),
            finished: AtomicBool::new(false),
            token: CancellationToken::new(),
            indexed: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            start_time: AtomicI64::new(0),
            start_update_time: AtomicI64::new(0),
            end_time: AtomicI64::new(0),
            error: Mutex::new(None),
        }
    }

    pub fn with_new_au(mut self, is_new: bool) -> Self {
        self.is_new = is_new;
        self
    }

    pub fn with_full_reindex(mut self, full_reindex: bool) -> Self {
        self.full_reindex = full_reindex;
        self
    }

    pub fn au_id(&self) -> &str {
        &self.au_id
    }

    pub fn au_name(&self) -> &str {
        &self.au_name
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_full_reindex(&self) -> bool {
        self.full_reindex
    }

    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire)).unwrap_or(TaskStatus::Failed)
    }

    /// Move from `from` to `to`; returns false if the status was not `from`.
    pub fn transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Leave `Running` for a terminal status, unless already terminal.
    pub fn conclude(&self, to: TaskStatus) -> bool {
        self.transition(TaskStatus::Running, to)
    }

    /// Request early termination.
    ///
    /// A running task becomes `Failed` and finished, and any operation
    /// waiting on [`token`](Self::token) is aborted. Calling it again, or on a
    /// task that already concluded, has no effect.
    pub fn cancel(&self) -> bool {
        self.interrupt(TaskStatus::Failed, "cancelled")
    }

    /// Like [`cancel`](Self::cancel), but the task ends `Rescheduled` so the
    /// AU keeps its normal place in the pending queue.
    ///
    /// Removal tasks end only in `Success` or `Failed`; for them this is a
    /// no-op returning false.
    pub fn reschedule(&self) -> bool {
        if self.kind == TaskKind::Removal {
            return false;
        }
        self.interrupt(TaskStatus::Rescheduled, "rescheduled")
    }

    fn interrupt(&self, to: TaskStatus, reason: &str) -> bool {
        if self.status() != TaskStatus::Running {
            return false;
        }
        self.token.cancel();
        if !self.conclude(to) {
            return false;
        }
        self.set_error(reason);
        self.set_finished();
        debug!(
            subsystem = "jobs",
            component = "task",
            op = "cancel",
            au_id = %self.au_id,
            kind = %self.kind,
            status = %to,
            "Task interrupted"
        );
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token tripped by [`cancel`](Self::cancel).
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the task has no more work to do.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn indexed(&self) -> u64 {
        self.indexed.load(Ordering::Relaxed)
    }

    pub fn add_indexed(&self, n: u64) {
        self.indexed.fetch_add(n, Ordering::Relaxed);
    }

    /// Forget the articles indexed so far; nothing of them will be kept.
    pub fn reset_indexed(&self) {
        self.indexed.store(0, Ordering::Relaxed);
    }

    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::Relaxed)
    }

    pub fn set_updated(&self, n: u64) {
        self.updated.store(n, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_started(&self) {
        self.start_time.store(now_millis(), Ordering::Relaxed);
    }

    pub fn mark_update_started(&self) {
        self.start_update_time.store(now_millis(), Ordering::Relaxed);
    }

    pub fn mark_ended(&self) {
        self.end_time.store(now_millis(), Ordering::Relaxed);
    }

    /// Remember the failure that decided this task's outcome.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(message.into());
        }
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            au_id: self.au_id.clone(),
            au_name: self.au_name.clone(),
            kind: self.kind,
            status: self.status(),
            is_new: self.is_new,
            full_reindex: self.full_reindex,
            indexed: self.indexed(),
            updated: self.updated(),
            errors: self.errors(),
            start_time: stamp(self.start_time.load(Ordering::Relaxed)),
            start_update_time: stamp(self.start_update_time.load(Ordering::Relaxed)),
            end_time: stamp(self.end_time.load(Ordering::Relaxed)),
            error: self.error(),
        }
    }
}

/// A unit of cooperatively scheduled work.
///
/// Implementations must not block inside [`step`](Self::step) for longer than
/// the work requested; long external calls have to observe the control's
/// cancellation token.
#[async_trait]
pub trait SchedulableTask: Send {
    /// Shared state of this task.
    fn control(&self) -> &TaskHandle;

    /// Acquire everything stepping needs. Runs once, before the first step.
    async fn on_start(&mut self) -> Result<()>;

    /// Perform up to `n` units of work and return how many were done.
    ///
    /// A task latches [`TaskControl::set_finished`] when it has nothing left.
    async fn step(&mut self, n: usize) -> usize;

    /// Settle the outcome and release resources. Runs once, always.
    async fn on_finish(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Finished,
}

type Listener = Box<dyn FnMut(TaskEvent, &TaskControl) + Send>;

/// Drives a task through `Created -> Started -> Finished`.
pub struct TaskDriver<T> {
    task: T,
    phase: Phase,
    listener: Option<Listener>,
}

impl<T: SchedulableTask> TaskDriver<T> {
    pub fn new(task: T) -> Self {
        Self {
            task,
            phase: Phase::Created,
            listener: None,
        }
    }

    /// Receive the task's START and FINISH events.
    pub fn with_listener<F>(mut self, listener: F) -> Self
    where
        F: FnMut(TaskEvent, &TaskControl) + Send + 'static,
    {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    pub fn control(&self) -> &TaskHandle {
        self.task.control()
    }

    /// Whether FINISH has been delivered.
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    fn notify(&mut self, event: TaskEvent) {
        let control = self.task.control().clone();
        if let Some(listener) = self.listener.as_mut() {
            listener(event, &control);
        }
    }

    /// Deliver START and initialize the task.
    ///
    /// A task that cannot start is concluded (`Rescheduled` for transient
    /// failures, `Failed` otherwise) and latched finished.
    pub async fn start(&mut self) -> Result<()> {
        if self.phase != Phase::Created {
            return Err(Error::InvalidState(format!(
                "task for AU '{}' already started",
                self.control().au_id()
            )));
        }
        self.phase = Phase::Started;
        self.task.control().mark_started();
        self.notify(TaskEvent::Start);

        if let Err(e) = self.task.on_start().await {
            let control = self.task.control();
            let status = if e.is_transient() {
                TaskStatus::Rescheduled
            } else {
                TaskStatus::Failed
            };
            warn!(
                subsystem = "jobs",
                component = "task",
                op = "start",
                au_id = %control.au_id(),
                %status,
                error = %e,
                "Task could not start"
            );
            control.conclude(status);
            control.set_error(e.to_string());
            control.set_finished();
        }
        Ok(())
    }

    /// Ask the task for up to `n` units of work.
    ///
    /// Returns 0 without calling the task once it is finished.
    pub async fn step(&mut self, n: usize) -> Result<usize> {
        if self.phase != Phase::Started {
            return Err(Error::InvalidState(format!(
                "task for AU '{}' is not running",
                self.control().au_id()
            )));
        }
        if self.task.control().is_finished() {
            return Ok(0);
        }
        Ok(self.task.step(n).await)
    }

    /// Deliver FINISH. The task is latched finished first.
    pub async fn finish(&mut self) -> Result<()> {
        if self.phase != Phase::Started {
            return Err(Error::InvalidState(format!(
                "task for AU '{}' cannot finish from this phase",
                self.control().au_id()
            )));
        }
        self.task.control().set_finished();
        self.task.on_finish().await;
        self.task.control().mark_ended();
        self.phase = Phase::Finished;
        self.notify(TaskEvent::Finish);
        Ok(())
    }

    /// Start, step until finished, then finish.
    ///
    /// Yields to the runtime between steps so other tasks make progress.
    pub async fn run_to_completion(&mut self, steps_per_call: usize) -> Result<TaskStatus> {
        if self.phase == Phase::Created {
            self.start().await?;
        }
        while !self.task.control().is_finished() {
            self.step(steps_per_call.max(1)).await?;
            tokio::task::yield_now().await;
        }
        if self.phase == Phase::Started {
            self.finish().await?;
        }
        Ok(self.task.control().status())
    }

    pub fn into_inner(self) -> T {
        self.task
    }
}
