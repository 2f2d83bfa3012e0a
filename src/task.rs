//! # Cancelable tasks
//!
//! [`CancelableTask`] is one schedulable unit of background work. It tracks
//! a status message, a fractional progress and a [`TaskState`], and it carries:
//!
//! - cancel listeners, fired exactly once, in registration order, on the
//!   thread that calls [`CancelableTask::request_cancel`];
//! - progress and terminal observers (push model), also mirrored onto a
//!   [`tokio::sync::watch`] channel for async consumers.
//!
//! ## Rules
//! - State is monotonic: once terminal, nothing changes any more.
//! - Progress never decreases while running. Late updates on a terminal task
//!   are dropped silently, since a worker may race a cancellation.
//! - Cancellation beats a racing [`CancelableTask::complete`].
//! - All transitions and list mutations go through one lock per task.
//!   Callbacks run outside it, so they may read the task back.
//!
//! ```text
//! Pending ──submit──► Running ──complete(Ok)──► Succeeded
//!    │                   ├──────complete(Err)─► Failed
//!    └──request_cancel───┴──request_cancel────► Cancelled
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::enums::TaskState;
use crate::error::{LoaderError, TaskError, UnitFailure};
use crate::listener::{CancelListener, CancelListeners, fire_all, invoke_guarded};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// How a task's progress relates to the application-wide busy indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFlags {
    /// Progress should be reflected in the global busy indicator.
    pub global_loading_manager: bool,
    /// Spawned by another task; never drives the global indicator on its own.
    pub sub_task: bool,
}

impl TaskFlags {
    pub const fn global() -> Self {
        Self {
            global_loading_manager: true,
            sub_task: false,
        }
    }

    pub const fn drives_global_indicator(self) -> bool {
        self.global_loading_manager && !self.sub_task
    }
}

/// Handle returned when registering a progress or terminal observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Point-in-time view of a task. The terminal snapshot is the report.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub state: TaskState,
    /// `None` while indeterminate.
    pub progress: Option<f64>,
    pub message: String,
    /// Units that could not be imported.
    pub failures: Vec<UnitFailure>,
    /// Set when `state` is [`TaskState::Failed`].
    pub error: Option<TaskError>,
    pub total: usize,
    /// Units inserted into the destination model.
    pub loaded: usize,
    /// Units already present in the destination model.
    pub skipped: usize,
}

impl TaskSnapshot {
    fn new(id: TaskId, message: String) -> Self {
        Self {
            id,
            state: TaskState::Pending,
            progress: None,
            message,
            failures: Vec::new(),
            error: None,
            total: 0,
            loaded: 0,
            skipped: 0,
        }
    }

    /// Succeeded, but some units were recorded as failed.
    pub fn is_partial_failure(&self) -> bool {
        self.state == TaskState::Succeeded && !self.failures.is_empty()
    }
}

type ProgressFn = Arc<dyn Fn(Option<f64>, &str) + Send + Sync>;
type TerminalFn = Arc<dyn Fn(&TaskSnapshot) + Send + Sync>;

struct Inner {
    snapshot: TaskSnapshot,
    listeners: CancelListeners,
    progress_observers: Vec<(ObserverId, ProgressFn)>,
    terminal_observers: Vec<(ObserverId, TerminalFn)>,
    next_observer: u64,
}

impl Inner {
    fn next_observer_id(&mut self) -> ObserverId {
        self.next_observer += 1;
        ObserverId(self.next_observer)
    }
}

struct Shared {
    id: TaskId,
    flags: TaskFlags,
    inner: Mutex<Inner>,
    /// Serialises notification delivery so observers see updates in order.
    /// Reentrant so a callback may call back into the task on the same thread.
    delivery: ReentrantMutex<()>,
    cancel: CancellationToken,
    watch: watch::Sender<TaskSnapshot>,
}

/// Cheaply cloneable handle to one task; all clones share state.
#[derive(Clone)]
pub struct CancelableTask {
    shared: Arc<Shared>,
}

impl fmt::Debug for CancelableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelableTask")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("flags", &self.shared.flags)
            .finish()
    }
}

impl CancelableTask {
    pub fn new(message: impl Into<String>, flags: TaskFlags) -> Self {
        let id = TaskId::next();
        let snapshot = TaskSnapshot::new(id, message.into());
        let (watch, _) = watch::channel(snapshot.clone());
        Self {
            shared: Arc::new(Shared {
                id,
                flags,
                inner: Mutex::new(Inner {
                    snapshot,
                    listeners: CancelListeners::default(),
                    progress_observers: Vec::new(),
                    terminal_observers: Vec::new(),
                    next_observer: 0,
                }),
                delivery: ReentrantMutex::new(()),
                cancel: CancellationToken::new(),
                watch,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn flags(&self) -> TaskFlags {
        self.shared.flags
    }

    pub fn state(&self) -> TaskState {
        self.shared.inner.lock().snapshot.state
    }

    pub fn progress(&self) -> Option<f64> {
        self.shared.inner.lock().snapshot.progress
    }

    pub fn message(&self) -> String {
        self.shared.inner.lock().snapshot.message.clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.shared.inner.lock().snapshot.clone()
    }

    /// Token cancelled together with the task; poll it between units of work.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Marks the task as picked up by a worker (`Pending -> Running`).
    pub fn submit(&self) -> Result<(), LoaderError> {
        let _delivery = self.shared.delivery.lock();
        let snapshot = {
            let mut inner = self.shared.inner.lock();
            let state = inner.snapshot.state;
            if state != TaskState::Pending {
                return Err(LoaderError::AlreadySubmitted { state });
            }
            inner.snapshot.state = TaskState::Running;
            inner.snapshot.clone()
        };
        tracing::debug!(task_id = %self.shared.id, "task.running");
        self.shared.watch.send_replace(snapshot);
        Ok(())
    }

    /// Records progress in `[0, 1]`. Values below the current progress,
    /// non-finite values and calls outside `Running` are ignored.
    pub fn update_progress(&self, progress: f64) {
        if !progress.is_finite() {
            return;
        }
        let progress = progress.clamp(0.0, 1.0);
        self.update(|snapshot| {
            if snapshot.progress.is_some_and(|current| progress < current) {
                return false;
            }
            snapshot.progress = Some(progress);
            true
        });
    }

    /// Replaces the status message. Ignored outside `Running`.
    pub fn update_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(move |snapshot| {
            snapshot.message = message;
            true
        });
    }

    fn update(&self, apply: impl FnOnce(&mut TaskSnapshot) -> bool) {
        let _delivery = self.shared.delivery.lock();
        let (snapshot, observers) = {
            let mut inner = self.shared.inner.lock();
            if inner.snapshot.state != TaskState::Running {
                tracing::trace!(
                    task_id = %self.shared.id,
                    state = %inner.snapshot.state,
                    "task.update_ignored"
                );
                return;
            }
            if !apply(&mut inner.snapshot) {
                return;
            }
            let observers: Vec<ProgressFn> = inner
                .progress_observers
                .iter()
                .map(|(_, f)| f.clone())
                .collect();
            (inner.snapshot.clone(), observers)
        };
        self.shared.watch.send_replace(snapshot.clone());
        for observer in observers {
            invoke_guarded("progress_observer", self.shared.id, || {
                observer(snapshot.progress, &snapshot.message)
            });
        }
    }

    /// Records a unit that could not be imported. Ignored outside `Running`.
    pub fn record_failure(&self, failure: UnitFailure) {
        let mut inner = self.shared.inner.lock();
        if inner.snapshot.state == TaskState::Running {
            inner.snapshot.failures.push(failure);
        }
    }

    pub(crate) fn record_counts(&self, total: usize, loaded: usize, skipped: usize) {
        let mut inner = self.shared.inner.lock();
        if inner.snapshot.state == TaskState::Running {
            inner.snapshot.total = total;
            inner.snapshot.loaded = loaded;
            inner.snapshot.skipped = skipped;
        }
    }

    /// Cancels a pending or running task and fires its cancel listeners.
    ///
    /// Returns `true` if this call performed the transition. A second call,
    /// or a call on any other terminal state, does nothing.
    pub fn request_cancel(&self) -> bool {
        let (snapshot, listeners, observers) = {
            let _delivery = self.shared.delivery.lock();
            let taken = {
                let mut inner = self.shared.inner.lock();
                if inner.snapshot.state.is_terminal() {
                    return false;
                }
                inner.snapshot.state = TaskState::Cancelled;
                (
                    inner.snapshot.clone(),
                    inner.listeners.take(),
                    take_terminal_observers(&mut inner),
                )
            };
            self.shared.cancel.cancel();
            self.shared.watch.send_replace(taken.0.clone());
            taken
        };

        tracing::debug!(
            task_id = %self.shared.id,
            listeners = listeners.len(),
            "task.cancelled"
        );
        fire_all(self.shared.id, listeners);
        self.notify_terminal(&snapshot, observers);
        true
    }

    /// Worker-driven end of a running task. Returns the resulting state,
    /// which is `Cancelled` if cancellation won the race.
    pub fn complete(&self, result: Result<(), TaskError>) -> TaskState {
        if result.is_ok() {
            self.update_progress(1.0);
        }
        let (snapshot, observers) = {
            let _delivery = self.shared.delivery.lock();
            let taken = {
                let mut inner = self.shared.inner.lock();
                match inner.snapshot.state {
                    TaskState::Running => {}
                    TaskState::Pending => {
                        tracing::warn!(task_id = %self.shared.id, "task.complete_before_submit");
                        return TaskState::Pending;
                    }
                    terminal => return terminal,
                }
                match result {
                    Ok(()) => inner.snapshot.state = TaskState::Succeeded,
                    Err(error) => {
                        inner.snapshot.state = TaskState::Failed;
                        inner.snapshot.error = Some(error);
                    }
                }
                inner.listeners.clear();
                (inner.snapshot.clone(), take_terminal_observers(&mut inner))
            };
            self.shared.watch.send_replace(taken.0.clone());
            taken
        };

        tracing::debug!(
            task_id = %self.shared.id,
            state = %snapshot.state,
            failures = snapshot.failures.len(),
            "task.completed"
        );
        self.notify_terminal(&snapshot, observers);
        snapshot.state
    }

    fn notify_terminal(&self, snapshot: &TaskSnapshot, observers: Vec<TerminalFn>) {
        for observer in observers {
            invoke_guarded("terminal_observer", self.shared.id, || observer(snapshot));
        }
    }

    /// Registers a listener fired when the task is cancelled.
    ///
    /// Returns `false` for a duplicate (same `Arc`) or when the task is
    /// already terminal; such a listener is never invoked.
    pub fn add_cancel_listener(&self, listener: Arc<dyn CancelListener>) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.snapshot.state.is_terminal() {
            return false;
        }
        inner.listeners.add(listener)
    }

    pub fn remove_cancel_listener(&self, listener: &Arc<dyn CancelListener>) -> bool {
        self.shared.inner.lock().listeners.remove(listener)
    }

    pub fn remove_all_cancel_listeners(&self) {
        self.shared.inner.lock().listeners.clear();
    }

    /// Observes `(progress, message)` updates while the task runs.
    pub fn on_progress<F>(&self, f: F) -> ObserverId
    where
        F: Fn(Option<f64>, &str) + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner.lock();
        let id = inner.next_observer_id();
        inner.progress_observers.push((id, Arc::new(f)));
        id
    }

    /// Observes the terminal snapshot. Fires immediately when the task is
    /// already terminal.
    pub fn on_terminal<F>(&self, f: F) -> ObserverId
    where
        F: Fn(&TaskSnapshot) + Send + Sync + 'static,
    {
        let f: TerminalFn = Arc::new(f);
        let (id, late) = {
            let mut inner = self.shared.inner.lock();
            let id = inner.next_observer_id();
            if inner.snapshot.state.is_terminal() {
                (id, Some(inner.snapshot.clone()))
            } else {
                inner.terminal_observers.push((id, f.clone()));
                (id, None)
            }
        };
        if let Some(snapshot) = late {
            invoke_guarded("terminal_observer", self.shared.id, || f(&snapshot));
        }
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut inner = self.shared.inner.lock();
        let before = inner.progress_observers.len() + inner.terminal_observers.len();
        inner.progress_observers.retain(|(i, _)| *i != id);
        inner.terminal_observers.retain(|(i, _)| *i != id);
        before != inner.progress_observers.len() + inner.terminal_observers.len()
    }

    /// Drops every listener and observer, breaking task/observer cycles.
    pub fn dispose(&self) {
        let mut inner = self.shared.inner.lock();
        inner.listeners.clear();
        inner.progress_observers.clear();
        inner.terminal_observers.clear();
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.shared.watch.subscribe()
    }

    /// Resolves with the terminal snapshot.
    pub async fn finished(&self) -> TaskSnapshot {
        let mut rx = self.subscribe();
        match rx.wait_for(|s| s.state.is_terminal()).await {
            Ok(snapshot) => snapshot.clone(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => self.snapshot(),
        }
    }

    /// Blocks the calling thread until the task is terminal.
    ///
    /// Do not call from inside an async runtime; await [`Self::finished`].
    pub fn wait(&self) -> TaskSnapshot {
        futures::executor::block_on(self.finished())
    }
}

/// Observers never fire again after the terminal notification, so they are
/// dropped here.
fn take_terminal_observers(inner: &mut Inner) -> Vec<TerminalFn> {
    inner.progress_observers.clear();
    std::mem::take(&mut inner.terminal_observers)
        .into_iter()
        .map(|(_, f)| f)
        .collect()
}

/// What a submitter gets back from the pool.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task: CancelableTask,
    write_in_cache: bool,
}

impl TaskHandle {
    pub(crate) fn new(task: CancelableTask, write_in_cache: bool) -> Self {
        Self {
            task,
            write_in_cache,
        }
    }

    pub fn task(&self) -> &CancelableTask {
        &self.task
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn flags(&self) -> TaskFlags {
        self.task.flags()
    }

    /// Whether the loader behind this handle persists into the on-disk cache.
    pub fn write_in_cache(&self) -> bool {
        self.write_in_cache
    }

    pub fn cancel(&self) -> bool {
        self.task.request_cancel()
    }

    pub fn progress(&self) -> Option<f64> {
        self.task.progress()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.task.snapshot()
    }

    pub fn on_progress<F>(&self, f: F) -> ObserverId
    where
        F: Fn(Option<f64>, &str) + Send + Sync + 'static,
    {
        self.task.on_progress(f)
    }

    pub fn on_terminal<F>(&self, f: F) -> ObserverId
    where
        F: Fn(&TaskSnapshot) + Send + Sync + 'static,
    {
        self.task.on_terminal(f)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.task.remove_observer(id)
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.task.subscribe()
    }

    pub async fn finished(&self) -> TaskSnapshot {
        self.task.finished().await
    }

    pub fn wait(&self) -> TaskSnapshot {
        self.task.wait()
    }
}
