//! # Progress presentation
//!
//! Consumers of task notifications: a per-task indicator binding, the
//! application-wide busy tracker, and a `tracing`-backed indicator.
//!
//! Indicators are held weakly. A dropped indicator turns delivery into a
//! no-op, so a disposed UI element never breaks the task that feeds it.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::enums::TaskState;
use crate::task::{ObserverId, TaskHandle, TaskId, TaskSnapshot};

/// A visual (or textual) progress display for one task.
pub trait ProgressIndicator: Send + Sync {
    fn update(&self, progress: Option<f64>, message: &str);

    /// Called once with the terminal snapshot.
    fn finish(&self, snapshot: &TaskSnapshot);
}

pub struct ProgressPresenter;

impl ProgressPresenter {
    /// Cache downloads and global loading tasks get an indicator; other
    /// tasks run silently.
    pub fn wants_indicator(handle: &TaskHandle) -> bool {
        handle.write_in_cache() || handle.flags().global_loading_manager
    }

    /// Binds `indicator` to the task behind `handle`.
    ///
    /// Returns `None` when the task should not show an indicator.
    pub fn attach<I>(handle: &TaskHandle, indicator: &Arc<I>) -> Option<PresenterBinding>
    where
        I: ProgressIndicator + 'static,
    {
        if !Self::wants_indicator(handle) {
            return None;
        }

        let current = handle.snapshot();
        if !current.state.is_terminal() {
            indicator.update(current.progress, &current.message);
        }

        let weak: Weak<I> = Arc::downgrade(indicator);
        let progress = handle.on_progress(move |progress, message| {
            if let Some(indicator) = weak.upgrade() {
                indicator.update(progress, message);
            }
        });
        let weak: Weak<I> = Arc::downgrade(indicator);
        let terminal = handle.on_terminal(move |snapshot| {
            if let Some(indicator) = weak.upgrade() {
                indicator.finish(snapshot);
            }
        });

        Some(PresenterBinding {
            handle: handle.clone(),
            observers: [progress, terminal],
        })
    }
}

/// Live binding between a task and an indicator; unbinds on drop.
#[derive(Debug)]
pub struct PresenterBinding {
    handle: TaskHandle,
    observers: [ObserverId; 2],
}

impl PresenterBinding {
    pub fn task_id(&self) -> TaskId {
        self.handle.id()
    }

    pub fn detach(self) {}
}

impl Drop for PresenterBinding {
    fn drop(&mut self) {
        for id in self.observers {
            self.handle.remove_observer(id);
        }
    }
}

/// Counts unfinished tasks (pending or running) that drive the
/// application-wide busy indicator.
///
/// Busy/idle transitions are logged and published on [`Self::subscribe`].
#[derive(Debug, Clone)]
pub struct GlobalBusyTracker {
    inner: Arc<BusyInner>,
}

#[derive(Debug)]
struct BusyInner {
    active: Mutex<HashSet<TaskId>>,
    busy: watch::Sender<bool>,
}

impl Default for GlobalBusyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalBusyTracker {
    pub fn new() -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(BusyInner {
                active: Mutex::new(HashSet::new()),
                busy,
            }),
        }
    }

    /// Starts tracking `handle` if its flags make it a global loading task.
    /// Returns whether it is tracked.
    pub fn track(&self, handle: &TaskHandle) -> bool {
        if !handle.flags().drives_global_indicator() || handle.state().is_terminal() {
            return false;
        }
        {
            let mut active = self.inner.active.lock();
            if !active.insert(handle.id()) {
                return true;
            }
            if active.len() == 1 {
                tracing::info!(task_id = %handle.id(), "busy.started");
                self.inner.busy.send_replace(true);
            }
        }
        let inner = self.inner.clone();
        handle.on_terminal(move |snapshot| {
            let mut active = inner.active.lock();
            if active.remove(&snapshot.id) && active.is_empty() {
                tracing::info!(task_id = %snapshot.id, "busy.idle");
                inner.busy.send_replace(false);
            }
        });
        true
    }

    pub fn is_busy(&self) -> bool {
        !self.inner.active.lock().is_empty()
    }

    pub fn active(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// `true` while at least one tracked task is unfinished.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.busy.subscribe()
    }
}

/// One-line human summary of a terminal snapshot.
///
/// Failures list every failed unit; cancellation reads as a neutral outcome.
pub fn terminal_summary(snapshot: &TaskSnapshot) -> String {
    match snapshot.state {
        TaskState::Succeeded if snapshot.failures.is_empty() => {
            format!("loaded {} of {} units", snapshot.loaded, snapshot.total)
        }
        TaskState::Succeeded | TaskState::Failed => {
            let failed: Vec<String> = snapshot
                .failures
                .iter()
                .map(|f| format!("{} ({})", f.unit, f.reason))
                .collect();
            let head = match &snapshot.error {
                Some(error) => error.to_string(),
                None => format!("loaded {} of {} units", snapshot.loaded, snapshot.total),
            };
            if failed.is_empty() {
                head
            } else {
                format!("{head}; {} failed: {}", failed.len(), failed.join(", "))
            }
        }
        TaskState::Cancelled => format!("cancelled after {} units", snapshot.loaded),
        TaskState::Pending | TaskState::Running => snapshot.state.to_string(),
    }
}

/// Indicator that reports through `tracing`, one line per 10% step.
#[derive(Debug)]
pub struct LogIndicator {
    label: String,
    last_step: Mutex<Option<u8>>,
}

impl LogIndicator {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_step: Mutex::new(None),
        }
    }
}

impl ProgressIndicator for LogIndicator {
    fn update(&self, progress: Option<f64>, message: &str) {
        let step = progress.map(|p| (p * 10.0).floor() as u8);
        {
            let mut last = self.last_step.lock();
            if *last == step && step.is_some() {
                return;
            }
            *last = step;
        }
        match progress {
            Some(p) => tracing::info!(
                label = %self.label,
                percent = (p * 100.0).round() as u32,
                "{message}"
            ),
            None => tracing::info!(label = %self.label, "{message}"),
        }
    }

    fn finish(&self, snapshot: &TaskSnapshot) {
        let summary = terminal_summary(snapshot);
        match snapshot.state {
            TaskState::Failed => tracing::warn!(label = %self.label, "{summary}"),
            _ if snapshot.is_partial_failure() => tracing::warn!(label = %self.label, "{summary}"),
            _ => tracing::info!(label = %self.label, state = %snapshot.state, "{summary}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TaskError, UnitError, UnitFailure};
    use crate::task::{CancelableTask, TaskFlags};

    #[derive(Default)]
    struct Recording {
        updates: Mutex<Vec<Option<f64>>>,
        finished: Mutex<Vec<TaskState>>,
    }

    impl ProgressIndicator for Recording {
        fn update(&self, progress: Option<f64>, _message: &str) {
            self.updates.lock().push(progress);
        }

        fn finish(&self, snapshot: &TaskSnapshot) {
            self.finished.lock().push(snapshot.state);
        }
    }

    fn handle(flags: TaskFlags, write_in_cache: bool) -> (CancelableTask, TaskHandle) {
        let task = CancelableTask::new("loading", flags);
        (task.clone(), TaskHandle::new(task, write_in_cache))
    }

    #[test]
    fn silent_tasks_get_no_indicator() {
        let (_, quiet) = handle(TaskFlags::default(), false);
        let indicator = Arc::new(Recording::default());
        assert!(ProgressPresenter::attach(&quiet, &indicator).is_none());

        let (_, cached) = handle(TaskFlags::default(), true);
        assert!(ProgressPresenter::wants_indicator(&cached));
    }

    #[test]
    fn binding_forwards_progress_and_terminal() {
        let (task, handle) = handle(TaskFlags::global(), false);
        let indicator = Arc::new(Recording::default());
        let binding = ProgressPresenter::attach(&handle, &indicator).expect("global task");
        assert_eq!(binding.task_id(), task.id());

        task.submit().expect("submit");
        task.update_progress(0.5);
        task.complete(Ok(()));

        assert_eq!(
            *indicator.updates.lock(),
            vec![None, Some(0.5), Some(1.0)]
        );
        assert_eq!(*indicator.finished.lock(), vec![TaskState::Succeeded]);
    }

    #[test]
    fn dropped_indicator_is_tolerated() {
        let (task, handle) = handle(TaskFlags::global(), false);
        let indicator = Arc::new(Recording::default());
        let _binding = ProgressPresenter::attach(&handle, &indicator).expect("global task");
        drop(indicator);

        task.submit().expect("submit");
        task.update_progress(0.3);
        assert!(task.request_cancel());
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn detached_binding_stops_updates() {
        let (task, handle) = handle(TaskFlags::global(), false);
        let indicator = Arc::new(Recording::default());
        ProgressPresenter::attach(&handle, &indicator)
            .expect("global task")
            .detach();

        task.submit().expect("submit");
        task.update_progress(0.3);
        assert_eq!(*indicator.updates.lock(), vec![None]);
    }

    #[test]
    fn busy_tracker_counts_only_global_top_level_tasks() {
        let tracker = GlobalBusyTracker::new();
        let (global, global_handle) = handle(TaskFlags::global(), false);
        let (_, sub_handle) = handle(
            TaskFlags {
                global_loading_manager: true,
                sub_task: true,
            },
            false,
        );

        assert!(tracker.track(&global_handle));
        assert!(tracker.track(&global_handle));
        assert!(!tracker.track(&sub_handle));
        assert_eq!(tracker.active(), 1);
        assert!(tracker.is_busy());

        global.request_cancel();
        assert!(!tracker.is_busy());
        assert!(!tracker.track(&global_handle));
    }

    #[test]
    fn busy_feed_follows_pending_and_running_tasks() {
        let tracker = GlobalBusyTracker::new();
        let busy = tracker.subscribe();
        let (first, first_handle) = handle(TaskFlags::global(), false);
        let (second, second_handle) = handle(TaskFlags::global(), false);
        assert!(!*busy.borrow());

        assert!(tracker.track(&first_handle));
        assert_eq!(first.state(), TaskState::Pending);
        assert!(*busy.borrow());

        first.submit().expect("submit");
        tracker.track(&second_handle);
        assert_eq!(tracker.active(), 2);

        first.complete(Ok(()));
        assert!(*busy.borrow());
        second.request_cancel();
        assert!(!*busy.borrow());
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn summary_aggregates_failures_and_keeps_cancel_neutral() {
        let mut snapshot = CancelableTask::new("x", TaskFlags::default()).snapshot();
        snapshot.state = TaskState::Failed;
        snapshot.total = 2;
        snapshot.failures = vec![
            UnitFailure::new("a.dcm", &UnitError::MissingAttribute("SOPInstanceUID")),
            UnitFailure::new("b.dcm", &UnitError::MissingAttribute("SOPInstanceUID")),
        ];
        snapshot.error = Some(TaskError::all_failed(&snapshot.failures));
        let summary = terminal_summary(&snapshot);
        assert!(summary.starts_with("all 2 units failed"));
        assert!(summary.contains("2 failed: a.dcm"));

        snapshot.state = TaskState::Cancelled;
        assert_eq!(terminal_summary(&snapshot), "cancelled after 0 units");
    }
}
