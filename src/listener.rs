//! Cancel listeners: callbacks fired exactly once when a task is cancelled.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::task::TaskId;

/// Capability notified when the task it is registered on is cancelled.
///
/// Runs synchronously on the thread that requested cancellation, so
/// implementations should return quickly.
pub trait CancelListener: Send + Sync {
    fn cancel(&self);
}

impl<F> CancelListener for F
where
    F: Fn() + Send + Sync,
{
    fn cancel(&self) {
        self()
    }
}

/// Registration-ordered set of listeners, deduplicated by `Arc` identity.
///
/// Not synchronised on its own; the owning task guards it with its lock.
#[derive(Default)]
pub(crate) struct CancelListeners {
    entries: Vec<Arc<dyn CancelListener>>,
}

fn same_listener(a: &Arc<dyn CancelListener>, b: &Arc<dyn CancelListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl CancelListeners {
    /// Returns `false` when the listener was already registered.
    pub(crate) fn add(&mut self, listener: Arc<dyn CancelListener>) -> bool {
        if self.entries.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        self.entries.push(listener);
        true
    }

    pub(crate) fn remove(&mut self, listener: &Arc<dyn CancelListener>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|l| !same_listener(l, listener));
        before != self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Empties the set, handing the listeners over in registration order.
    pub(crate) fn take(&mut self) -> Vec<Arc<dyn CancelListener>> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) fn fire_all(task: TaskId, listeners: Vec<Arc<dyn CancelListener>>) {
    for listener in listeners {
        invoke_guarded("cancel_listener", task, || listener.cancel());
    }
}

/// Runs an observer callback, logging instead of unwinding into the caller.
pub(crate) fn invoke_guarded(kind: &'static str, task: TaskId, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::warn!(
            task_id = %task,
            callback = kind,
            panic = %panic_message(payload.as_ref()),
            "task.callback_panicked"
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
