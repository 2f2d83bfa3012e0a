//! Error types for tasks, loaders and the execution pool.
//!
//! - [`LoaderError`]: rejected synchronously by the public API.
//! - [`UnitError`]: why one unit (file or remote instance) could not be imported.
//!   Recorded as a [`UnitFailure`] and never fatal to the batch.
//! - [`TaskError`]: why a task ended in [`TaskState::Failed`].
//!
//! Cancellation is not an error; it is the terminal [`TaskState::Cancelled`].

use std::io;

use thiserror::Error;

use crate::enums::TaskState;

#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("execution pool has been shut down")]
    RejectedExecution,

    #[error("task already submitted (state: {state})")]
    AlreadySubmitted { state: TaskState },

    #[error("failed to start worker pool: {0}")]
    WorkerStart(String),
}

impl LoaderError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            LoaderError::InvalidArgument(_) => "invalid_argument",
            LoaderError::RejectedExecution => "rejected_execution",
            LoaderError::AlreadySubmitted { .. } => "already_submitted",
            LoaderError::WorkerStart(_) => "worker_start",
        }
    }
}

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("missing required attribute {0}")]
    MissingAttribute(&'static str),

    #[error("fetch failed: {0}")]
    Fetch(#[source] io::Error),

    #[error("cache write failed: {0}")]
    Cache(#[source] io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl UnitError {
    pub fn as_label(&self) -> &'static str {
        match self {
            UnitError::Io(_) => "unit_io",
            UnitError::Dicom(_) => "unit_dicom",
            UnitError::MissingAttribute(_) => "unit_missing_attribute",
            UnitError::Fetch(_) => "unit_fetch",
            UnitError::Cache(_) => "unit_cache",
            UnitError::Cancelled => "unit_cancelled",
        }
    }
}

/// A unit that failed to import, kept on the task for the terminal report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    /// Human-readable unit name (file path or instance UID).
    pub unit: String,
    /// Stable label of the underlying [`UnitError`].
    pub label: &'static str,
    pub reason: String,
}

impl UnitFailure {
    pub fn new(unit: impl Into<String>, error: &UnitError) -> Self {
        Self {
            unit: unit.into(),
            label: error.as_label(),
            reason: error.to_string(),
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("all {failed} units failed; first: {first}")]
    AllUnitsFailed { failed: usize, first: String },

    #[error("task body panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::AllUnitsFailed { .. } => "task_failed",
            TaskError::Panicked(_) => "task_panicked",
        }
    }

    pub(crate) fn all_failed(failures: &[UnitFailure]) -> Self {
        let first = failures
            .first()
            .map(|f| format!("{}: {}", f.unit, f.reason))
            .unwrap_or_default();
        TaskError::AllUnitsFailed {
            failed: failures.len(),
            first,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_failure_keeps_label_and_reason() {
        let err = UnitError::MissingAttribute("SOPInstanceUID");
        let failure = UnitFailure::new("a.dcm", &err);
        assert_eq!(failure.label, "unit_missing_attribute");
        assert_eq!(failure.reason, "missing required attribute SOPInstanceUID");
    }

    #[test]
    fn all_failed_summarises_first_failure() {
        let failures = vec![
            UnitFailure::new("a.dcm", &UnitError::Cancelled),
            UnitFailure::new("b.dcm", &UnitError::MissingAttribute("SeriesInstanceUID")),
        ];
        let err = TaskError::all_failed(&failures);
        assert_eq!(
            err,
            TaskError::AllUnitsFailed {
                failed: 2,
                first: "a.dcm: cancelled".into()
            }
        );
        assert_eq!(err.as_label(), "task_failed");
    }

    #[test]
    fn loader_error_labels() {
        assert_eq!(LoaderError::RejectedExecution.as_label(), "rejected_execution");
        let err = LoaderError::AlreadySubmitted {
            state: TaskState::Running,
        };
        assert_eq!(err.to_string(), "task already submitted (state: running)");
    }
}
