//! # DICOM series loader
//!
//! This crate imports DICOM instances into a shared series model in the
//! background, with cooperative cancellation and progress reporting.
//!
//! A [`Loader`] wraps one batch of units (local `.dcm` files or the
//! instances of a remote series) and a [`CancelableTask`] describing its
//! lifecycle. Loaders are queued on an [`ExecutionPool`], which runs a
//! bounded number of them on rayon worker threads. Everyone else talks to
//! the task through a [`TaskHandle`]:
//!  - progress and message observers, plus a terminal callback
//!  - cancel listeners, invoked exactly once on cancellation
//!  - `finished().await` or the blocking `wait()`
//!
//! Instances are inserted into the model one by one, so consumers see a
//! series fill up while it loads. A batch where some units fail still
//! imports the others; the task only fails when nothing could be imported.
//!
//! Remote instances can be written through an on-disk [`SeriesCache`].
//! Cache writes are staged and renamed on success, so a cancelled download
//! never leaves a partial file behind.
//!
//! # Examples
//!
//! ## Importing a directory
//!
//! ```no_run
//! # use dicom_series_loader::{DicomModel, ExecutionPool, PoolConfig, SortBy, SourceDescriptor};
//! # use std::sync::Arc;
//! let model = Arc::new(DicomModel::new());
//! let pool = ExecutionPool::new(model.clone(), PoolConfig::default())
//!     .expect("should have started worker threads");
//! let loader = pool
//!     .loader(SourceDescriptor::from_directory("dicom").expect("should contain .dcm files"))
//!     .build()
//!     .expect("should be a valid loader");
//! let handle = pool.execute(loader).expect("pool should accept work");
//! handle.on_progress(|progress, message| println!("{message} {progress:?}"));
//!
//! let report = handle.wait();
//! println!("{} loaded, {} failed", report.loaded, report.failures.len());
//! for uid in model.series_uids() {
//!     let series = model.series(&uid, SortBy::ImagePositionPatient);
//!     println!("{uid}: {} instances", series.len());
//! }
//! ```

pub mod cache;
pub mod config;
pub mod enums;
pub mod error;
pub mod instance;
pub mod listener;
pub mod loader;
pub mod logging;
pub mod model;
pub mod pool;
pub mod presenter;
pub mod source;
pub mod task;

#[cfg(test)]
mod testing;

pub use cache::SeriesCache;
pub use config::PoolConfig;
pub use enums::{SortBy, TaskState};
pub use error::{LoaderError, TaskError, UnitError, UnitFailure};
pub use instance::DicomInstance;
pub use listener::CancelListener;
pub use loader::{Loader, LoaderBuilder};
pub use model::{DestinationModel, DicomModel};
pub use pool::ExecutionPool;
pub use presenter::{GlobalBusyTracker, LogIndicator, ProgressIndicator, ProgressPresenter};
pub use source::{InstanceFetcher, SeriesLocator, SourceDescriptor};
pub use task::{CancelableTask, TaskFlags, TaskHandle, TaskId, TaskSnapshot};
