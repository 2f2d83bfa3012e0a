//! # Loaders
//!
//! A [`Loader`] is a [`CancelableTask`] that imports one logical unit of
//! imaging data (a group of local files or one remote series) into a shared
//! [`DestinationModel`].
//!
//! ## Rules
//! - Cancellation is cooperative: it is checked before every unit, on every
//!   fetched chunk, and once more before inserting a finished unit.
//! - A cancelled unit's partial output is discarded. A half-written cache
//!   entry is rolled back, never committed.
//! - A failing unit is recorded and the batch carries on. The task fails only
//!   if no unit succeeded.
//! - Finished units are inserted one by one as they complete.

use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tempfile::NamedTempFile;
use web_time::Instant;

use crate::cache::SeriesCache;
use crate::error::{LoaderError, TaskError, UnitError, UnitFailure};
use crate::instance::DicomInstance;
use crate::listener::panic_message;
use crate::model::DestinationModel;
use crate::source::{CancelAwareWriter, InstanceFetcher, SeriesLocator, SourceDescriptor};
use crate::task::{CancelableTask, TaskFlags, TaskHandle, TaskSnapshot};

enum UnitOutcome {
    Loaded(DicomInstance),
    AlreadyPresent,
}

pub struct LoaderBuilder {
    source: SourceDescriptor,
    model: Arc<dyn DestinationModel>,
    flags: TaskFlags,
    message: Option<String>,
    cache: Option<SeriesCache>,
    fetcher: Option<Arc<dyn InstanceFetcher>>,
}

impl LoaderBuilder {
    pub fn new(source: SourceDescriptor, model: Arc<dyn DestinationModel>) -> Self {
        Self {
            source,
            model,
            flags: TaskFlags::global(),
            message: None,
            cache: None,
            fetcher: None,
        }
    }

    pub fn flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Initial status message; defaults to a description of the source.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Persist fetched instances into `cache` (remote sources only).
    pub fn write_in_cache(mut self, cache: SeriesCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn InstanceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn build(self) -> Result<Loader, LoaderError> {
        self.source.validate()?;
        if self.cache.is_some() && !self.source.is_remote() {
            return Err(LoaderError::InvalidArgument(
                "local files are read in place and cannot be cached".into(),
            ));
        }
        if self.source.is_remote() && self.fetcher.is_none() {
            return Err(LoaderError::InvalidArgument(
                "remote source needs an instance fetcher".into(),
            ));
        }

        let message = self.message.unwrap_or_else(|| match &self.source {
            SourceDescriptor::LocalFiles(paths) => format!("Importing {} files", paths.len()),
            SourceDescriptor::Remote(locator) => {
                format!("Downloading series {}", locator.series_instance_uid)
            }
        });

        Ok(Loader {
            task: CancelableTask::new(message, self.flags),
            source: self.source,
            model: self.model,
            cache: self.cache,
            fetcher: self.fetcher,
        })
    }
}

pub struct Loader {
    task: CancelableTask,
    source: SourceDescriptor,
    model: Arc<dyn DestinationModel>,
    cache: Option<SeriesCache>,
    fetcher: Option<Arc<dyn InstanceFetcher>>,
}

impl Loader {
    /// Loader with default flags and no cache.
    pub fn new(
        source: SourceDescriptor,
        model: Arc<dyn DestinationModel>,
    ) -> Result<Self, LoaderError> {
        LoaderBuilder::new(source, model).build()
    }

    pub fn builder(source: SourceDescriptor, model: Arc<dyn DestinationModel>) -> LoaderBuilder {
        LoaderBuilder::new(source, model)
    }

    pub fn task(&self) -> &CancelableTask {
        &self.task
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle::new(self.task.clone(), self.write_in_cache())
    }

    pub fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    pub fn model(&self) -> &Arc<dyn DestinationModel> {
        &self.model
    }

    /// Fixed at construction, so stable for the loader's whole life.
    pub fn write_in_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Worker body. Returns the terminal snapshot.
    ///
    /// A loader whose task is no longer pending (for example cancelled
    /// while queued) returns immediately without touching the model.
    pub fn run(&self) -> TaskSnapshot {
        if let Err(err) = self.task.submit() {
            tracing::debug!(task_id = %self.task.id(), error = %err, "loader.skipped");
            return self.task.snapshot();
        }

        let started = Instant::now();
        let state = match catch_unwind(AssertUnwindSafe(|| self.run_units())) {
            Ok(result) => self.task.complete(result),
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                tracing::error!(task_id = %self.task.id(), panic = %reason, "loader.panicked");
                self.task.complete(Err(TaskError::Panicked(reason)))
            }
        };

        let snapshot = self.task.snapshot();
        tracing::info!(
            task_id = %self.task.id(),
            state = %state,
            loaded = snapshot.loaded,
            skipped = snapshot.skipped,
            failed = snapshot.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "loader.finished"
        );
        snapshot
    }

    fn run_units(&self) -> Result<(), TaskError> {
        let total = self.source.len();
        let (mut loaded, mut skipped) = (0usize, 0usize);
        tracing::info!(
            task_id = %self.task.id(),
            units = total,
            remote = self.source.is_remote(),
            write_in_cache = self.write_in_cache(),
            "loader.started"
        );
        self.task.update_progress(0.0);

        for index in 0..total {
            if self.task.is_cancel_requested() {
                break;
            }
            let label = self.source.unit_label(index);
            self.task
                .update_message(format!("Loading {label} ({}/{total})", index + 1));

            match self.load_unit(index) {
                Ok(_) if self.task.is_cancel_requested() => break,
                Ok(UnitOutcome::Loaded(instance)) => {
                    if self.model.insert(instance) {
                        loaded += 1;
                    } else {
                        skipped += 1;
                    }
                }
                Ok(UnitOutcome::AlreadyPresent) => skipped += 1,
                Err(_) if self.task.is_cancel_requested() => break,
                Err(err) => {
                    tracing::warn!(
                        task_id = %self.task.id(),
                        unit = %label,
                        error = %err,
                        "loader.unit_failed"
                    );
                    self.task.record_failure(UnitFailure::new(label, &err));
                }
            }

            self.task.record_counts(total, loaded, skipped);
            self.task.update_progress((index + 1) as f64 / total as f64);
        }

        if self.task.is_cancel_requested() || loaded + skipped > 0 {
            return Ok(());
        }
        Err(TaskError::all_failed(&self.task.snapshot().failures))
    }

    fn load_unit(&self, index: usize) -> Result<UnitOutcome, UnitError> {
        match &self.source {
            SourceDescriptor::LocalFiles(paths) => {
                DicomInstance::open(&paths[index]).map(UnitOutcome::Loaded)
            }
            SourceDescriptor::Remote(locator) => {
                self.load_remote(locator, &locator.instance_uids[index])
            }
        }
    }

    fn load_remote(&self, locator: &SeriesLocator, sop: &str) -> Result<UnitOutcome, UnitError> {
        if self.model.contains(sop) {
            return Ok(UnitOutcome::AlreadyPresent);
        }
        let series = &locator.series_instance_uid;

        match &self.cache {
            Some(cache) => {
                if let Some(path) = cache.lookup(series, sop) {
                    match DicomInstance::open(&path) {
                        Ok(instance) => {
                            tracing::trace!(task_id = %self.task.id(), unit = sop, "loader.cache_hit");
                            return Ok(UnitOutcome::Loaded(instance));
                        }
                        Err(err) => {
                            tracing::warn!(
                                task_id = %self.task.id(),
                                unit = sop,
                                error = %err,
                                "loader.cache_entry_evicted"
                            );
                            cache.evict(series, sop).map_err(UnitError::Cache)?;
                        }
                    }
                }

                // Only bytes that parse are committed; anything else is dropped with `entry`.
                let mut entry = cache.stage(series, sop).map_err(UnitError::Cache)?;
                self.fetch_into(locator, sop, &mut entry)?;
                let instance = DicomInstance::open(entry.path())?;
                let path = entry.commit().map_err(UnitError::Cache)?;
                Ok(UnitOutcome::Loaded(DicomInstance {
                    path: Some(path),
                    ..instance
                }))
            }
            None => {
                let mut staged = NamedTempFile::new()?;
                self.fetch_into(locator, sop, staged.as_file_mut())?;
                let instance = DicomInstance::open(staged.path())?;
                Ok(UnitOutcome::Loaded(DicomInstance {
                    path: None,
                    ..instance
                }))
            }
        }
    }

    fn fetch_into(
        &self,
        locator: &SeriesLocator,
        sop: &str,
        sink: &mut dyn Write,
    ) -> Result<(), UnitError> {
        let fetcher = self.fetcher.as_ref().ok_or_else(|| {
            UnitError::Fetch(std::io::Error::other("no instance fetcher configured"))
        })?;
        let cancel = self.task.cancellation_token();
        let mut writer = CancelAwareWriter::new(sink, cancel);

        let fetched = fetcher.fetch(locator, sop, &mut writer, cancel);
        if cancel.is_cancelled() {
            return Err(UnitError::Cancelled);
        }
        fetched.map_err(UnitError::Fetch)?;
        writer.flush()?;
        tracing::trace!(
            task_id = %self.task.id(),
            unit = sop,
            bytes = writer.written(),
            "loader.fetched"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("task", &self.task)
            .field("units", &self.source.len())
            .field("write_in_cache", &self.write_in_cache())
            .finish()
    }
}
