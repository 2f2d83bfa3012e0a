//! # Execution pool
//!
//! One pool per destination model: an unbounded FIFO queue in front of a
//! fixed number of rayon worker threads.
//!
//! ## Rules
//! - `execute` never blocks; it only fails once the pool is shut down.
//! - `shutdown` stops intake. Accepted loaders still run (or observe their
//!   cancellation) to the end; nothing is interrupted.
//! - With one worker, loaders start in submission order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::PoolConfig;
use crate::error::LoaderError;
use crate::listener::panic_message;
use crate::loader::{Loader, LoaderBuilder};
use crate::model::DestinationModel;
use crate::source::SourceDescriptor;
use crate::task::TaskHandle;

struct Counters {
    accepting: bool,
    in_flight: usize,
}

struct PoolState {
    counters: Mutex<Counters>,
    idle: Condvar,
}

/// Decrements the in-flight count when a job ends, however it ends.
struct InFlightGuard(Arc<PoolState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut counters = self.0.counters.lock();
        counters.in_flight -= 1;
        if counters.in_flight == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub struct ExecutionPool {
    model: Arc<dyn DestinationModel>,
    config: PoolConfig,
    workers: rayon::ThreadPool,
    state: Arc<PoolState>,
}

impl ExecutionPool {
    pub fn new(model: Arc<dyn DestinationModel>, config: PoolConfig) -> Result<Self, LoaderError> {
        let prefix = config.thread_name_prefix.clone();
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_count().get())
            .thread_name(move |i| format!("{prefix}-{i}"))
            .panic_handler(|payload| {
                tracing::error!(panic = %panic_message(payload.as_ref()), "pool.worker_panicked");
            })
            .build()
            .map_err(|err| LoaderError::WorkerStart(err.to_string()))?;

        tracing::debug!(workers = config.worker_count().get(), "pool.started");
        Ok(Self {
            model,
            config,
            workers,
            state: Arc::new(PoolState {
                counters: Mutex::new(Counters {
                    accepting: true,
                    in_flight: 0,
                }),
                idle: Condvar::new(),
            }),
        })
    }

    pub fn model(&self) -> &Arc<dyn DestinationModel> {
        &self.model
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Starts a loader builder targeting this pool's model.
    pub fn loader(&self, source: SourceDescriptor) -> LoaderBuilder {
        Loader::builder(source, self.model.clone())
    }

    /// Queues `loader` and returns a handle to observe or cancel it.
    pub fn execute(&self, loader: Loader) -> Result<TaskHandle, LoaderError> {
        if !same_model(loader.model(), &self.model) {
            return Err(LoaderError::InvalidArgument(
                "loader targets a different destination model".into(),
            ));
        }

        {
            let mut counters = self.state.counters.lock();
            if !counters.accepting {
                tracing::debug!(task_id = %loader.task().id(), "pool.rejected");
                return Err(LoaderError::RejectedExecution);
            }
            counters.in_flight += 1;
        }

        let handle = loader.handle();
        let guard = InFlightGuard(self.state.clone());
        tracing::trace!(task_id = %handle.id(), "pool.enqueued");
        self.workers.spawn_fifo(move || {
            let _guard = guard;
            loader.run();
        });
        Ok(handle)
    }

    /// Stops accepting loaders. Already accepted ones keep running.
    pub fn shutdown(&self) {
        let mut counters = self.state.counters.lock();
        if counters.accepting {
            counters.accepting = false;
            tracing::info!(in_flight = counters.in_flight, "pool.shutdown");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        !self.state.counters.lock().accepting
    }

    /// Accepted loaders that have not finished yet.
    pub fn active(&self) -> usize {
        self.state.counters.lock().in_flight
    }

    /// Blocks until every accepted loader has finished, or `timeout` elapses.
    /// Returns `true` when the pool is idle.
    pub fn await_termination(&self, timeout: Option<Duration>) -> bool {
        let mut counters = self.state.counters.lock();
        match timeout {
            Some(timeout) => {
                let _ = self
                    .state
                    .idle
                    .wait_while_for(&mut counters, |c| c.in_flight > 0, timeout);
            }
            None => self.state.idle.wait_while(&mut counters, |c| c.in_flight > 0),
        }
        counters.in_flight == 0
    }
}

fn same_model(a: &Arc<dyn DestinationModel>, b: &Arc<dyn DestinationModel>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
