//! Tokio-backed implementations of the deferred-work collaborators.
//!
//! The handler itself is synchronous; these adapters are where the crate
//! touches a runtime. Production hands the handler context a
//! [`TokioWaitScheduler`] and a [`TokioCallbackRunner`]; unit tests use
//! [`InlineCallbackRunner`] and a manual scheduler instead.

use std::time::{Duration, Instant};

use log::debug;
use tokio::runtime::Handle;

use crate::postmaster::{CallbackRunner, WaitScheduler, WaitTask};

/// Schedules wait wake-ups on a tokio runtime.
///
/// Each wake-up is one sleeping task holding the handler-ref cell; firing
/// after the handler completed is a no-op.
#[derive(Clone)]
pub struct TokioWaitScheduler {
    handle: Handle,
}

impl TokioWaitScheduler {
    /// Bind to the given runtime handle.
    #[must_use]
    pub fn new(handle: Handle) -> Self { Self { handle } }

    /// Bind to the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self { Self::new(Handle::current()) }
}

impl WaitScheduler for TokioWaitScheduler {
    fn schedule(&self, delay: Duration, task: WaitTask) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let reached = task.run(Instant::now());
            if !reached {
                debug!("wait wake-up found no live handler: delay={}s", delay.as_secs());
            }
        });
    }
}

/// Runs user callbacks on the blocking pool so the stream thread never
/// waits on user code.
#[derive(Clone)]
pub struct TokioCallbackRunner {
    handle: Handle,
}

impl TokioCallbackRunner {
    /// Bind to the given runtime handle.
    #[must_use]
    pub fn new(handle: Handle) -> Self { Self { handle } }

    /// Bind to the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self { Self::new(Handle::current()) }
}

impl CallbackRunner for TokioCallbackRunner {
    fn run(&self, job: Box<dyn FnOnce() + Send>) {
        self.handle.spawn_blocking(job);
    }
}

/// Runs callbacks on the calling thread; for tests and embedders that
/// already are on a worker.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineCallbackRunner;

impl CallbackRunner for InlineCallbackRunner {
    fn run(&self, job: Box<dyn FnOnce() + Send>) { job(); }
}
