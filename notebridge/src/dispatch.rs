//! Synchronous call marshaling from arbitrary caller threads to the pool.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::handle::NativeHandle;
use crate::pool::{self, WorkerPool};
use crate::runtime::{NativeOp, NativeRuntime};
use crate::task::CallTask;
use crate::value::NativeValue;
use crate::Error;

/// Blocking call interface over the asynchronous worker pool. Any number of
/// caller threads may invoke concurrently; each call rides its own
/// [`CallTask`].
pub struct Dispatcher {
    pool: WorkerPool,
    runtime: Arc<dyn NativeRuntime>,
    recheck: Duration,
}

impl Dispatcher {
    pub fn new(pool: WorkerPool, runtime: Arc<dyn NativeRuntime>, recheck: Duration) -> Self {
        Self {
            pool,
            runtime,
            recheck,
        }
    }

    /// Execute `op` against `target` on a worker thread and block until the
    /// outcome is available.
    ///
    /// Error translation: a typed error recorded by the worker passes
    /// through unchanged — [`Error::NativeCall`] for failures the native
    /// layer reported, [`Error::RuntimeCall`] for panics in the managed
    /// glue. There is no implicit timeout: a call that never completes
    /// blocks its caller indefinitely.
    pub fn invoke(
        &self,
        target: NativeHandle,
        op: NativeOp,
        args: Vec<NativeValue>,
    ) -> Result<NativeValue> {
        if pool::on_worker_thread() {
            // Nested native access from inside a task: this thread is
            // already registered, and re-enqueuing onto the bounded pool
            // while occupying one of its workers self-waits at size 1.
            return self
                .runtime
                .call(target, op, &args)
                .map_err(|source| Error::native(op, source));
        }

        let task = Arc::new(CallTask::new(target, op, args));
        self.pool.submit(Arc::clone(&task))?;
        task.wait(self.recheck)
    }

    /// Stop the underlying pool. Blocks until all workers have deregistered
    /// and exited.
    pub fn stop(&self) {
        self.pool.stop();
    }
}
