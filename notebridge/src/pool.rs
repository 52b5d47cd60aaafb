//! Fixed pool of runtime-registered worker threads.
//!
//! Every native-touching operation in the crate executes on one of these
//! threads. A worker registers with the native runtime exactly once before
//! entering its loop and deregisters exactly once after it, independent of
//! how many tasks it serves. Startup is verified: `start` does not return a
//! usable pool until every worker has reported a successful registration,
//! and the first registration failure aborts startup for the caller.
//!
//! Default size is 1 — many runtimes of this class forbid concurrent native
//! calls even from correctly registered threads. Larger pools are an
//! explicit opt-in via `threadpool.size`.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::runtime::NativeRuntime;
use crate::task::CallTask;

thread_local! {
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True when the current thread is one of the pool's registered workers.
/// The dispatcher uses this to run nested native calls directly instead of
/// re-enqueuing onto the pool — with a size-1 pool that would self-wait
/// forever.
pub(crate) fn on_worker_thread() -> bool {
    ON_WORKER.with(Cell::get)
}

pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Arc<CallTask>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl WorkerPool {
    /// Spawn `size` workers (minimum 1) and block until each has registered
    /// with the runtime. On the first registration failure the pool is torn
    /// down and the failure is returned as [`Error::Configuration`]; no task
    /// is ever accepted by a pool that did not start cleanly.
    pub fn start(runtime: Arc<dyn NativeRuntime>, size: usize) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Arc<CallTask>>();
        let rx = Arc::new(Mutex::new(rx));
        let (ready_tx, ready_rx) = mpsc::channel();

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let runtime = Arc::clone(&runtime);
            let rx = Arc::clone(&rx);
            let ready_tx = ready_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("native-worker-{i}"))
                .spawn(move || worker_loop(runtime, rx, ready_tx))
                .map_err(|e| Error::Configuration(format!("failed to spawn worker: {e}")))?;
            workers.push(handle);
        }
        drop(ready_tx);

        let pool = Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
        };

        // Startup rendezvous: every worker reports its registration outcome.
        // First failure wins and aborts the start.
        for _ in 0..size {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(native)) => {
                    tracing::error!("worker registration failed: {native}");
                    pool.stop();
                    return Err(Error::Configuration(format!(
                        "worker thread registration failed: {native}"
                    )));
                }
                Err(_) => {
                    pool.stop();
                    return Err(Error::Configuration(
                        "worker exited before registering".to_string(),
                    ));
                }
            }
        }

        tracing::debug!("worker pool started with {size} workers");
        Ok(pool)
    }

    /// Enqueue a task and return immediately. Fails only if the pool has
    /// been stopped.
    pub fn submit(&self, task: Arc<CallTask>) -> Result<()> {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx
                .send(task)
                .map_err(|_| Error::RuntimeCall("worker pool is stopped".to_string())),
            None => Err(Error::RuntimeCall("worker pool is stopped".to_string())),
        }
    }

    /// Signal workers to finish in-flight work, deregister, and exit.
    /// Blocks until all workers have exited. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Closing the channel ends every worker loop once the queue drains.
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked outside task execution");
            }
        }
        tracing::debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

type ReadySender = mpsc::Sender<std::result::Result<(), crate::runtime::NativeError>>;

fn worker_loop(
    runtime: Arc<dyn NativeRuntime>,
    rx: Arc<Mutex<mpsc::Receiver<Arc<CallTask>>>>,
    ready_tx: ReadySender,
) {
    // Registration happens exactly once, before any task. A failure is
    // reported to whoever called `start` and the worker exits without ever
    // taking work (and without deregistering — it never registered).
    if let Err(native) = runtime.register_thread() {
        let _ = ready_tx.send(Err(native));
        return;
    }
    let _ = ready_tx.send(Ok(()));
    ON_WORKER.with(|flag| flag.set(true));

    loop {
        // The receiver lock is only contended by idle workers, which would
        // otherwise be blocked in recv anyway.
        let task = {
            let rx = rx.lock();
            rx.recv()
        };
        let Ok(task) = task else {
            break; // channel closed: pool is stopping
        };
        execute(&*runtime, &task);
    }

    // Deregistration happens exactly once, after the worker's last task.
    runtime.unregister_thread();
}

/// Run one task. A panic anywhere in the call is captured on the task and
/// never propagated up the worker thread — the worker keeps serving.
fn execute(runtime: &dyn NativeRuntime, task: &CallTask) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        runtime.call(task.target, task.op, &task.args)
    }));
    let outcome = match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(native)) => Err(Error::native(task.op, native)),
        Err(payload) => {
            let msg = panic_message(&payload);
            tracing::error!("task {} panicked on worker: {msg}", task.op);
            Err(Error::RuntimeCall(format!(
                "task {} panicked: {msg}",
                task.op
            )))
        }
    };
    task.complete(outcome);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
