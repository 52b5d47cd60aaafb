//! Per-call marshaling record shared between a blocked caller and a worker.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::handle::NativeHandle;
use crate::runtime::NativeOp;
use crate::value::NativeValue;

/// One marshaled call: built by the dispatcher on the caller thread,
/// executed by a worker, then discarded. Never reused.
pub struct CallTask {
    pub target: NativeHandle,
    pub op: NativeOp,
    pub args: Vec<NativeValue>,
    state: Mutex<TaskState>,
    done: Condvar,
}

#[derive(Default)]
struct TaskState {
    completed: bool,
    outcome: Option<Result<NativeValue>>,
}

impl CallTask {
    pub fn new(target: NativeHandle, op: NativeOp, args: Vec<NativeValue>) -> Self {
        Self {
            target,
            op,
            args,
            state: Mutex::new(TaskState::default()),
            done: Condvar::new(),
        }
    }

    /// Record the outcome and wake the waiting caller. Worker side.
    pub fn complete(&self, outcome: Result<NativeValue>) {
        let mut state = self.state.lock();
        state.outcome = Some(outcome);
        state.completed = true;
        self.done.notify_all();
    }

    /// Block until the task completes, re-checking the completion flag after
    /// every wake. The bounded wait is a liveness re-check, not a deadline:
    /// a single wake is never trusted to mean done, and a task that never
    /// completes blocks its caller indefinitely. There is no cancellation —
    /// the native operation may already be unsafely in progress.
    pub fn wait(&self, recheck: Duration) -> Result<NativeValue> {
        let mut state = self.state.lock();
        loop {
            if state.completed {
                return state.outcome.take().unwrap_or_else(|| {
                    Err(Error::RuntimeCall(
                        "call task completed without an outcome".to_string(),
                    ))
                });
            }
            let _ = self.done.wait_for(&mut state, recheck);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_complete_before_wait() {
        let task = CallTask::new(NativeHandle::root(), NativeOp::OpenSession, vec![]);
        task.complete(Ok(NativeValue::Int(5)));
        let got = task.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(got, NativeValue::Int(5));
    }

    #[test]
    fn test_wait_survives_spurious_timeouts() {
        let task = Arc::new(CallTask::new(
            NativeHandle::root(),
            NativeOp::OpenSession,
            vec![],
        ));
        let t2 = Arc::clone(&task);
        let handle = std::thread::spawn(move || {
            // Completes well after several re-check periods have elapsed.
            std::thread::sleep(Duration::from_millis(60));
            t2.complete(Ok(NativeValue::Null));
        });
        let start = Instant::now();
        let got = task.wait(Duration::from_millis(5)).unwrap();
        assert_eq!(got, NativeValue::Null);
        assert!(start.elapsed() >= Duration::from_millis(50));
        handle.join().unwrap();
    }

    #[test]
    fn test_error_outcome_passes_through() {
        let task = CallTask::new(NativeHandle::root(), NativeOp::ReadProperty, vec![]);
        task.complete(Err(Error::RuntimeCall("boom".to_string())));
        let err = task.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::RuntimeCall(_)));
    }
}
