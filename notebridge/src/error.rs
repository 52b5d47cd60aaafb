//! Error taxonomy for the bridge.
//!
//! The split that matters to callers: [`Error::NativeCall`] means the native
//! layer itself rejected or failed the operation (potentially retriable);
//! [`Error::RuntimeCall`] means the managed glue around it broke (a
//! programming error, not retriable). Cache problems never surface here at
//! all — the identity cache degrades to a miss and logs.

use thiserror::Error;

use crate::handle::NativeHandle;
use crate::runtime::{NativeError, NativeOp};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The worker pool failed to come up — typically a worker's one-time
    /// thread registration was rejected by the native runtime.
    #[error("bridge startup failed: {0}")]
    Configuration(String),

    /// The native layer failed an operation. Carries the native cause.
    #[error("native call {op} failed")]
    NativeCall {
        op: NativeOp,
        #[source]
        source: NativeError,
    },

    /// Unchecked failure inside the managed glue (e.g. a panic while a
    /// worker executed a task, or a stopped pool).
    #[error("{0}")]
    RuntimeCall(String),

    /// An operation was attempted through a handle that has already been
    /// released, or whose cached identity no longer matches the resource.
    #[error("handle {handle:?} has been released")]
    StaleHandle { handle: NativeHandle },
}

impl Error {
    pub(crate) fn native(op: NativeOp, source: NativeError) -> Self {
        Error::NativeCall { op, source }
    }
}
