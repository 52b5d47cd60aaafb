//! The native API surface this crate adapts, as a trait.
//!
//! The real groupware runtime is thread-affine: a thread must register once
//! before touching any native state, and every call after that must come
//! from a registered thread. The worker pool owns both obligations; no other
//! part of the crate calls into a [`NativeRuntime`] directly, except the
//! dispatcher's direct path for nested calls already running on a worker.

use thiserror::Error;

use crate::handle::NativeHandle;
use crate::value::NativeValue;

/// The operations this bridge marshals. Deliberately a small, representative
/// subset of the native API — the full surface is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    /// Bootstrap: open the root session. Target is [`NativeHandle::root`].
    OpenSession,
    /// Open (or reopen) a container by logical address. Arg: `Text(address)`.
    OpenContainer,
    /// Create a new record in a container.
    CreateRecord,
    /// Look a record up by key. Arg: `Text(key)`. Returns `Null` on no match.
    RecordByKey,
    /// Read a record property. Arg: `Text(name)`.
    ReadProperty,
    /// Write a record property. Args: `Text(name)`, value.
    WriteProperty,
    /// Persist a record.
    SaveRecord,
    /// Delete a record from its container.
    RemoveRecord,
    /// Open a named view over a container. Arg: `Text(name)`.
    OpenView,
    /// First record entry of a view. Returns `Null` on an empty view.
    FirstEntry,
    /// Entry after the given one. Arg: `Handle(current)`.
    NextEntry,
    /// First item of a record. Returns `Null` on an itemless record.
    FirstItem,
    /// Value of an item.
    ItemValue,
    /// The container a record lives in.
    ContainerOfRecord,
    /// Give a handle back to the runtime.
    Release,
}

impl NativeOp {
    pub fn name(&self) -> &'static str {
        match self {
            NativeOp::OpenSession => "OpenSession",
            NativeOp::OpenContainer => "OpenContainer",
            NativeOp::CreateRecord => "CreateRecord",
            NativeOp::RecordByKey => "RecordByKey",
            NativeOp::ReadProperty => "ReadProperty",
            NativeOp::WriteProperty => "WriteProperty",
            NativeOp::SaveRecord => "SaveRecord",
            NativeOp::RemoveRecord => "RemoveRecord",
            NativeOp::OpenView => "OpenView",
            NativeOp::FirstEntry => "FirstEntry",
            NativeOp::NextEntry => "NextEntry",
            NativeOp::FirstItem => "FirstItem",
            NativeOp::ItemValue => "ItemValue",
            NativeOp::ContainerOfRecord => "ContainerOfRecord",
            NativeOp::Release => "Release",
        }
    }
}

impl std::fmt::Display for NativeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Failure surfaced by the native layer itself, as opposed to a failure in
/// the managed glue around it. Carried as the cause inside
/// [`Error::NativeCall`](crate::Error::NativeCall) so callers can tell the
/// two apart.
#[derive(Debug, Error)]
pub enum NativeError {
    #[error("thread registration rejected: {0}")]
    Registration(String),
    #[error("unknown or already released handle {0:?}")]
    UnknownHandle(NativeHandle),
    #[error("{op} is not supported for {target:?}")]
    Unsupported { op: NativeOp, target: NativeHandle },
    #[error("bad argument for {op}: {detail}")]
    BadArgument { op: NativeOp, detail: String },
    #[error("native api error: {0}")]
    Api(String),
}

/// A thread-affine, handle-based native runtime.
///
/// Contract: [`register_thread`](Self::register_thread) and
/// [`unregister_thread`](Self::unregister_thread) are invoked exactly once
/// each per worker thread, bracketing the worker's whole lifetime.
/// [`call`](Self::call) is only ever invoked on a thread whose registration
/// succeeded.
pub trait NativeRuntime: Send + Sync + 'static {
    /// One-time registration of the calling thread with the runtime.
    fn register_thread(&self) -> Result<(), NativeError>;

    /// One-time deregistration of the calling thread. Called on worker
    /// shutdown, after the worker's last task.
    fn unregister_thread(&self);

    /// Execute one operation against a handle on the calling (registered)
    /// thread.
    fn call(
        &self,
        target: NativeHandle,
        op: NativeOp,
        args: &[NativeValue],
    ) -> Result<NativeValue, NativeError>;
}
