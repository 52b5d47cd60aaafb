//! Opaque native handles and the descriptors the runtime attaches to them.

use std::fmt;

/// Resource category a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Session,
    Container,
    Record,
    View,
    Item,
}

/// Opaque reference to a resource owned by the native runtime.
///
/// Not owned by the host allocator: the runtime keeps the backing resource
/// alive until the handle is explicitly released. The `raw` value is only
/// meaningful to the runtime that issued it and is distinct from the
/// resource's logical identity (see [`HandleDescriptor::identity`]) — a
/// reopenable resource may come back under a different `raw` value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle {
    pub raw: u64,
    pub kind: HandleKind,
}

impl NativeHandle {
    /// Pseudo-handle used as the dispatch target before a session exists
    /// (the `OpenSession` bootstrap call).
    pub const fn root() -> Self {
        Self {
            raw: 0,
            kind: HandleKind::Session,
        }
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.raw)
    }
}

/// A handle plus the identity material the runtime reports when it hands the
/// handle out. Everything needed to derive a cache key travels with the
/// handle, so key derivation never requires another native call.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleDescriptor {
    pub handle: NativeHandle,
    /// Native-side logical identity. Stable across reopens of the same
    /// logical resource.
    pub identity: u64,
    /// Logical address (`host!!path`) for resources that may be reopened
    /// under a different handle value. `None` for stable-handle resources.
    pub address: Option<String>,
}

impl HandleDescriptor {
    pub fn new(handle: NativeHandle, identity: u64) -> Self {
        Self {
            handle,
            identity,
            address: None,
        }
    }

    pub fn with_address(handle: NativeHandle, identity: u64, address: impl Into<String>) -> Self {
        Self {
            handle,
            identity,
            address: Some(address.into()),
        }
    }
}
