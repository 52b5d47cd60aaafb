//! Thread-agnostic client core over a thread-affine native groupware
//! runtime.
//!
//! The native API this crate adapts is handle-based and thread-affine: a
//! thread must register with the runtime once before touching native state,
//! and handles must be released explicitly. This crate confines all native
//! calls to a small fixed pool of registered worker threads, marshals calls
//! from arbitrary caller threads synchronously onto that pool, and keeps a
//! weak identity cache so each logical native resource has at most one live
//! managed proxy.
//!
//! Calling code works with [`Session`], [`Container`], [`Record`], [`View`]
//! and [`Item`] proxies and plain [`Value`]s; raw handles never cross the
//! public boundary.

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod pool;
pub mod proxy;
pub mod runtime;
pub mod settings;
pub mod task;
pub mod value;

pub use cache::{CacheKey, IdentityCache};
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use handle::{HandleDescriptor, HandleKind, NativeHandle};
pub use lifecycle::Barrier;
pub use pool::WorkerPool;
pub use proxy::{AnyProxy, Container, Item, Record, Session, View};
pub use runtime::{NativeError, NativeOp, NativeRuntime};
pub use settings::Settings;
pub use value::{NativeValue, Value};
