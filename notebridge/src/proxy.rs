//! Typed proxies and the wrap/unwrap boundary.
//!
//! Calling code only ever sees the wrapper types in this module and plain
//! [`Value`]s — never a raw [`NativeHandle`]. Every public operation funnels
//! through [`ProxyCore::dispatch`]: proxy-typed arguments are unwrapped to
//! their handle descriptors (structurally, whatever the wrapper kind),
//! handle-typed results come back through the identity cache so a logical
//! resource maps to at most one live proxy, and native types the bridge does
//! not manage surface as explicit [`Value::Opaque`] markers.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::IdentityCache;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::handle::{HandleDescriptor, HandleKind, NativeHandle};
use crate::lifecycle::{Barrier, HandleLifecycle};
use crate::pool::WorkerPool;
use crate::runtime::{NativeOp, NativeRuntime};
use crate::settings::{self, Settings};
use crate::value::{NativeValue, Value};

/// Shared per-session machinery every proxy hangs on to.
pub(crate) struct SessionCtx {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) cache: IdentityCache,
    pub(crate) lifecycle: HandleLifecycle,
    closed: AtomicBool,
}

impl Drop for SessionCtx {
    fn drop(&mut self) {
        // Last proxy gone: nothing can reach the runtime any more, stop the
        // workers. No-op after an explicit close.
        self.dispatcher.stop();
    }
}

/// State shared by all clones of one managed proxy: exactly one handle
/// descriptor, the parent back-reference, and the session machinery.
pub struct ProxyCore {
    descriptor: HandleDescriptor,
    parent: Option<AnyProxy>,
    ctx: Arc<SessionCtx>,
}

impl ProxyCore {
    pub(crate) fn handle(&self) -> NativeHandle {
        self.descriptor.handle
    }

    /// The shared call path. Stale check first, then unwrap, dispatch, wrap.
    fn dispatch(self: &Arc<Self>, op: NativeOp, args: Vec<Value>) -> Result<Value> {
        if self.ctx.lifecycle.is_released(self.handle()) {
            return Err(Error::StaleHandle {
                handle: self.handle(),
            });
        }
        let mut native_args = Vec::with_capacity(args.len());
        for arg in args {
            native_args.push(unwrap_value(arg)?);
        }
        let result = self.ctx.dispatcher.invoke(self.handle(), op, native_args)?;
        let parent = AnyProxy::from_core(Arc::clone(self));
        Ok(wrap_value(&self.ctx, result, Some(&parent)))
    }
}

/// Convert a caller-supplied value to what the native layer speaks.
/// Structural: any proxy variant unwraps to its handle descriptor, after a
/// staleness check — a released handle never reaches the native layer.
fn unwrap_value(value: Value) -> Result<NativeValue> {
    Ok(match value {
        Value::Null => NativeValue::Null,
        Value::Bool(b) => NativeValue::Bool(b),
        Value::Int(n) => NativeValue::Int(n),
        Value::Float(f) => NativeValue::Float(f),
        Value::Text(s) => NativeValue::Text(s),
        Value::DateTime(dt) => NativeValue::DateTime(dt),
        Value::List(items) => NativeValue::List(
            items
                .into_iter()
                .map(unwrap_value)
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Proxy(p) => {
            let core = p.core();
            if core.ctx.lifecycle.is_released(core.handle()) {
                return Err(Error::StaleHandle {
                    handle: core.handle(),
                });
            }
            NativeValue::Handle(core.descriptor.clone())
        }
        Value::Opaque(tag) => NativeValue::Opaque(tag),
    })
}

/// Convert a native result for the caller. Handles wrap through the cache,
/// lists wrap element-wise (heterogeneous lists are fine), primitives pass
/// through, and anything the bridge does not manage stays an explicit
/// opaque marker.
fn wrap_value(ctx: &Arc<SessionCtx>, value: NativeValue, parent: Option<&AnyProxy>) -> Value {
    match value {
        NativeValue::Null => Value::Null,
        NativeValue::Bool(b) => Value::Bool(b),
        NativeValue::Int(n) => Value::Int(n),
        NativeValue::Float(f) => Value::Float(f),
        NativeValue::Text(s) => Value::Text(s),
        NativeValue::DateTime(dt) => Value::DateTime(dt),
        NativeValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| wrap_value(ctx, item, parent))
                .collect(),
        ),
        NativeValue::Handle(descriptor) => Value::Proxy(wrap_handle(ctx, descriptor, parent)),
        NativeValue::Opaque(tag) => Value::Opaque(tag),
    }
}

/// Lookup-or-create the proxy for a handle descriptor, preserving the
/// one-proxy-per-resource invariant. Lookup and creation are one atomic
/// cache step — wraps run on caller threads, so two callers may race here
/// for the same resource. A cache hit may hand back a proxy owning a
/// different raw handle than the descriptor's — same logical resource
/// reopened; the spare handle stays tracked for bulk release.
fn wrap_handle(
    ctx: &Arc<SessionCtx>,
    descriptor: HandleDescriptor,
    parent: Option<&AnyProxy>,
) -> AnyProxy {
    ctx.lifecycle.track(&descriptor);
    let core = ctx.cache.get_or_create(&descriptor, || {
        let core = Arc::new(ProxyCore {
            descriptor: descriptor.clone(),
            parent: parent.cloned(),
            ctx: Arc::clone(ctx),
        });
        tracing::debug!(handle = ?core.handle(), "proxy created");
        core
    });
    AnyProxy::from_core(core)
}

/// A proxy of any wrapper kind. What [`Value::Proxy`] carries.
#[derive(Clone)]
pub enum AnyProxy {
    Session(Session),
    Container(Container),
    Record(Record),
    View(View),
    Item(Item),
}

impl AnyProxy {
    pub(crate) fn from_core(core: Arc<ProxyCore>) -> Self {
        match core.handle().kind {
            HandleKind::Session => AnyProxy::Session(Session(core)),
            HandleKind::Container => AnyProxy::Container(Container(core)),
            HandleKind::Record => AnyProxy::Record(Record(core)),
            HandleKind::View => AnyProxy::View(View(core)),
            HandleKind::Item => AnyProxy::Item(Item(core)),
        }
    }

    pub(crate) fn core(&self) -> &Arc<ProxyCore> {
        match self {
            AnyProxy::Session(p) => &p.0,
            AnyProxy::Container(p) => &p.0,
            AnyProxy::Record(p) => &p.0,
            AnyProxy::View(p) => &p.0,
            AnyProxy::Item(p) => &p.0,
        }
    }

    pub fn handle(&self) -> NativeHandle {
        self.core().handle()
    }

    pub fn kind(&self) -> HandleKind {
        self.handle().kind
    }

    pub fn as_container(&self) -> Option<&Container> {
        match self {
            AnyProxy::Container(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            AnyProxy::Record(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Debug for AnyProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnyProxy({:?})", self.handle())
    }
}

macro_rules! proxy_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(Arc<ProxyCore>);

        impl $name {
            /// The native handle this proxy owns.
            pub fn handle(&self) -> NativeHandle {
                self.0.handle()
            }

            /// Reference identity: true when both wrappers are the same
            /// managed proxy instance.
            pub fn is_same(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }

            /// Release the underlying native handle. Idempotent; any later
            /// call through this proxy fails with
            /// [`Error::StaleHandle`](crate::Error::StaleHandle).
            pub fn release(&self) {
                self.0
                    .ctx
                    .lifecycle
                    .release(&self.0.ctx.dispatcher, self.0.handle());
            }

            fn dispatch(&self, op: NativeOp, args: Vec<Value>) -> Result<Value> {
                self.0.dispatch(op, args)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self.0.handle())
            }
        }

        impl From<$name> for Value {
            fn from(proxy: $name) -> Value {
                Value::Proxy(AnyProxy::$name(proxy))
            }
        }
    };
}

proxy_type!(
    /// The root of the proxy tree: owns the worker pool and the session
    /// handle. Cheap to clone; all clones share one session.
    Session
);
proxy_type!(
    /// A groupware container (addressable store of records), reopenable by
    /// logical address.
    Container
);
proxy_type!(
    /// A single record in a container.
    Record
);
proxy_type!(
    /// A named, ordered view over a container's records.
    View
);
proxy_type!(
    /// One item (field) of a record.
    Item
);

/// Walk parent back-references up to the session proxy.
fn find_session(core: &Arc<ProxyCore>) -> Option<Session> {
    let mut current = Arc::clone(core);
    loop {
        let next = match &current.parent {
            Some(AnyProxy::Session(s)) => return Some(s.clone()),
            Some(p) => Arc::clone(p.core()),
            None => return None,
        };
        current = next;
    }
}

fn unexpected(op: NativeOp, value: &Value) -> Error {
    Error::RuntimeCall(format!("{op} returned unexpected value {value:?}"))
}

fn expect_container(value: Value, op: NativeOp) -> Result<Container> {
    match value {
        Value::Proxy(AnyProxy::Container(c)) => Ok(c),
        other => Err(unexpected(op, &other)),
    }
}

fn expect_record(value: Value, op: NativeOp) -> Result<Record> {
    match value {
        Value::Proxy(AnyProxy::Record(r)) => Ok(r),
        other => Err(unexpected(op, &other)),
    }
}

fn expect_record_opt(value: Value, op: NativeOp) -> Result<Option<Record>> {
    match value {
        Value::Null => Ok(None),
        Value::Proxy(AnyProxy::Record(r)) => Ok(Some(r)),
        other => Err(unexpected(op, &other)),
    }
}

impl Session {
    /// Bootstrap: start the worker pool against `runtime`, open the native
    /// session on a worker, and wrap it.
    ///
    /// Fails with [`Error::Configuration`] if any worker's one-time
    /// registration is rejected; no call reaches the runtime in that case.
    pub fn open(runtime: Arc<dyn NativeRuntime>, config: &Settings) -> Result<Session> {
        let size = config.get_usize(settings::POOL_SIZE, settings::DEFAULT_POOL_SIZE);
        let recheck = Duration::from_millis(
            config.get_u64(settings::RECHECK_MILLIS, settings::DEFAULT_RECHECK_MILLIS),
        );
        let pool = WorkerPool::start(Arc::clone(&runtime), size)?;
        let ctx = Arc::new(SessionCtx {
            dispatcher: Dispatcher::new(pool, runtime, recheck),
            cache: IdentityCache::new(),
            lifecycle: HandleLifecycle::new(),
            closed: AtomicBool::new(false),
        });

        let result = ctx
            .dispatcher
            .invoke(NativeHandle::root(), NativeOp::OpenSession, vec![])?;
        match wrap_value(&ctx, result, None) {
            Value::Proxy(AnyProxy::Session(session)) => Ok(session),
            other => {
                ctx.dispatcher.stop();
                Err(unexpected(NativeOp::OpenSession, &other))
            }
        }
    }

    /// Open (or reopen) a container by its logical address. Reopening an
    /// address that already has a live proxy returns that same proxy.
    pub fn open_container(&self, address: &str) -> Result<Container> {
        let result = self.dispatch(NativeOp::OpenContainer, vec![Value::from(address)])?;
        expect_container(result, NativeOp::OpenContainer)
    }

    /// Mark the current position in the handle creation log.
    pub fn barrier(&self) -> Barrier {
        self.0.ctx.lifecycle.barrier()
    }

    /// Release every handle created since `barrier` that no live proxy
    /// owns. Useful after operations that churn out short-lived
    /// intermediate handles. Returns the number released.
    pub fn bulk_release(&self, barrier: Barrier) -> usize {
        let released =
            self.0
                .ctx
                .lifecycle
                .bulk_release(&self.0.ctx.dispatcher, &self.0.ctx.cache, barrier);
        self.0.ctx.cache.prune();
        released
    }

    /// Release every outstanding handle (session handle included) and stop
    /// the worker pool. Idempotent. Any operation through this session's
    /// proxies afterwards fails with
    /// [`Error::StaleHandle`](crate::Error::StaleHandle).
    pub fn close(&self) {
        if self.0.ctx.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let released = self.0.ctx.lifecycle.release_all(&self.0.ctx.dispatcher);
        tracing::debug!(released, "session closed");
        self.0.ctx.dispatcher.stop();
    }
}

impl Container {
    /// The session this container was opened from (parent back-reference).
    pub fn session(&self) -> Option<Session> {
        find_session(&self.0)
    }

    /// The container's logical address, when it was opened by one.
    pub fn address(&self) -> Option<&str> {
        self.0.descriptor.address.as_deref()
    }

    pub fn create_record(&self) -> Result<Record> {
        let result = self.dispatch(NativeOp::CreateRecord, vec![])?;
        expect_record(result, NativeOp::CreateRecord)
    }

    /// Look a record up by key. `None` when nothing matches.
    pub fn record_by_key(&self, key: &str) -> Result<Option<Record>> {
        let result = self.dispatch(NativeOp::RecordByKey, vec![Value::from(key)])?;
        expect_record_opt(result, NativeOp::RecordByKey)
    }

    /// Open a named view. `None` when the view does not exist.
    pub fn open_view(&self, name: &str) -> Result<Option<View>> {
        let result = self.dispatch(NativeOp::OpenView, vec![Value::from(name)])?;
        match result {
            Value::Null => Ok(None),
            Value::Proxy(AnyProxy::View(v)) => Ok(Some(v)),
            other => Err(unexpected(NativeOp::OpenView, &other)),
        }
    }
}

impl Record {
    /// The container this record lives in. Reuses the parent back-reference
    /// when it leads through views straight to a container — a view only
    /// ever holds records of its own container. Any other chain (a record
    /// reached as another record's property may live elsewhere) asks the
    /// runtime instead.
    pub fn container(&self) -> Result<Container> {
        let mut current = Arc::clone(&self.0);
        loop {
            let next = match &current.parent {
                Some(AnyProxy::Container(c)) => return Ok(c.clone()),
                Some(AnyProxy::View(v)) => Arc::clone(&v.0),
                _ => break,
            };
            current = next;
        }
        let result = self.dispatch(NativeOp::ContainerOfRecord, vec![])?;
        expect_container(result, NativeOp::ContainerOfRecord)
    }

    pub fn read_property(&self, name: &str) -> Result<Value> {
        self.dispatch(NativeOp::ReadProperty, vec![Value::from(name)])
    }

    /// Write a property. The value may itself be a proxy — it crosses the
    /// boundary as the underlying handle.
    pub fn write_property(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.dispatch(
            NativeOp::WriteProperty,
            vec![Value::from(name), value.into()],
        )?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.dispatch(NativeOp::SaveRecord, vec![])?;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        self.dispatch(NativeOp::RemoveRecord, vec![])?;
        Ok(())
    }

    /// First item of the record, `None` when it has no items.
    pub fn first_item(&self) -> Result<Option<Item>> {
        let result = self.dispatch(NativeOp::FirstItem, vec![])?;
        match result {
            Value::Null => Ok(None),
            Value::Proxy(AnyProxy::Item(item)) => Ok(Some(item)),
            other => Err(unexpected(NativeOp::FirstItem, &other)),
        }
    }
}

impl View {
    pub fn first_entry(&self) -> Result<Option<Record>> {
        let result = self.dispatch(NativeOp::FirstEntry, vec![])?;
        expect_record_opt(result, NativeOp::FirstEntry)
    }

    /// The entry after `current` in view order.
    pub fn next_entry(&self, current: &Record) -> Result<Option<Record>> {
        let result = self.dispatch(
            NativeOp::NextEntry,
            vec![Value::Proxy(AnyProxy::Record(current.clone()))],
        )?;
        expect_record_opt(result, NativeOp::NextEntry)
    }

    /// Walk the view front to back.
    pub fn entries(&self) -> Entries {
        Entries {
            view: self.clone(),
            current: None,
            done: false,
        }
    }
}

/// Iterator over a view's records, driven by `FirstEntry`/`NextEntry`.
/// Stops permanently after the first error.
pub struct Entries {
    view: View,
    current: Option<Record>,
    done: bool,
}

impl Iterator for Entries {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = match &self.current {
            None => self.view.first_entry(),
            Some(record) => self.view.next_entry(record),
        };
        match step {
            Ok(Some(record)) => {
                self.current = Some(record.clone());
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Item {
    /// The item's value: possibly a heterogeneous list, possibly a handle
    /// (wrapped), possibly an opaque native type.
    pub fn value(&self) -> Result<Value> {
        self.dispatch(NativeOp::ItemValue, vec![])
    }
}
