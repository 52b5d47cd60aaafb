//! Instrumented in-memory [`NativeRuntime`] for testing the bridge.
//!
//! Models a tiny groupware runtime — one session, containers addressed by
//! `host!!path`, records with named properties, named views, items — and
//! enforces the real runtime's two hard rules: calls only from registered
//! threads, and no call against a released handle. Everything observable is
//! instrumented: registration counts, a per-call log with executing thread
//! ids, and switches to fail registration or to diverge a container's
//! logical identity (staleness simulation).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use notebridge::cache::normalize_address;
use notebridge::{
    HandleDescriptor, HandleKind, NativeError, NativeHandle, NativeOp, NativeRuntime, NativeValue,
};

/// One executed native call, as observed by the mock.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub target: NativeHandle,
    pub op: NativeOp,
    pub thread: ThreadId,
}

#[derive(Debug, Clone)]
enum Target {
    Session,
    Container(String),
    Record(u64),
    View { container: String },
    Item { record: u64, name: String },
}

#[derive(Default)]
struct ContainerState {
    identity: u64,
    /// Record identities in creation order.
    order: Vec<u64>,
    views: BTreeSet<String>,
}

struct RecordState {
    container: String,
    properties: BTreeMap<String, NativeValue>,
    saved: bool,
}

#[derive(Default)]
struct MockState {
    targets: HashMap<u64, Target>,
    released: HashSet<u64>,
    containers: HashMap<String, ContainerState>,
    records: HashMap<u64, RecordState>,
    view_identities: HashMap<(String, String), u64>,
    item_identities: HashMap<(u64, String), u64>,
}

pub struct MockRuntime {
    state: Mutex<MockState>,
    registered: Mutex<HashSet<ThreadId>>,
    registrations: AtomicUsize,
    deregistrations: AtomicUsize,
    fail_registration: AtomicBool,
    calls: Mutex<Vec<CallRecord>>,
    next_raw: AtomicU64,
    next_identity: AtomicU64,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            registered: Mutex::new(HashSet::new()),
            registrations: AtomicUsize::new(0),
            deregistrations: AtomicUsize::new(0),
            fail_registration: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            // Raw 0 is the bridge's root pseudo-handle; never issue it.
            next_raw: AtomicU64::new(1),
            next_identity: AtomicU64::new(1),
        }
    }

    // ─── Instrumentation ─────────────────────────────────────────────

    pub fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn deregistration_count(&self) -> usize {
        self.deregistrations.load(Ordering::SeqCst)
    }

    /// Make every subsequent `register_thread` fail.
    pub fn set_fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of every call executed so far.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    /// Distinct thread ids that have executed calls.
    pub fn call_threads(&self) -> HashSet<ThreadId> {
        self.calls.lock().iter().map(|c| c.thread).collect()
    }

    /// Whether a raw handle has been released.
    pub fn is_released(&self, handle: NativeHandle) -> bool {
        self.state.lock().released.contains(&handle.raw)
    }

    pub fn saved(&self, record_identity: u64) -> bool {
        self.state
            .lock()
            .records
            .get(&record_identity)
            .map(|r| r.saved)
            .unwrap_or(false)
    }

    // ─── Seeding ─────────────────────────────────────────────────────

    /// Create a container (with its default "All" view) without going
    /// through the bridge.
    pub fn seed_container(&self, address: &str) {
        let key = normalize_address(address);
        let identity = self.alloc_identity();
        let mut state = self.state.lock();
        let container = state.containers.entry(key).or_insert_with(|| ContainerState {
            identity,
            ..ContainerState::default()
        });
        container.views.insert("All".to_string());
    }

    /// Create a record directly. `key` lands in the record's `Key` property
    /// so `RecordByKey` finds it. Returns the record's native identity.
    pub fn seed_record(
        &self,
        address: &str,
        key: &str,
        properties: Vec<(&str, NativeValue)>,
    ) -> u64 {
        self.seed_container(address);
        let container_key = normalize_address(address);
        let identity = self.alloc_identity();
        let mut props: BTreeMap<String, NativeValue> = properties
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        props.insert("Key".to_string(), NativeValue::Text(key.to_string()));
        let mut state = self.state.lock();
        state.records.insert(
            identity,
            RecordState {
                container: container_key.clone(),
                properties: props,
                saved: true,
            },
        );
        state
            .containers
            .get_mut(&container_key)
            .expect("seeded container")
            .order
            .push(identity);
        identity
    }

    /// Bump a container's logical identity while leaving its address
    /// untouched: the next open of the same address reports a divergent
    /// identity, which the bridge must treat as staleness.
    pub fn diverge_identity(&self, address: &str) {
        let fresh = self.alloc_identity();
        let key = normalize_address(address);
        let mut state = self.state.lock();
        if let Some(container) = state.containers.get_mut(&key) {
            container.identity = fresh;
        }
    }

    // ─── Internals ───────────────────────────────────────────────────

    fn alloc_raw(&self) -> u64 {
        self.next_raw.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc_identity(&self) -> u64 {
        self.next_identity.fetch_add(1, Ordering::Relaxed)
    }

    fn issue(&self, state: &mut MockState, kind: HandleKind, target: Target) -> NativeHandle {
        let raw = self.alloc_raw();
        state.targets.insert(raw, target);
        NativeHandle { raw, kind }
    }

    fn text_arg(op: NativeOp, args: &[NativeValue], index: usize) -> Result<String, NativeError> {
        match args.get(index) {
            Some(NativeValue::Text(s)) => Ok(s.clone()),
            other => Err(NativeError::BadArgument {
                op,
                detail: format!("expected text at {index}, got {other:?}"),
            }),
        }
    }

    fn record_id(
        state: &MockState,
        target: NativeHandle,
        op: NativeOp,
    ) -> Result<u64, NativeError> {
        match state.targets.get(&target.raw) {
            Some(Target::Record(id)) => Ok(*id),
            _ => Err(NativeError::Unsupported { op, target }),
        }
    }

    fn container_key(
        state: &MockState,
        target: NativeHandle,
        op: NativeOp,
    ) -> Result<String, NativeError> {
        match state.targets.get(&target.raw) {
            Some(Target::Container(key)) => Ok(key.clone()),
            _ => Err(NativeError::Unsupported { op, target }),
        }
    }
}

impl NativeRuntime for MockRuntime {
    fn register_thread(&self) -> Result<(), NativeError> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(NativeError::Registration(
                "runtime refused thread registration".to_string(),
            ));
        }
        self.registered.lock().insert(thread::current().id());
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_thread(&self) {
        self.registered.lock().remove(&thread::current().id());
        self.deregistrations.fetch_add(1, Ordering::SeqCst);
    }

    fn call(
        &self,
        target: NativeHandle,
        op: NativeOp,
        args: &[NativeValue],
    ) -> Result<NativeValue, NativeError> {
        let current = thread::current().id();
        if !self.registered.lock().contains(&current) {
            return Err(NativeError::Api(format!(
                "{op} called from an unregistered thread"
            )));
        }
        self.calls.lock().push(CallRecord {
            target,
            op,
            thread: current,
        });

        let mut state = self.state.lock();

        if state.released.contains(&target.raw) {
            return Err(NativeError::UnknownHandle(target));
        }
        if op != NativeOp::OpenSession && !state.targets.contains_key(&target.raw) {
            return Err(NativeError::UnknownHandle(target));
        }

        match op {
            NativeOp::OpenSession => {
                let identity = self.alloc_identity();
                let handle = self.issue(&mut state, HandleKind::Session, Target::Session);
                Ok(NativeValue::Handle(HandleDescriptor::new(handle, identity)))
            }

            NativeOp::OpenContainer => {
                let key = normalize_address(&Self::text_arg(op, args, 0)?);
                let identity = match state.containers.get(&key) {
                    Some(container) => container.identity,
                    None => {
                        let identity = self.alloc_identity();
                        let mut container = ContainerState {
                            identity,
                            ..ContainerState::default()
                        };
                        container.views.insert("All".to_string());
                        state.containers.insert(key.clone(), container);
                        identity
                    }
                };
                // A fresh raw handle on every open: containers are
                // reopenable resources.
                let handle =
                    self.issue(&mut state, HandleKind::Container, Target::Container(key.clone()));
                Ok(NativeValue::Handle(HandleDescriptor::with_address(
                    handle, identity, key,
                )))
            }

            NativeOp::CreateRecord => {
                let key = Self::container_key(&state, target, op)?;
                let identity = self.alloc_identity();
                state.records.insert(
                    identity,
                    RecordState {
                        container: key.clone(),
                        properties: BTreeMap::new(),
                        saved: false,
                    },
                );
                state
                    .containers
                    .get_mut(&key)
                    .expect("container exists")
                    .order
                    .push(identity);
                let handle = self.issue(&mut state, HandleKind::Record, Target::Record(identity));
                Ok(NativeValue::Handle(HandleDescriptor::new(handle, identity)))
            }

            NativeOp::RecordByKey => {
                let container = Self::container_key(&state, target, op)?;
                let wanted = NativeValue::Text(Self::text_arg(op, args, 0)?);
                let order = state
                    .containers
                    .get(&container)
                    .map(|c| c.order.clone())
                    .unwrap_or_default();
                let found = order.into_iter().find(|id| {
                    state
                        .records
                        .get(id)
                        .and_then(|r| r.properties.get("Key"))
                        == Some(&wanted)
                });
                match found {
                    Some(id) => {
                        let handle =
                            self.issue(&mut state, HandleKind::Record, Target::Record(id));
                        Ok(NativeValue::Handle(HandleDescriptor::new(handle, id)))
                    }
                    None => Ok(NativeValue::Null),
                }
            }

            NativeOp::ReadProperty => {
                let id = Self::record_id(&state, target, op)?;
                let name = Self::text_arg(op, args, 0)?;
                let record = state
                    .records
                    .get(&id)
                    .ok_or(NativeError::UnknownHandle(target))?;
                Ok(record.properties.get(&name).cloned().unwrap_or(NativeValue::Null))
            }

            NativeOp::WriteProperty => {
                let id = Self::record_id(&state, target, op)?;
                let name = Self::text_arg(op, args, 0)?;
                let value = args.get(1).cloned().unwrap_or(NativeValue::Null);
                let record = state
                    .records
                    .get_mut(&id)
                    .ok_or(NativeError::UnknownHandle(target))?;
                record.properties.insert(name, value);
                record.saved = false;
                Ok(NativeValue::Null)
            }

            NativeOp::SaveRecord => {
                let id = Self::record_id(&state, target, op)?;
                let record = state
                    .records
                    .get_mut(&id)
                    .ok_or(NativeError::UnknownHandle(target))?;
                record.saved = true;
                Ok(NativeValue::Null)
            }

            NativeOp::RemoveRecord => {
                let id = Self::record_id(&state, target, op)?;
                let record = state
                    .records
                    .remove(&id)
                    .ok_or(NativeError::UnknownHandle(target))?;
                if let Some(container) = state.containers.get_mut(&record.container) {
                    container.order.retain(|other| *other != id);
                }
                Ok(NativeValue::Null)
            }

            NativeOp::OpenView => {
                let container = Self::container_key(&state, target, op)?;
                let name = Self::text_arg(op, args, 0)?;
                let exists = state
                    .containers
                    .get(&container)
                    .map(|c| c.views.contains(&name))
                    .unwrap_or(false);
                if !exists {
                    return Ok(NativeValue::Null);
                }
                let view_key = (container.clone(), name);
                let identity = match state.view_identities.get(&view_key) {
                    Some(identity) => *identity,
                    None => {
                        let identity = self.alloc_identity();
                        state.view_identities.insert(view_key, identity);
                        identity
                    }
                };
                let handle =
                    self.issue(&mut state, HandleKind::View, Target::View { container });
                Ok(NativeValue::Handle(HandleDescriptor::new(handle, identity)))
            }

            NativeOp::FirstEntry | NativeOp::NextEntry => {
                let container = match state.targets.get(&target.raw) {
                    Some(Target::View { container }) => container.clone(),
                    _ => return Err(NativeError::Unsupported { op, target }),
                };
                let order = state
                    .containers
                    .get(&container)
                    .map(|c| c.order.clone())
                    .unwrap_or_default();
                let next = if op == NativeOp::FirstEntry {
                    order.first().copied()
                } else {
                    let current = match args.first() {
                        Some(NativeValue::Handle(d)) => d.identity,
                        other => {
                            return Err(NativeError::BadArgument {
                                op,
                                detail: format!("expected record handle, got {other:?}"),
                            });
                        }
                    };
                    order
                        .iter()
                        .position(|id| *id == current)
                        .and_then(|pos| order.get(pos + 1).copied())
                };
                match next {
                    Some(id) => {
                        let handle =
                            self.issue(&mut state, HandleKind::Record, Target::Record(id));
                        Ok(NativeValue::Handle(HandleDescriptor::new(handle, id)))
                    }
                    None => Ok(NativeValue::Null),
                }
            }

            NativeOp::FirstItem => {
                let id = Self::record_id(&state, target, op)?;
                let first = state
                    .records
                    .get(&id)
                    .and_then(|r| r.properties.keys().next().cloned());
                match first {
                    Some(name) => {
                        let item_key = (id, name.clone());
                        let identity = match state.item_identities.get(&item_key) {
                            Some(identity) => *identity,
                            None => {
                                let identity = self.alloc_identity();
                                state.item_identities.insert(item_key, identity);
                                identity
                            }
                        };
                        let handle = self.issue(
                            &mut state,
                            HandleKind::Item,
                            Target::Item { record: id, name },
                        );
                        Ok(NativeValue::Handle(HandleDescriptor::new(handle, identity)))
                    }
                    None => Ok(NativeValue::Null),
                }
            }

            NativeOp::ItemValue => {
                let (record, name) = match state.targets.get(&target.raw) {
                    Some(Target::Item { record, name }) => (*record, name.clone()),
                    _ => return Err(NativeError::Unsupported { op, target }),
                };
                let value = state
                    .records
                    .get(&record)
                    .and_then(|r| r.properties.get(&name))
                    .cloned()
                    .unwrap_or(NativeValue::Null);
                Ok(value)
            }

            NativeOp::ContainerOfRecord => {
                let id = Self::record_id(&state, target, op)?;
                let key = state
                    .records
                    .get(&id)
                    .map(|r| r.container.clone())
                    .ok_or(NativeError::UnknownHandle(target))?;
                let identity = state
                    .containers
                    .get(&key)
                    .map(|c| c.identity)
                    .ok_or(NativeError::Api(format!("container {key} vanished")))?;
                let handle =
                    self.issue(&mut state, HandleKind::Container, Target::Container(key.clone()));
                Ok(NativeValue::Handle(HandleDescriptor::with_address(
                    handle, identity, key,
                )))
            }

            NativeOp::Release => {
                // Double release of the same raw handle is a native fault;
                // the managed layer is expected to never let one through.
                if !state.released.insert(target.raw) {
                    return Err(NativeError::UnknownHandle(target));
                }
                Ok(NativeValue::Null)
            }
        }
    }
}
