//! Deterministic release protocol for native handles.
//!
//! The host allocator cannot see native-side resources, so every handle the
//! runtime hands out is tracked here in creation order and given back
//! explicitly — one at a time, in bulk from a barrier, or wholesale at
//! session close. Release is idempotent at this level: a second release of
//! the same handle is a logged no-op, and the per-handle state machine is
//! strictly `Live -> Released` with no way back.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::cache::{CacheKey, IdentityCache};
use crate::dispatch::Dispatcher;
use crate::handle::{HandleDescriptor, NativeHandle};
use crate::runtime::NativeOp;

/// Marker into the creation log. Handles created after the barrier are
/// candidates for [`HandleLifecycle::bulk_release`].
#[derive(Debug, Clone, Copy)]
pub struct Barrier(usize);

#[derive(Default)]
struct LifecycleState {
    /// Every handle the runtime has handed out, in creation order.
    created: Vec<HandleDescriptor>,
    /// Raw handles already logged in `created`.
    seen: HashSet<NativeHandle>,
    /// Raw handles in the `Released` state.
    released: HashSet<NativeHandle>,
}

#[derive(Default)]
pub struct HandleLifecycle {
    state: Mutex<LifecycleState>,
}

impl HandleLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log a handle crossing the boundary. Called for every handle-typed
    /// descriptor the runtime returns, including spare handles for a
    /// resource that already has a live proxy.
    pub fn track(&self, descriptor: &HandleDescriptor) {
        let mut state = self.state.lock();
        if state.seen.insert(descriptor.handle) {
            state.created.push(descriptor.clone());
        }
    }

    pub fn is_released(&self, handle: NativeHandle) -> bool {
        self.state.lock().released.contains(&handle)
    }

    /// Release one handle. Idempotent: the transition to `Released` happens
    /// at most once, and only the transitioning call dispatches the native
    /// release. A native-side release failure is logged, never raised — the
    /// managed state is `Released` either way.
    pub fn release(&self, dispatcher: &Dispatcher, handle: NativeHandle) {
        {
            let mut state = self.state.lock();
            if !state.released.insert(handle) {
                tracing::debug!(?handle, "release skipped: already released");
                return;
            }
        }
        match dispatcher.invoke(handle, NativeOp::Release, vec![]) {
            Ok(_) => tracing::debug!(?handle, "handle released"),
            Err(e) => tracing::warn!(?handle, error = %e, "native release failed"),
        }
    }

    /// Current position in the creation log.
    pub fn barrier(&self) -> Barrier {
        Barrier(self.state.lock().created.len())
    }

    /// Release every handle created since `barrier` that is not the handle
    /// of a live proxy. Spare handles for an already-proxied resource (a
    /// reopen that hit the cache) are released too — no live proxy owns
    /// them. Returns the number of handles released.
    pub fn bulk_release(
        &self,
        dispatcher: &Dispatcher,
        cache: &IdentityCache,
        barrier: Barrier,
    ) -> usize {
        let victims: Vec<NativeHandle> = {
            let state = self.state.lock();
            let from = barrier.0.min(state.created.len());
            state.created[from..]
                .iter()
                .filter(|d| !state.released.contains(&d.handle))
                .filter(|d| {
                    let key = CacheKey::for_descriptor(d);
                    cache.live_handle(&key) != Some(d.handle)
                })
                .map(|d| d.handle)
                .collect()
        };
        let count = victims.len();
        for handle in victims {
            self.release(dispatcher, handle);
        }
        if count > 0 {
            tracing::debug!(count, "bulk release completed");
        }
        count
    }

    /// Release every tracked handle still live, regardless of proxies.
    /// Session-close path. Returns the number of handles released.
    pub fn release_all(&self, dispatcher: &Dispatcher) -> usize {
        let victims: Vec<NativeHandle> = {
            let state = self.state.lock();
            state
                .created
                .iter()
                .filter(|d| !state.released.contains(&d.handle))
                .map(|d| d.handle)
                .collect()
        };
        let count = victims.len();
        // Newest first: children before their parents.
        for handle in victims.into_iter().rev() {
            self.release(dispatcher, handle);
        }
        count
    }
}
