//! Weak-referenced identity registry: one live proxy per logical resource.
//!
//! The cache is an optimization layer and behaves like one: every lookup is
//! best-effort, every internal anomaly degrades to a miss after a log line,
//! and entries never keep a proxy alive — they hold `Weak` references so
//! unused wrappers stay collectable.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};

use crate::handle::HandleDescriptor;
use crate::proxy::ProxyCore;

/// Key under which a proxy is registered.
///
/// Stable-handle resources key on the native identity the runtime reports.
/// Reopenable resources key on their normalized logical address, so two
/// different handle values for "the same place" collide on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Identity(u64),
    Address(String),
}

impl CacheKey {
    pub fn for_descriptor(descriptor: &HandleDescriptor) -> Self {
        match &descriptor.address {
            Some(address) => CacheKey::Address(normalize_address(address)),
            None => CacheKey::Identity(descriptor.identity),
        }
    }
}

/// Unify separators and casing so equivalent addresses collide.
pub fn normalize_address(raw: &str) -> String {
    raw.trim().replace('\\', "/").to_ascii_lowercase()
}

struct CacheEntry {
    /// Identity recorded when the entry was stored; compared against a
    /// freshly supplied descriptor on every verified hit.
    identity: u64,
    proxy: Weak<ProxyCore>,
}

#[derive(Default)]
pub struct IdentityCache {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic lookup-or-create against a freshly supplied handle descriptor.
    ///
    /// The whole miss-and-insert runs under the key's entry guard, so
    /// concurrent callers wrapping the same resource converge on one proxy.
    /// A collected entry is a miss. A hit whose recorded identity differs
    /// from the fresh descriptor's identity is stale: it is replaced with a
    /// warning. Never fails — cache trouble must not fail a call.
    ///
    /// `create` runs under the entry guard and must not touch the cache.
    pub fn get_or_create(
        &self,
        descriptor: &HandleDescriptor,
        create: impl FnOnce() -> Arc<ProxyCore>,
    ) -> Arc<ProxyCore> {
        let key = CacheKey::for_descriptor(descriptor);
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get();
                if entry.identity == descriptor.identity {
                    if let Some(core) = entry.proxy.upgrade() {
                        return core;
                    }
                    // collected: plain miss, replaced below
                } else {
                    tracing::warn!(
                        key = ?occupied.key(),
                        cached = entry.identity,
                        fresh = descriptor.identity,
                        "stale identity cache entry evicted"
                    );
                }
                let core = create();
                occupied.insert(CacheEntry {
                    identity: descriptor.identity,
                    proxy: Arc::downgrade(&core),
                });
                core
            }
            Entry::Vacant(vacant) => {
                let core = create();
                vacant.insert(CacheEntry {
                    identity: descriptor.identity,
                    proxy: Arc::downgrade(&core),
                });
                core
            }
        }
    }

    /// The handle owned by the live proxy registered under `key`, if any.
    /// Used by bulk release to tell a proxy-owned handle from a spare one.
    pub fn live_handle(&self, key: &CacheKey) -> Option<crate::handle::NativeHandle> {
        let entry = self.entries.get(key)?;
        entry.proxy.upgrade().map(|core| core.handle())
    }

    /// Drop entries whose proxies have been collected.
    pub fn prune(&self) {
        self.entries.retain(|_, entry| entry.proxy.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HandleKind, NativeHandle};

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address(r" Srv01!!Mail\Team.box "),
            "srv01!!mail/team.box"
        );
        assert_eq!(normalize_address("srv01!!mail/team.box"), "srv01!!mail/team.box");
    }

    #[test]
    fn test_key_derivation() {
        let h = NativeHandle {
            raw: 10,
            kind: HandleKind::Container,
        };
        let with_addr = HandleDescriptor::with_address(h, 5, r"Srv\a.box");
        assert_eq!(
            CacheKey::for_descriptor(&with_addr),
            CacheKey::Address("srv/a.box".to_string())
        );

        let h = NativeHandle {
            raw: 11,
            kind: HandleKind::Record,
        };
        let stable = HandleDescriptor::new(h, 99);
        assert_eq!(CacheKey::for_descriptor(&stable), CacheKey::Identity(99));
    }
}
