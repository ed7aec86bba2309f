//! # registry
//!
//! Process-wide map of live gateway sessions, keyed by the 16-character
//! gateway id (§3 invariant, §5). Registering an already-present key evicts
//! and disconnects the incumbent and suppresses its MQTT reconnection —
//! modelled here as a weak handle so the registry can't outlive a task it no
//! longer owns (§9 design note).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::{info, warn};

/// Anything a `GatewaySession` exposes to the registry for eviction.
pub trait Evictable: Send + Sync {
    /// Called when a newer session registers under the same gateway id.
    /// Implementations disconnect the socket and suppress MQTT reconnection.
    fn evict(&self);
}

#[derive(Default)]
pub struct GatewayRegistry {
    sessions: Mutex<HashMap<String, Weak<dyn Evictable>>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` under `gateway_id`. If a live session is already
    /// registered under that key, it is evicted first.
    pub fn register(&self, gateway_id: &str, session: Arc<dyn Evictable>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(gateway_id).and_then(Weak::upgrade) {
            warn!(gateway_id, "duplicate gateway registration, evicting prior session");
            existing.evict();
        }
        info!(gateway_id, "gateway session registered");
        sessions.insert(gateway_id.to_string(), Arc::downgrade(&session));
    }

    /// Removes `gateway_id` from the registry, but only if `session` is still
    /// the one registered (a stale disconnect racing a newer registration
    /// must not evict the newer session).
    pub fn deregister(&self, gateway_id: &str, session: &Arc<dyn Evictable>) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(current) = sessions.get(gateway_id).and_then(Weak::upgrade) {
            if Arc::ptr_eq(&current, session) {
                sessions.remove(gateway_id);
            }
        }
    }

    pub fn is_registered(&self, gateway_id: &str) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(gateway_id).map(Weak::upgrade).map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSession {
        evictions: Arc<AtomicUsize>,
    }

    impl Evictable for FakeSession {
        fn evict(&self) {
            self.evictions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_registration_evicts_incumbent() {
        let registry = GatewayRegistry::new();
        let evictions = Arc::new(AtomicUsize::new(0));

        let first: Arc<dyn Evictable> = Arc::new(FakeSession { evictions: evictions.clone() });
        registry.register("GATEWAY0000000001", first.clone());
        assert_eq!(evictions.load(Ordering::SeqCst), 0);

        let second: Arc<dyn Evictable> = Arc::new(FakeSession { evictions: evictions.clone() });
        registry.register("GATEWAY0000000001", second.clone());
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert!(registry.is_registered("GATEWAY0000000001"));
    }

    #[test]
    fn stale_deregister_does_not_remove_newer_session() {
        let registry = GatewayRegistry::new();
        let evictions = Arc::new(AtomicUsize::new(0));

        let first: Arc<dyn Evictable> = Arc::new(FakeSession { evictions: evictions.clone() });
        registry.register("GW1", first.clone());
        let second: Arc<dyn Evictable> = Arc::new(FakeSession { evictions: evictions.clone() });
        registry.register("GW1", second.clone());

        // The stale `first` handle tries to deregister after being evicted.
        registry.deregister("GW1", &first);
        assert!(registry.is_registered("GW1"));

        registry.deregister("GW1", &second);
        assert!(!registry.is_registered("GW1"));
    }
}
