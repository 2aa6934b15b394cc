//! Insert-if-absent registry of running watchers.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

pub const NAMESPACES_WATCHER_KEY: &str = "namespaces-watcher";

pub fn namespace_resources_key(ns: &str) -> String {
    format!("namespace-resources-{ns}")
}

pub fn namespace_labels_key(ns: &str) -> String {
    format!("namespace-labels-{ns}")
}

pub fn session_key(ns: &str, gvr_key: &str) -> String {
    format!("{}{gvr_key}", session_prefix(ns))
}

/// Prefix shared by every session key of `ns`.
pub fn session_prefix(ns: &str) -> String {
    format!("session-{ns}/")
}

#[derive(Default)]
struct Held {
    keys: FxHashMap<String, u64>,
    next_gen: u64,
}

#[derive(Clone, Default)]
pub struct WatcherRegistry {
    held: Arc<Mutex<Held>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and register in one step; `None` when the key is already held.
    pub fn try_register(&self, key: impl Into<String>) -> Option<RegistryGuard> {
        let key = key.into();
        let mut held = self.held.lock();
        if held.keys.contains_key(&key) {
            return None;
        }
        held.next_gen += 1;
        let generation = held.next_gen;
        held.keys.insert(key.clone(), generation);
        Some(RegistryGuard { registry: self.clone(), key, generation })
    }

    /// Free `key` now; the outstanding guard becomes stale and its drop is a no-op.
    pub fn release(&self, key: &str) -> bool {
        self.held.lock().keys.remove(key).is_some()
    }

    /// Free every key starting with `prefix`; returns how many were held.
    pub fn release_prefix(&self, prefix: &str) -> usize {
        let mut held = self.held.lock();
        let before = held.keys.len();
        held.keys.retain(|k, _| !k.starts_with(prefix));
        before - held.keys.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.held.lock().keys.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.held.lock().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a registry key; releases it on drop unless it was released and re-taken meanwhile.
pub struct RegistryGuard {
    registry: WatcherRegistry,
    key: String,
    generation: u64,
}

impl RegistryGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let mut held = self.registry.held.lock();
        if held.keys.get(&self.key) == Some(&self.generation) {
            held.keys.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_registration_is_refused_until_release() {
        let reg = WatcherRegistry::new();
        let g = reg.try_register(namespace_resources_key("prod")).expect("first");
        assert!(reg.try_register("namespace-resources-prod").is_none());
        assert!(reg.contains("namespace-resources-prod"));
        drop(g);
        assert!(reg.try_register("namespace-resources-prod").is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn concurrent_registration_has_one_winner() {
        let reg = WatcherRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.try_register(NAMESPACES_WATCHER_KEY).map(std::mem::forget).is_some())
            })
            .collect();
        let winners: Vec<bool> = handles.into_iter().map(|h| h.join().expect("join")).collect();
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);
    }

    #[test]
    fn released_key_is_not_freed_again_by_its_stale_guard() {
        let reg = WatcherRegistry::new();
        let stale = reg.try_register(namespace_resources_key("prod")).expect("first");
        assert!(reg.release("namespace-resources-prod"));
        let fresh = reg.try_register(namespace_resources_key("prod")).expect("re-taken after release");
        drop(stale);
        assert!(reg.contains("namespace-resources-prod"));
        assert!(reg.try_register(namespace_resources_key("prod")).is_none());
        drop(fresh);
        assert!(reg.is_empty());
    }

    #[test]
    fn prefix_release_leaves_similar_namespaces_alone() {
        let reg = WatcherRegistry::new();
        let _a = reg.try_register(session_key("prod", ".v1/pods")).expect("prod pods");
        let _b = reg.try_register(session_key("prod", "apps.v1/deployments")).expect("prod deployments");
        let _c = reg.try_register(session_key("prod-eu", ".v1/pods")).expect("prod-eu pods");
        assert_eq!(reg.release_prefix(&session_prefix("prod")), 2);
        assert!(reg.contains(&session_key("prod-eu", ".v1/pods")));
        assert_eq!(reg.len(), 1);
    }
}
