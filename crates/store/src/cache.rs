//! Small string cache with per-entry expiry.

use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

#[derive(Default)]
pub struct TtlCache {
    entries: Mutex<FxHashMap<String, (Instant, String)>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((expires, v)) if Instant::now() < *expires => Some(v.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: String, ttl: Duration) {
        self.entries.lock().insert(key.to_string(), (Instant::now() + ttl, value));
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = TtlCache::new();
        cache.set("watchable_resources", "[]".into(), Duration::from_secs(900));
        assert_eq!(cache.get("watchable_resources").as_deref(), Some("[]"));
        tokio::time::advance(Duration::from_secs(899)).await;
        assert!(cache.get("watchable_resources").is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("watchable_resources").is_none());
    }

    #[test]
    fn invalidate_removes() {
        let cache = TtlCache::new();
        cache.set("k", "v".into(), Duration::from_secs(60));
        cache.invalidate("k");
        assert!(cache.get("k").is_none());
    }
}
