use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One TTL cache region: an unordered map from key to (value, insert time).
///
/// Reads never extend an entry's life; expired entries are dropped lazily
/// on read and eagerly by [`TtlCache::sweep`]. The cache is strictly
/// subordinate to the store — writers invalidate, readers repopulate.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, (V, Instant)>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some((value, inserted)) if inserted.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.into(), (value, Instant::now()));
    }

    /// Removing an absent key is a no-op, so invalidation is idempotent.
    pub fn invalidate(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn invalidate_all(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Drop every entry older than the TTL; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, (_, inserted)| inserted.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_then_invalidate() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(300));
        cache.insert("k", "v".to_string());
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        cache.invalidate("k");
        assert!(cache.get("k").is_none());
        // idempotent
        cache.invalidate("k");
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn expired_entries_miss_and_sweep() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_millis(0));
        cache.insert("k", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());

        cache.insert("a", 1);
        cache.insert("b", 2);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.sweep(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn fresh_entries_survive_sweep() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(300));
        cache.insert("k", 7);
        assert_eq!(cache.sweep(), 0);
        assert_eq!(cache.get("k"), Some(7));
    }
}
