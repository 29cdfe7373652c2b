use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// Bounded memory of relay URLs that failed verification or were dropped,
/// so discovery does not retry them.
pub struct FailureCache {
    inner: Mutex<LruCache<String, ()>>,
}

impl FailureCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn record(&self, url: &str) {
        self.inner.lock().put(url.to_string(), ());
    }

    pub fn contains(&self, url: &str) -> bool {
        self.inner.lock().contains(url)
    }

    pub fn forget(&self, url: &str) {
        self.inner.lock().pop(url);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_recorded() {
        let cache = FailureCache::new(2);
        cache.record("wss://a");
        cache.record("wss://b");
        cache.record("wss://c");
        assert!(!cache.contains("wss://a"));
        assert!(cache.contains("wss://b"));
        assert!(cache.contains("wss://c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn forget_removes_entry() {
        let cache = FailureCache::new(4);
        cache.record("wss://a");
        cache.forget("wss://a");
        assert!(cache.is_empty());
    }
}
