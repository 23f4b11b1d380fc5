use crate::data::Dict;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Decoded line payloads keyed by line hash.
///
/// Published lines are immutable, so entries are never invalidated. The cache
/// is unbounded unless built with a capacity, in which case the least recently
/// used line is evicted first.
pub struct DictCache {
    entries: Mutex<LruCache<String, Arc<Dict>>>,
}

impl DictCache {
    pub fn unbounded() -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, hash: &str) -> Option<Arc<Dict>> {
        self.entries.lock().get(hash).cloned()
    }

    pub fn insert(&self, hash: impl Into<String>, dict: Dict) -> Arc<Dict> {
        let dict = Arc::new(dict);
        self.entries.lock().put(hash.into(), Arc::clone(&dict));
        dict
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for DictCache {
    fn default() -> Self {
        Self::unbounded()
    }
}
