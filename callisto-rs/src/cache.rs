//! Provides the thread safe shell around the LRU store.
//!
//! A [ValueCache] serializes all accesses to an [LruStore](crate::lru::LruStore) behind a
//! mutex. The store itself is created lazily on the first write, therefore a group which never
//! caches anything never allocates a store either.
use std::sync::Mutex;

use crate::lru::LruStore;
use crate::view::ByteView;

/// A mutex guarded, lazily initialized LRU store.
///
/// Every operation acquires the mutex for its full duration, so the recency bookkeeping of the
/// underlying store is never observed in an intermediate state. Note that the lock is only held
/// for in-memory work - loading values is the business of the surrounding group and happens
/// outside of it.
pub struct ValueCache {
    capacity: usize,
    store: Mutex<Option<LruStore>>,
}

impl ValueCache {
    /// Creates a shell which will cap its store at **capacity** bytes (zero meaning unbounded).
    pub fn new(capacity: usize) -> Self {
        ValueCache {
            capacity,
            store: Mutex::new(None),
        }
    }

    /// Stores the given value, creating the underlying store on first use.
    pub fn add(&self, key: &str, value: ByteView) {
        let mut guard = self.store.lock().unwrap();
        guard
            .get_or_insert_with(|| LruStore::new(self.capacity))
            .add(key, value);
    }

    /// Returns the cached value for the given key.
    ///
    /// A shell which has never been written to answers without allocating the store.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        let mut guard = self.store.lock().unwrap();
        guard.as_mut().and_then(|store| store.get(key).cloned())
    }

    /// Returns the number of resident entries.
    pub fn len(&self) -> usize {
        let guard = self.store.lock().unwrap();
        guard.as_ref().map(LruStore::len).unwrap_or(0)
    }

    /// Determines if nothing is cached (including the never-written state).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
