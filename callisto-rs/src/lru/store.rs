use linked_hash_map::LinkedHashMap;

use crate::view::ByteView;

/// Invoked after an entry has been evicted, receiving the key and value which were removed.
pub type EvictionHook = Box<dyn FnMut(&str, &ByteView) + Send>;

/// Provides a size constrained LRU store for byte valued entries.
///
/// The store keeps its entries in recency order and maintains a byte counter which always
/// equals the sum of `key.len() + value.len()` over all resident entries. After every write
/// the least recently used entries are dropped until the counter is back within the capacity.
/// A capacity of zero disables eviction entirely.
///
/// Reads count as accesses: [get](LruStore::get) refreshes the recency of the entry it
/// returns.
///
/// # Examples
/// ```
/// # use callisto::lru::LruStore;
/// # use callisto::view::ByteView;
/// // Room for exactly two of the entries below (8 bytes each)...
/// let mut store = LruStore::new(16);
///
/// store.add("Tom", ByteView::from("63000"));
/// store.add("Jack", ByteView::from("5890"));
/// assert_eq!(store.len(), 2);
///
/// // ...so a third insert evicts the least recently used one.
/// store.add("Sam", ByteView::from("56700"));
/// assert_eq!(store.len(), 2);
/// assert!(store.get("Tom").is_none());
/// ```
pub struct LruStore {
    capacity: usize,
    used: usize,
    map: LinkedHashMap<String, ByteView>,
    eviction_hook: Option<EvictionHook>,
}

impl LruStore {
    /// Creates a store which keeps at most **capacity** bytes of keys and values.
    ///
    /// A capacity of zero yields an unbounded store.
    pub fn new(capacity: usize) -> Self {
        LruStore {
            capacity,
            used: 0,
            map: LinkedHashMap::new(),
            eviction_hook: None,
        }
    }

    /// Creates a store which additionally reports every evicted entry to the given hook.
    ///
    /// The hook fires after the entry has been unlinked, therefore the store is fully
    /// consistent when it runs. Entries replaced by [add](LruStore::add) do not count as
    /// evictions.
    pub fn with_eviction_hook(capacity: usize, hook: EvictionHook) -> Self {
        LruStore {
            capacity,
            used: 0,
            map: LinkedHashMap::new(),
            eviction_hook: Some(hook),
        }
    }

    /// Stores the given value for the given key.
    ///
    /// If the key is already present, its value is replaced, the byte counter is adjusted by
    /// the size difference and the entry becomes the most recently used one. Otherwise a new
    /// entry is created. Either way, least recently used entries are evicted afterwards until
    /// the store is within its capacity again.
    ///
    /// Note that an entry which on its own exceeds the capacity is still admitted - it evicts
    /// everything else and remains resident until a later write pushes it out.
    pub fn add(&mut self, key: &str, value: ByteView) {
        if let Some(slot) = self.map.get_refresh(key) {
            self.used = self.used - slot.len() + value.len();
            *slot = value;
        } else {
            self.used += key.len() + value.len();
            let _ = self.map.insert(key.to_owned(), value);
        }

        self.enforce_capacity();
    }

    /// Returns the value stored for the given key and marks it as recently used.
    pub fn get(&mut self, key: &str) -> Option<&ByteView> {
        match self.map.get_refresh(key) {
            Some(value) => Some(&*value),
            None => None,
        }
    }

    /// Evicts the least recently used entry (if the store is non-empty).
    ///
    /// The eviction hook (if any) is invoked once the entry has been removed.
    pub fn remove_oldest(&mut self) {
        if let Some((key, value)) = self.map.pop_front() {
            self.used -= key.len() + value.len();
            if let Some(hook) = self.eviction_hook.as_mut() {
                hook(&key, &value);
            }
        }
    }

    fn enforce_capacity(&mut self) {
        // The most recently written entry is never evicted by its own insert, even if it
        // exceeds the capacity on its own. It stays resident until a later write pushes it out.
        while self.capacity > 0 && self.used > self.capacity && self.map.len() > 1 {
            self.remove_oldest();
        }
    }

    /// Returns the number of resident entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the number of bytes currently accounted for keys and values.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Returns the configured capacity in bytes (zero meaning unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
