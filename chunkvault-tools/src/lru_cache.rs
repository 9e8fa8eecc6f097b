//! Least recently used cache.
//!
//! Bounded map evicting the entry that has gone unused the longest.
//! Recency is tracked with a monotonic tick per access and an ordered
//! index from tick to key, so eviction picks the smallest tick.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (u64, V)>,
    recency: BTreeMap<u64, K>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            tick: 0,
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Insert or update `key`, marking it most recently used. Evicts
    /// the least recently used entry once the capacity is exceeded.
    pub fn insert(&mut self, key: K, value: V) {
        let tick = self.next_tick();

        if let Some((old_tick, _)) = self.entries.insert(key.clone(), (tick, value)) {
            self.recency.remove(&old_tick);
        }
        self.recency.insert(tick, key);

        while self.entries.len() > self.capacity {
            self.evict_oldest();
        }
    }

    /// Look up `key`, marking it most recently used on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        let (entry_tick, _) = self.entries.get_mut(key)?;
        let old_tick = std::mem::replace(entry_tick, tick);
        let moved = self.recency.remove(&old_tick).expect("recency index entry");
        self.recency.insert(tick, moved);
        self.entries.get(key).map(|(_, value)| value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (tick, value) = self.entries.remove(key)?;
        self.recency.remove(&tick);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    fn evict_oldest(&mut self) {
        if let Some((&tick, _)) = self.recency.iter().next() {
            let key = self.recency.remove(&tick).expect("oldest recency entry");
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(3);
        cache.insert(1, "one");
        cache.insert(2, "two");
        cache.insert(3, "three");

        // touch 1 so 2 becomes the oldest
        assert_eq!(cache.get(&1), Some(&"one"));

        cache.insert(4, "four");
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(&"one"));
        assert_eq!(cache.get(&4), Some(&"four"));
    }

    #[test]
    fn update_refreshes_recency() {
        let mut cache = LruCache::new(2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(1, 11);
        cache.insert(3, 30);

        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(&11));
        assert_eq!(cache.get(&3), Some(&30));
    }

    #[test]
    fn remove_and_clear() {
        let mut cache = LruCache::new(4);
        cache.insert("a", 1);
        cache.insert("b", 2);

        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.remove(&"a"), None);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
