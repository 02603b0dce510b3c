use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    hash::Hash,
};

type EvictedFn<K, V> = Box<dyn Fn(K, V) + Send>;

struct Entry<V> {
    value: V,
    weight: u64,
    tick: u64,
}

/// A weight-bounded LRU cache. Every entry carries a caller-supplied weight
/// (bytes for parsed indices and manifests, 1 for file handles); inserting
/// past the capacity evicts least-recently-used entries until the total
/// weight fits again.
///
/// Values are cheap to clone (`Arc`s in practice), so `get` hands out a
/// clone rather than a borrow. An evicted value whose clones are still held
/// elsewhere stays alive until the last holder drops it; eviction only
/// removes the cache's own reference.
pub struct Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    capacity: u64,
    used: u64,
    tick: u64,
    entries: HashMap<K, Entry<V>>,
    /// recency order: tick -> key, oldest first
    order: BTreeMap<u64, K>,
    evicted_fn: Option<EvictedFn<K, V>>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new(capacity: u64, evicted_fn: Option<EvictedFn<K, V>>) -> Self {
        Cache {
            capacity,
            used: 0,
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            evicted_fn,
            stats: Stats::new(),
        }
    }

    /// Returns a clone of the value for the given key, refreshing its
    /// recency, if it is present.
    pub fn get(&mut self, key: &K) -> Option<V> {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.clone());
            self.stats.hits += 1;
            Some(entry.value.clone())
        } else {
            self.stats.misses += 1;
            None
        }
    }

    /// Inserts an entry with the given weight, evicting older entries as
    /// needed. Entries heavier than the whole capacity are not cached.
    pub fn insert(&mut self, key: K, value: V, weight: u64) {
        if weight > self.capacity {
            return;
        }
        self.remove(&key);
        self.tick += 1;
        self.order.insert(self.tick, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                weight,
                tick: self.tick,
            },
        );
        self.used += weight;
        self.evict();
    }

    /// Removes an entry without invoking the eviction callback.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.used -= entry.weight;
        Some(entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// (hits, misses) counters.
    pub fn stats(&self) -> (usize, usize) {
        (self.stats.hits, self.stats.misses)
    }

    fn evict(&mut self) {
        while self.used > self.capacity {
            let (&tick, _) = self.order.iter().next().expect("over budget but empty");
            let key = self.order.remove(&tick).unwrap();
            let entry = self.entries.remove(&key).unwrap();
            self.used -= entry.weight;
            if let Some(evicted_fn) = &self.evicted_fn {
                evicted_fn(key, entry.value);
            }
        }
    }
}

struct Stats {
    hits: usize,
    misses: usize,
}

impl Stats {
    fn new() -> Self {
        Stats { hits: 0, misses: 0 }
    }
}
