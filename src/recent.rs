//! Capacity-bounded keyed map that forgets the least recently written entry
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug)]
pub struct RecentMap<K, V> {
    capacity: usize,
    next_seq: u64,
    entries: HashMap<K, (u64, V)>,
    // write sequence -> key, oldest first
    order: BTreeMap<u64, K>,
}

impl<K: Hash + Eq + Clone, V> RecentMap<K, V> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, v)| v)
    }

    /// Mutable access that does not count as a write for eviction purposes.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key).map(|(_, v)| v)
    }

    /// Inserts or replaces `key`, marking it most recent. Evicts the oldest
    /// entries once over capacity.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let previous = self.entries.insert(key.clone(), (seq, value));
        if let Some((old_seq, _)) = &previous {
            self.order.remove(old_seq);
        }
        self.order.insert(seq, key);

        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        previous.map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (seq, value) = self.entries.remove(key)?;
        self.order.remove(&seq);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
