//! Bounded frequency counter
//!
//! Tracks hit counts for at most `capacity` distinct keys. When a new key
//! arrives at capacity, the entry with the lowest count is evicted (the
//! greatest key among equal lowest counts). Not synchronized; see
//! [`crate::aggregator::ChangeAggregator`] for the shared wrapper.

use std::collections::HashMap;
use std::hash::Hash;

/// Entries reserved up front; larger counters grow on demand.
const PREALLOCATED_ENTRIES: usize = 1024;

#[derive(Debug, Clone)]
pub struct BoundedKeyCounter<K> {
    counts: HashMap<K, i32>,
    capacity: usize,
}

impl<K> BoundedKeyCounter<K>
where
    K: Eq + Hash + Ord + Clone,
{
    /// Create a counter holding at most `capacity` keys.
    ///
    /// Returns `None` for a zero capacity, which could never count anything.
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        Some(Self {
            counts: HashMap::with_capacity(capacity.min(PREALLOCATED_ENTRIES)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<i32> {
        self.counts.get(key).copied()
    }

    /// Increment the count for `key`, evicting the coldest entry if a new key
    /// would exceed capacity.
    pub fn insert(&mut self, key: K) {
        if let Some(count) = self.counts.get_mut(&key) {
            *count = count.saturating_add(1);
            return;
        }

        if self.counts.len() >= self.capacity {
            self.evict_coldest();
        }
        self.counts.insert(key, 1);
    }

    /// Up to `n` entries ordered by descending count, then ascending key.
    pub fn get_highest(&self, n: usize) -> Vec<(K, i32)> {
        if n == 0 || self.counts.is_empty() {
            return Vec::new();
        }

        let mut entries: Vec<(&K, i32)> = self.counts.iter().map(|(k, c)| (k, *c)).collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .take(n)
            .map(|(k, c)| (k.clone(), c))
            .collect()
    }

    fn evict_coldest(&mut self) {
        let victim = self
            .counts
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(k, _)| k.clone());

        if let Some(key) = victim {
            self.counts.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(capacity: usize) -> BoundedKeyCounter<String> {
        BoundedKeyCounter::new(capacity).unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(BoundedKeyCounter::<String>::new(0).is_none());
    }

    #[test]
    fn test_huge_capacity_allocates_lazily() {
        let mut c = counter(usize::MAX / 2);
        c.insert("a".to_string());
        assert_eq!(c.capacity(), usize::MAX / 2);
        assert_eq!(c.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn test_insert_counts_hits() {
        let mut c = counter(4);
        for _ in 0..3 {
            c.insert("a".to_string());
        }
        c.insert("b".to_string());

        assert_eq!(c.get(&"a".to_string()), Some(3));
        assert_eq!(c.get(&"b".to_string()), Some(1));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut c = counter(3);
        for i in 0..100 {
            c.insert(format!("bucket-{}", i % 17));
            assert!(c.len() <= c.capacity());
        }
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn test_evicts_lowest_count_first() {
        let mut c = counter(2);
        c.insert("hot".to_string());
        c.insert("hot".to_string());
        c.insert("cold".to_string());

        c.insert("new".to_string());

        assert_eq!(c.get(&"hot".to_string()), Some(2));
        assert_eq!(c.get(&"cold".to_string()), None);
        assert_eq!(c.get(&"new".to_string()), Some(1));
    }

    #[test]
    fn test_eviction_tie_removes_greatest_key() {
        let mut c = counter(2);
        c.insert("a".to_string());
        c.insert("b".to_string());

        c.insert("c".to_string());

        assert!(c.get(&"a".to_string()).is_some());
        assert!(c.get(&"b".to_string()).is_none());
    }

    #[test]
    fn test_get_highest_orders_by_count_then_key() {
        let mut c = counter(8);
        for (key, hits) in [("x", 2), ("a", 5), ("m", 2), ("z", 7)] {
            for _ in 0..hits {
                c.insert(key.to_string());
            }
        }

        let top = c.get_highest(3);
        assert_eq!(
            top,
            vec![
                ("z".to_string(), 7),
                ("a".to_string(), 5),
                ("m".to_string(), 2),
            ]
        );
        assert!(c.get_highest(0).is_empty());
        assert_eq!(c.get_highest(100).len(), 4);
    }
}
