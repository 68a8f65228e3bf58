//! Pending request table shared by both protocol clients

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

struct Entry<P> {
    value: P,
    deadline: Instant,
    order: u64,
}

/// Outstanding requests keyed by correlation id
///
/// Drained and expired entries come back in submission order.
pub struct PendingTable<K, P> {
    entries: HashMap<K, Entry<P>>,
    timeout: Duration,
    limit: usize,
    counter: u64,
}

impl<K: Copy + Eq + Hash, P> PendingTable<K, P> {
    pub fn new(timeout: Duration, limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
            limit,
            counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: K, value: P, now: Instant) {
        self.counter += 1;
        self.entries.insert(
            key,
            Entry {
                value,
                deadline: now + self.timeout,
                order: self.counter,
            },
        );
    }

    pub fn remove(&mut self, key: &K) -> Option<P> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Remove and return every entry whose deadline is at or before `now`
    pub fn expire(&mut self, now: Instant) -> Vec<(K, P)> {
        let mut expired: Vec<(u64, K)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, entry)| (entry.order, *key))
            .collect();
        expired.sort_by_key(|(order, _)| *order);

        expired
            .into_iter()
            .filter_map(|(_, key)| self.entries.remove(&key).map(|entry| (key, entry.value)))
            .collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|entry| entry.deadline).min()
    }

    /// Remove everything
    pub fn drain(&mut self) -> Vec<(K, P)> {
        let mut all: Vec<(K, Entry<P>)> = self.entries.drain().collect();
        all.sort_by_key(|(_, entry)| entry.order);
        all.into_iter().map(|(key, entry)| (key, entry.value)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expire_in_submission_order() {
        let start = Instant::now();
        let mut table: PendingTable<u8, &str> = PendingTable::new(Duration::from_secs(2), 4);
        table.insert(9, "first", start);
        table.insert(3, "second", start);
        table.insert(5, "late", start + Duration::from_secs(1));

        assert_eq!(table.next_deadline(), Some(start + Duration::from_secs(2)));
        assert!(table.expire(start + Duration::from_millis(1999)).is_empty());

        let expired = table.expire(start + Duration::from_secs(2));
        assert_eq!(expired, vec![(9, "first"), (3, "second")]);
        assert_eq!(table.len(), 1);
        assert!(table.contains(&5));
    }

    #[test]
    fn test_limit_and_drain() {
        let now = Instant::now();
        let mut table: PendingTable<u64, u64> = PendingTable::new(Duration::from_secs(2), 2);
        table.insert(2, 20, now);
        assert!(!table.is_full());
        table.insert(1, 10, now);
        assert!(table.is_full());

        assert_eq!(table.remove(&2), Some(20));
        assert!(!table.is_full());
        table.insert(3, 30, now);

        assert_eq!(table.drain(), vec![(1, 10), (3, 30)]);
        assert_eq!(table.len(), 0);
        assert_eq!(table.next_deadline(), None);
    }
}
