//! Set whose members expire after a fixed time-to-live.
//!
//! Expired members are swept lazily on access; there is no timer per entry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub struct ExpiringSet<K> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> ExpiringSet<K> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `key` unless a live entry exists. Returns true if inserted.
    pub fn insert_if_absent(&self, key: K) -> bool {
        self.insert_if_absent_at(key, Instant::now())
    }

    pub fn insert_if_absent_at(&self, key: K, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries, now);
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, now + self.ttl);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.contains_at(key, Instant::now())
    }

    pub fn contains_at(&self, key: &K, now: Instant) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|expires| now < *expires)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Live members.
    pub fn len(&self) -> usize {
        self.len_at(Instant::now())
    }

    pub fn len_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        Self::sweep(&mut entries, now);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn sweep(entries: &mut HashMap<K, Instant>, now: Instant) {
        entries.retain(|_, expires| now < *expires);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_blocks_reinsert_until_expiry() {
        let set = ExpiringSet::new(Duration::from_secs(300));
        let t0 = Instant::now();

        assert!(set.insert_if_absent_at("agent-1", t0));
        assert!(!set.insert_if_absent_at("agent-1", t0 + Duration::from_secs(1)));
        assert!(set.insert_if_absent_at("agent-2", t0));
        assert!(set.contains_at(&"agent-1", t0 + Duration::from_secs(299)));

        let later = t0 + Duration::from_secs(300);
        assert!(!set.contains_at(&"agent-1", later));
        assert!(set.insert_if_absent_at("agent-1", later));
    }

    #[test]
    fn test_sweep_drops_expired_members() {
        let set = ExpiringSet::new(Duration::from_secs(10));
        let t0 = Instant::now();
        set.insert_if_absent_at(1, t0);
        set.insert_if_absent_at(2, t0 + Duration::from_secs(5));

        assert_eq!(set.len_at(t0 + Duration::from_secs(11)), 1);
        assert_eq!(set.len_at(t0 + Duration::from_secs(20)), 0);
    }

    #[test]
    fn test_remove() {
        let set = ExpiringSet::new(Duration::from_secs(10));
        assert!(set.insert_if_absent("x"));
        assert!(set.remove(&"x"));
        assert!(!set.remove(&"x"));
        assert!(set.insert_if_absent("x"));
    }
}
