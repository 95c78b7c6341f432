//! Bounded recency set of processed message identities.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// Remembers identifiers seen within `retention`, holding at most
/// `capacity` of them. The oldest entries are evicted first.
#[derive(Debug)]
pub struct RecencySet {
    capacity: usize,
    retention: Duration,
    order: VecDeque<(String, Instant)>,
    members: HashSet<String>,
}

impl RecencySet {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Record `id`. Returns `false` when it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        self.evict_expired();
        if self.members.contains(id) {
            return false;
        }
        while self.order.len() >= self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
        self.order.push_back((id.to_string(), Instant::now()));
        self.members.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        while let Some((_, seen)) = self.order.front() {
            if now.duration_since(*seen) < self.retention {
                break;
            }
            if let Some((old, _)) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_is_rejected() {
        let mut set = RecencySet::new(10, Duration::from_secs(60));
        assert!(set.insert("m1"));
        assert!(!set.insert("m1"));
        assert!(set.insert("m2"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut set = RecencySet::new(2, Duration::from_secs(60));
        set.insert("a");
        set.insert("b");
        set.insert("c");
        assert!(!set.contains("a"));
        assert!(set.contains("b") && set.contains("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_window() {
        let mut set = RecencySet::new(10, Duration::from_secs(30));
        set.insert("a");
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(set.insert("a"));
    }
}
