//! Caps the number of simultaneously-ready OnDemand agents, using the
//! same `std::sync::RwLock` hot-path discipline as the rest of this crate.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

/// Tracks when each ready OnDemand agent last had activity, so the
/// manager can pick an eviction candidate when the ready set exceeds its
/// cap.
pub struct LruManager {
    max_ready: usize,
    ready: RwLock<HashMap<String, Instant>>,
}

impl LruManager {
    pub fn new(max_ready: usize) -> Self {
        Self {
            max_ready,
            ready: RwLock::new(HashMap::new()),
        }
    }

    /// Mark `agent` ready now. Call when an OnDemand agent transitions to
    /// the Ready state.
    pub fn mark_ready(&self, agent: &str) {
        self.ready.write().unwrap().insert(agent.to_string(), Instant::now());
    }

    /// Refresh the recency of an already-ready agent. Call on every
    /// proxied request, so the agent least recently used is always the
    /// one actually least recently used.
    pub fn touch(&self, agent: &str) {
        let mut ready = self.ready.write().unwrap();
        if let Some(seen) = ready.get_mut(agent) {
            *seen = Instant::now();
        }
    }

    pub fn mark_sleeping(&self, agent: &str) {
        self.ready.write().unwrap().remove(agent);
    }

    /// If the ready set is over capacity, return the name of the agent to
    /// evict: the least recently used, with ties (including an agent
    /// being marked ready simultaneously with another) broken by agent
    /// name ascending for determinism.
    ///
    /// `max_ready == 0` disables the cap.
    pub fn eviction_candidate(&self) -> Option<String> {
        if self.max_ready == 0 {
            return None;
        }
        let ready = self.ready.read().unwrap();
        if ready.len() <= self.max_ready {
            return None;
        }
        ready
            .iter()
            .min_by(|(name_a, seen_a), (name_b, seen_b)| {
                seen_a.cmp(seen_b).then_with(|| name_a.cmp(name_b))
            })
            .map(|(name, _)| name.clone())
    }

    pub fn ready_count(&self) -> usize {
        self.ready.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn no_eviction_under_cap() {
        let lru = LruManager::new(2);
        lru.mark_ready("a");
        lru.mark_ready("b");
        assert_eq!(lru.eviction_candidate(), None);
    }

    #[test]
    fn evicts_least_recently_used() {
        let lru = LruManager::new(2);
        lru.mark_ready("a");
        sleep(Duration::from_millis(5));
        lru.mark_ready("b");
        sleep(Duration::from_millis(5));
        lru.mark_ready("c");
        assert_eq!(lru.eviction_candidate(), Some("a".to_string()));
    }

    #[test]
    fn touch_protects_from_eviction() {
        let lru = LruManager::new(2);
        lru.mark_ready("a");
        sleep(Duration::from_millis(5));
        lru.mark_ready("b");
        sleep(Duration::from_millis(5));
        lru.touch("a");
        sleep(Duration::from_millis(5));
        lru.mark_ready("c");
        assert_eq!(lru.eviction_candidate(), Some("b".to_string()));
    }

    #[test]
    fn ties_break_by_name_ascending() {
        let lru = LruManager::new(1);
        // Can't force identical Instants through the public API, so this
        // exercises the comparator directly via two agents marked ready
        // back-to-back with the clock stubbed by relying on ordering.
        lru.mark_ready("zeta");
        lru.mark_ready("alpha");
        // alpha was marked after zeta, so zeta remains the older (LRU)
        // entry regardless of name; this test just documents that the
        // tie-break is a secondary key, not the primary one.
        assert_eq!(lru.eviction_candidate(), Some("zeta".to_string()));
    }

    #[test]
    fn zero_cap_disables_eviction() {
        let lru = LruManager::new(0);
        lru.mark_ready("a");
        lru.mark_ready("b");
        lru.mark_ready("c");
        assert_eq!(lru.eviction_candidate(), None);
    }

    #[test]
    fn mark_sleeping_removes_from_ready_set() {
        let lru = LruManager::new(1);
        lru.mark_ready("a");
        lru.mark_ready("b");
        assert_eq!(lru.ready_count(), 2);
        lru.mark_sleeping("a");
        assert_eq!(lru.ready_count(), 1);
        assert_eq!(lru.eviction_candidate(), None);
    }
}
