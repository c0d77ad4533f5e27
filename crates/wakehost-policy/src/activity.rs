//! Tracks the last time each agent saw real traffic, feeding the
//! idle-timeout clock each policy watches.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Per-agent last-seen-activity clock. Reads happen on every proxied
/// request, so this is a plain `std::sync::RwLock<HashMap<..>>` rather
/// than an async lock.
pub struct ActivityTracker {
    last_seen: RwLock<HashMap<String, Instant>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last_seen: RwLock::new(HashMap::new()),
        }
    }

    /// Record activity for `agent` at the current instant. Called once per
    /// proxied request and once per WebSocket frame forwarded in either
    /// direction.
    pub fn touch(&self, agent: &str) {
        self.last_seen
            .write()
            .unwrap()
            .insert(agent.to_string(), Instant::now());
    }

    /// Seconds since the last recorded activity, or `None` if the agent
    /// has never been touched (treated as "idle forever" by callers).
    pub fn idle_for(&self, agent: &str) -> Option<Duration> {
        self.last_seen
            .read()
            .unwrap()
            .get(agent)
            .map(|instant| instant.elapsed())
    }

    pub fn is_idle(&self, agent: &str, timeout: Duration) -> bool {
        match self.idle_for(agent) {
            Some(idle) => idle >= timeout,
            None => true,
        }
    }

    pub fn remove(&self, agent: &str) {
        self.last_seen.write().unwrap().remove(agent);
    }

    pub fn last_seen(&self, agent: &str) -> Option<Instant> {
        self.last_seen.read().unwrap().get(agent).copied()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}
