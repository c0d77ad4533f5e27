//! Tracks live WebSocket connections per agent, so the sleep path and the
//! shutdown drain can tell whether it's safe to stop a backend: an agent
//! with an open tunnel is never put to sleep.
//!
//! `wait_all_closed` uses `tokio::sync::Notify` the way a shutdown watch
//! channel signals state changes to waiters, rather than polling.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;

use tokio::sync::Notify;

struct Inner {
    counts: Mutex<HashMap<String, usize>>,
    notify: Notify,
}

/// Per-agent open-WebSocket-connection counter.
#[derive(Clone)]
pub struct WsCounter {
    inner: Arc<Inner>,
}

impl WsCounter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counts: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Increment the open-connection count for `agent`. Pair with a
    /// corresponding `dec` when the connection closes, typically via an
    /// RAII guard (see `Guard`).
    pub fn inc(&self, agent: &str) -> Guard {
        let mut counts = self.inner.counts.lock().unwrap();
        *counts.entry(agent.to_string()).or_insert(0) += 1;
        Guard {
            counter: self.clone(),
            agent: agent.to_string(),
        }
    }

    fn dec(&self, agent: &str) {
        let mut counts = self.inner.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(agent) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(agent);
            }
        }
        drop(counts);
        self.inner.notify.notify_waiters();
    }

    pub fn count(&self, agent: &str) -> usize {
        self.inner.counts.lock().unwrap().get(agent).copied().unwrap_or(0)
    }

    pub fn has_open(&self, agent: &str) -> bool {
        self.count(agent) > 0
    }

    /// Resolves once no agent has an open WebSocket connection. Used by
    /// graceful shutdown to drain active tunnels before exiting.
    pub async fn wait_all_closed(&self) {
        loop {
            let any_open = {
                let counts = self.inner.counts.lock().unwrap();
                counts.values().any(|&c| c > 0)
            };
            if !any_open {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}

impl Default for WsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `WsCounter::inc`; decrements on drop.
pub struct Guard {
    counter: WsCounter,
    agent: String,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.counter.dec(&self.agent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_then_drop_clears_count() {
        let counter = WsCounter::new();
        {
            let _guard = counter.inc("notebook");
            assert_eq!(counter.count("notebook"), 1);
            assert!(counter.has_open("notebook"));
        }
        assert_eq!(counter.count("notebook"), 0);
        assert!(!counter.has_open("notebook"));
    }

    #[test]
    fn multiple_connections_stack() {
        let counter = WsCounter::new();
        let g1 = counter.inc("notebook");
        let g2 = counter.inc("notebook");
        assert_eq!(counter.count("notebook"), 2);
        drop(g1);
        assert_eq!(counter.count("notebook"), 1);
        drop(g2);
        assert_eq!(counter.count("notebook"), 0);
    }

    #[tokio::test]
    async fn wait_all_closed_resolves_immediately_when_empty() {
        let counter = WsCounter::new();
        tokio::time::timeout(std::time::Duration::from_millis(50), counter.wait_all_closed())
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test]
    async fn wait_all_closed_resolves_after_last_guard_drops() {
        let counter = WsCounter::new();
        let guard = counter.inc("notebook");
        let counter2 = counter.clone();
        let waiter = tokio::spawn(async move { counter2.wait_all_closed().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        drop(guard);
        tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("waiter should finish")
            .expect("task should not panic");
    }
}
