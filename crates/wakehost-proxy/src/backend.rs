//! The hostname -> backend routing table: a backend carries the policy
//! handle needed to wake it, plus the activity/LRU hooks touched on every
//! request.

use std::collections::HashMap;
use std::sync::RwLock;

use wakehost_policy::{PolicyHandle, PolicyState};

/// Everything the proxy needs to route to and wake one statically
/// configured agent.
#[derive(Clone)]
pub struct Backend {
    pub name: String,
    pub hostname: String,
    pub target: String,
    pub policy: PolicyHandle,
}

impl Backend {
    pub fn state(&self) -> PolicyState {
        self.policy.state()
    }
}

/// Hostname-keyed lookup table, rebuilt wholesale on config reload. Reads
/// happen on every request, so this is a `std::sync::RwLock<HashMap<..>>`
/// rather than an async lock.
pub struct BackendTable {
    by_hostname: RwLock<HashMap<String, Backend>>,
}

impl BackendTable {
    pub fn new() -> Self {
        Self {
            by_hostname: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, backend: Backend) {
        self.by_hostname
            .write()
            .unwrap()
            .insert(backend.hostname.to_ascii_lowercase(), backend);
    }

    pub fn remove(&self, hostname: &str) {
        self.by_hostname.write().unwrap().remove(&hostname.to_ascii_lowercase());
    }

    /// Remove whichever backend is owned by `agent`, keyed by its hostname
    /// rather than the agent name itself. Used on reconcile, where the
    /// caller only knows the agent's config-file name.
    pub fn remove_by_agent(&self, agent: &str) {
        self.by_hostname.write().unwrap().retain(|_, backend| backend.name != agent);
    }

    /// Look up a backend by Host header, stripping any port suffix.
    pub fn lookup(&self, host: &str) -> Option<Backend> {
        let domain = host.split(':').next().unwrap_or(host);
        self.by_hostname
            .read()
            .unwrap()
            .get(&domain.to_ascii_lowercase())
            .cloned()
    }

    pub fn list(&self) -> Vec<Backend> {
        self.by_hostname.read().unwrap().values().cloned().collect()
    }
}

impl Default for BackendTable {
    fn default() -> Self {
        Self::new()
    }
}
