//! Dynamic service registry: the hostname namespace shared between
//! statically configured agents and runtime-registered services. Reads
//! are on the proxy's hot path, so this uses a plain `std::sync::RwLock`
//! rather than an async one.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::{debug, warn};

use crate::types::DynamicService;
use crate::validation::{self, ValidationError};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("hostname {0} is already reserved")]
    AlreadyReserved(String),

    #[error("hostname {0} is not registered")]
    NotFound(String),

    #[error("hostname {0} is reserved by a different agent")]
    OwnerMismatch(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A hostname's binding: either a statically declared agent (reserved up
/// front, so the proxy can route to it before it ever comes up), or a
/// dynamically registered service.
#[derive(Debug, Clone)]
enum Binding {
    Static { agent: String },
    Dynamic(DynamicService),
}

/// Shared, mutable hostname -> backend mapping. Statically configured
/// agents reserve their hostname at startup; dynamic services claim and
/// release hostnames at runtime through the admin API.
pub struct ServiceRegistry {
    bindings: RwLock<HashMap<String, Binding>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Reserve a hostname for a statically configured agent. Called once
    /// at startup per agent; a duplicate hostname is a config error caught
    /// earlier by `GlobalConfig::validate`, so this only returns an error
    /// if called twice for the same hostname at runtime.
    pub fn reserve_static(&self, hostname: &str, agent: &str) -> Result<(), RegistryError> {
        let key = hostname.to_ascii_lowercase();
        let mut bindings = self.bindings.write().unwrap();
        if bindings.contains_key(&key) {
            return Err(RegistryError::AlreadyReserved(hostname.to_string()));
        }
        bindings.insert(key, Binding::Static { agent: agent.to_string() });
        Ok(())
    }

    /// Register a dynamic service. Fails if the hostname is already bound,
    /// statically or dynamically, to a different owner.
    pub fn register(&self, service: DynamicService) -> Result<(), RegistryError> {
        validation::validate_hostname(&service.hostname)?;
        validation::validate_target(&service.target)?;

        let key = service.hostname.to_ascii_lowercase();
        let mut bindings = self.bindings.write().unwrap();
        if bindings.contains_key(&key) {
            return Err(RegistryError::AlreadyReserved(service.hostname.clone()));
        }
        debug!(hostname = %service.hostname, owner = %service.owner_agent, "registered dynamic service");
        bindings.insert(key, Binding::Dynamic(service));
        Ok(())
    }

    /// Deregister a specific hostname, only if owned by `agent`.
    pub fn deregister(&self, hostname: &str, agent: &str) -> Result<(), RegistryError> {
        let key = hostname.to_ascii_lowercase();
        let mut bindings = self.bindings.write().unwrap();
        match bindings.get(&key) {
            Some(Binding::Dynamic(service)) if service.owner_agent == agent => {
                bindings.remove(&key);
                Ok(())
            }
            Some(Binding::Dynamic(_)) => Err(RegistryError::OwnerMismatch(hostname.to_string())),
            Some(Binding::Static { .. }) => Err(RegistryError::OwnerMismatch(hostname.to_string())),
            None => Err(RegistryError::NotFound(hostname.to_string())),
        }
    }

    /// Remove every dynamic service owned by `agent`. Called when an
    /// on-demand agent goes to sleep, so stale registrations from a
    /// previous run don't shadow a future wake.
    pub fn deregister_by_agent(&self, agent: &str) {
        let mut bindings = self.bindings.write().unwrap();
        let before = bindings.len();
        bindings.retain(|_, binding| match binding {
            Binding::Dynamic(service) => service.owner_agent != agent,
            Binding::Static { .. } => true,
        });
        let removed = before - bindings.len();
        if removed > 0 {
            warn!(agent, removed, "purged dynamic services for sleeping agent");
        }
    }

    /// Look up the owning agent name and target for a hostname, if any.
    /// For a static binding the target is resolved by the caller (the
    /// proxy's `BackendTable`), since the registry doesn't know agent
    /// targets; for a dynamic binding the target travels with the record.
    pub fn lookup(&self, hostname: &str) -> Option<LookupResult> {
        let key = hostname.to_ascii_lowercase();
        let bindings = self.bindings.read().unwrap();
        match bindings.get(&key)? {
            Binding::Static { agent } => Some(LookupResult::Static { agent: agent.clone() }),
            Binding::Dynamic(service) => Some(LookupResult::Dynamic(service.clone())),
        }
    }

    pub fn list_dynamic(&self) -> Vec<DynamicService> {
        self.bindings
            .read()
            .unwrap()
            .values()
            .filter_map(|binding| match binding {
                Binding::Dynamic(service) => Some(service.clone()),
                Binding::Static { .. } => None,
            })
            .collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum LookupResult {
    Static { agent: String },
    Dynamic(DynamicService),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dyn_service(hostname: &str, owner: &str) -> DynamicService {
        DynamicService::new(hostname, "10.0.0.5:9000", owner)
    }

    #[test]
    fn reserve_static_then_lookup() {
        let registry = ServiceRegistry::new();
        registry.reserve_static("notebook.example.com", "notebook").unwrap();
        match registry.lookup("notebook.example.com").unwrap() {
            LookupResult::Static { agent } => assert_eq!(agent, "notebook"),
            _ => panic!("expected static binding"),
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = ServiceRegistry::new();
        registry.reserve_static("Notebook.Example.com", "notebook").unwrap();
        assert!(registry.lookup("notebook.example.com").is_some());
    }

    #[test]
    fn register_rejects_duplicate_hostname() {
        let registry = ServiceRegistry::new();
        registry.register(dyn_service("svc.example.com", "agent-a")).unwrap();
        let err = registry.register(dyn_service("svc.example.com", "agent-b")).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyReserved("svc.example.com".to_string()));
    }

    #[test]
    fn deregister_requires_matching_owner() {
        let registry = ServiceRegistry::new();
        registry.register(dyn_service("svc.example.com", "agent-a")).unwrap();
        let err = registry.deregister("svc.example.com", "agent-b").unwrap_err();
        assert_eq!(err, RegistryError::OwnerMismatch("svc.example.com".to_string()));
        registry.deregister("svc.example.com", "agent-a").unwrap();
        assert!(registry.lookup("svc.example.com").is_none());
    }

    #[test]
    fn deregister_by_agent_purges_only_that_agents_services() {
        let registry = ServiceRegistry::new();
        registry.register(dyn_service("a.example.com", "agent-a")).unwrap();
        registry.register(dyn_service("b.example.com", "agent-b")).unwrap();
        registry.deregister_by_agent("agent-a");
        assert!(registry.lookup("a.example.com").is_none());
        assert!(registry.lookup("b.example.com").is_some());
    }

    #[test]
    fn deregister_by_agent_never_touches_static_bindings() {
        let registry = ServiceRegistry::new();
        registry.reserve_static("static.example.com", "agent-a").unwrap();
        registry.deregister_by_agent("agent-a");
        assert!(registry.lookup("static.example.com").is_some());
    }

    #[test]
    fn register_rejects_invalid_target() {
        let registry = ServiceRegistry::new();
        let bad = DynamicService::new("loop.example.com", "127.0.0.1:9000", "agent-a");
        assert!(registry.register(bad).is_err());
        assert!(registry.lookup("loop.example.com").is_none());
    }
}
