//! Dynamic service records: backends registered at runtime by an agent
//! rather than declared in the static YAML config.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A backend registered through the service-registration API.
///
/// Unlike a statically configured agent, a `DynamicService` has no
/// lifecycle policy of its own: it is always treated as Unmanaged by the
/// proxy, since the registrant is responsible for its own process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicService {
    pub hostname: String,
    pub target: String,
    pub owner_agent: String,
    pub registered_at: DateTime<Utc>,
}

impl DynamicService {
    pub fn new(hostname: impl Into<String>, target: impl Into<String>, owner_agent: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            target: target.into(),
            owner_agent: owner_agent.into(),
            registered_at: Utc::now(),
        }
    }
}
