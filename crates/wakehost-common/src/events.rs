//! In-process event bus: synchronous, registration-order fan-out of
//! lifecycle events to subscribed handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Canonical event type names.
pub mod event_type {
    pub const AGENT_STARTING: &str = "agent.starting";
    pub const AGENT_READY: &str = "agent.ready";
    pub const AGENT_DEGRADED: &str = "agent.degraded";
    pub const AGENT_SLEEP: &str = "agent.sleep";
    pub const AGENT_WAKE: &str = "agent.wake";
    pub const AGENT_HEALTH_FAILED: &str = "agent.health_failed";
    pub const RESTART_EXHAUSTED: &str = "restart.exhausted";
    pub const AGENT_ADDED: &str = "agent.added";
    pub const AGENT_REMOVED: &str = "agent.removed";
}

/// A lifecycle event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub agent: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fields: HashMap<String, Value>,
}

impl Event {
    /// Construct an event; the bus stamps the timestamp to "now" if this
    /// constructor isn't used, so this is a convenience, not a requirement.
    pub fn new(event_type: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            agent: agent.into(),
            timestamp: Utc::now(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Opaque id returned from `EventBus::on_event`, used to unregister later.
pub type HandlerId = u64;

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

struct Slot {
    id: HandlerId,
    handler: Handler,
}

/// Best-effort, in-process, synchronous fan-out of lifecycle events.
///
/// `emit` invokes every registered handler synchronously, in registration
/// order, in the caller's own task. There is no retry and no persistence;
/// a slow handler stalls the emitter.
pub struct EventBus {
    handlers: RwLock<Vec<Slot>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler, returning an id usable with `remove_handler`.
    pub fn on_event<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().unwrap().push(Slot {
            id,
            handler: Box::new(handler),
        });
        id
    }

    /// Unregister a handler. Unknown ids are a no-op.
    pub fn remove_handler(&self, id: HandlerId) {
        self.handlers.write().unwrap().retain(|slot| slot.id != id);
    }

    /// Dispatch an event to every currently-registered handler, in
    /// registration order, synchronously. A zero timestamp is stamped to
    /// "now" before dispatch.
    pub fn emit(&self, mut event: Event) {
        if event.timestamp == DateTime::<Utc>::UNIX_EPOCH {
            event.timestamp = Utc::now();
        }
        let handlers = self.handlers.read().unwrap();
        for slot in handlers.iter() {
            (slot.handler)(&event);
        }
        if handlers.is_empty() {
            warn!(event_type = %event.event_type, agent = %event.agent, "event emitted with no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
