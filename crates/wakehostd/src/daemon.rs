//! Owns the running set of `Policy` tasks and reconciles it against a
//! freshly loaded `GlobalConfig`: each agent owns a background task, so
//! reconciliation means diffing the agent set and spawning/aborting tasks
//! rather than swapping an `Arc<RwLock<..>>`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use wakehost_common::config::GlobalConfig;
use wakehost_common::container::ContainerDriver;
use wakehost_common::events::{event_type, Event, EventBus};
use wakehost_policy::Policy;
use wakehost_proxy::{Backend, Proxy};

pub struct Daemon {
    pub proxy: Arc<Proxy>,
    pub events: Arc<EventBus>,
    driver: Arc<dyn ContainerDriver>,
    running: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl Daemon {
    pub fn new(proxy: Arc<Proxy>, events: Arc<EventBus>, driver: Arc<dyn ContainerDriver>) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            events,
            driver,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Bring the running agent set in line with `config`: spawn a
    /// `Policy` for every agent not already running, and tear down any
    /// running agent no longer present (or disabled). Agents present in
    /// both sets are left untouched — changing an existing agent's
    /// policy parameters requires a restart of `wakehostd`.
    pub async fn reconcile(&self, config: GlobalConfig) {
        let wanted: HashMap<String, wakehost_common::config::AgentConfig> = config
            .enabled_agents()
            .map(|a| (a.name.clone(), a.clone()))
            .collect();

        let mut running = self.running.lock().unwrap();

        let to_remove: Vec<String> = running.keys().filter(|name| !wanted.contains_key(*name)).cloned().collect();
        for name in to_remove {
            if let Some(join) = running.remove(&name) {
                join.abort();
            }
            self.proxy.backends.remove_by_agent(&name);
            self.proxy.registry.deregister_by_agent(&name);
            warn!(agent = %name, "agent removed from config, stopped tracking it");
            self.events.emit(Event::new(event_type::AGENT_REMOVED, &name));
        }

        for (name, agent) in wanted {
            if running.contains_key(&name) {
                continue;
            }

            if let Err(err) = self.proxy.registry.reserve_static(&agent.hostname, &agent.name) {
                warn!(agent = %agent.name, %err, "could not reserve hostname, skipping agent");
                continue;
            }

            let (handle, join) = Policy::spawn(
                agent.clone(),
                self.driver.clone(),
                self.events.clone(),
                self.proxy.activity.clone(),
                self.proxy.ws_counter.clone(),
            );

            self.proxy.backends.insert(Backend {
                name: agent.name.clone(),
                hostname: agent.hostname.clone(),
                target: agent.target.clone(),
                policy: handle,
            });

            running.insert(name, join);
            info!(agent = %agent.name, hostname = %agent.hostname, "agent added");
            self.events.emit(Event::new(event_type::AGENT_ADDED, &agent.name));
        }
    }
}
