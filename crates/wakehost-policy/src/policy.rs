//! Per-agent lifecycle state machine: wakes an OnDemand agent on first
//! request, sleeps it after it has been idle, keeps an AlwaysOn agent
//! running and restarts it on failure, and leaves an Unmanaged agent's
//! process lifecycle entirely alone.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info, warn};

use wakehost_common::config::{AgentConfig, PolicyKind};
use wakehost_common::container::{ContainerDriver, RunState};
use wakehost_common::events::{event_type, Event, EventBus};

use crate::activity::ActivityTracker;
use crate::wscounter::WsCounter;

/// Observable lifecycle state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    /// Container/service is not running; OnDemand agents start here.
    Sleeping,
    /// Wake has been requested; waiting for the container to come up and
    /// pass its first health probe.
    Starting,
    /// Passing health probes; the proxy may forward traffic.
    Ready,
    /// A terminal fault state for OnDemand, entered once its restart
    /// budget is exhausted; recoverable for AlwaysOn, which returns to
    /// Ready on the next successful probe.
    Degraded,
}

impl PolicyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyState::Sleeping => "sleeping",
            PolicyState::Starting => "starting",
            PolicyState::Ready => "ready",
            PolicyState::Degraded => "degraded",
        }
    }
}

/// Mutable-by-reconfigure thresholds, shared between the handle and the
/// running task. `PolicyHandle::reconfigure` stores into these; the task
/// reads a fresh value at each observation point rather than capturing
/// one at spawn time.
struct Tunables {
    idle_timeout_secs: AtomicU64,
    health_interval_secs: AtomicU64,
    max_failures: AtomicU32,
    max_restart_attempts: AtomicU32,
}

impl Tunables {
    fn from_config(config: &AgentConfig) -> Self {
        Self {
            idle_timeout_secs: AtomicU64::new(config.idle_timeout_secs),
            health_interval_secs: AtomicU64::new(config.health_interval_secs.max(1)),
            max_failures: AtomicU32::new(config.max_failures),
            max_restart_attempts: AtomicU32::new(config.max_restart_attempts),
        }
    }
}

/// A cheap, cloneable reference to a running policy, exposing the pieces
/// the proxy and admin API need: current state, and a way to request a
/// wake.
#[derive(Clone)]
pub struct PolicyHandle {
    name: String,
    kind: PolicyKind,
    state: Arc<RwLock<PolicyState>>,
    wake_tx: mpsc::Sender<()>,
    evict_tx: mpsc::Sender<()>,
    failures: Arc<AtomicU32>,
    tunables: Arc<Tunables>,
}

impl PolicyHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn state(&self) -> PolicyState {
        *self.state.read().unwrap()
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Request a wake. For Unmanaged and AlwaysOn agents this is a no-op:
    /// the former is never asleep, the latter is kept running by its own
    /// loop. Never blocks: the mailbox holds a single pending wake, and a
    /// wake already in flight makes this a no-op.
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Force a Ready OnDemand agent to sleep now, independent of its idle
    /// timeout. Used by the LRU eviction manager. A no-op for AlwaysOn and
    /// Unmanaged agents, and for an agent that isn't currently Ready.
    pub fn evict(&self) {
        let _ = self.evict_tx.try_send(());
    }

    /// Atomically update the idle timeout, health check interval, max
    /// consecutive failures, and max restart attempts. Takes effect at the
    /// policy's next observation of each value, not immediately or
    /// mid-probe. Fields a given policy kind doesn't use (idle timeout and
    /// restart attempts for AlwaysOn, everything for Unmanaged) are stored
    /// but simply never read.
    pub fn reconfigure(&self, idle_timeout_secs: u64, health_interval_secs: u64, max_failures: u32, max_restart_attempts: u32) {
        self.tunables.idle_timeout_secs.store(idle_timeout_secs, Ordering::Relaxed);
        self.tunables
            .health_interval_secs
            .store(health_interval_secs.max(1), Ordering::Relaxed);
        self.tunables.max_failures.store(max_failures, Ordering::Relaxed);
        self.tunables.max_restart_attempts.store(max_restart_attempts, Ordering::Relaxed);
    }
}

fn set_state(state: &Arc<RwLock<PolicyState>>, new: PolicyState) {
    *state.write().unwrap() = new;
}

/// Runs the lifecycle loop for one agent until its task is dropped/aborted.
pub struct Policy;

impl Policy {
    /// Spawn the background task driving `config`'s lifecycle and return a
    /// handle plus the join handle for the spawned task.
    pub fn spawn(
        config: AgentConfig,
        driver: Arc<dyn ContainerDriver>,
        events: Arc<EventBus>,
        activity: Arc<ActivityTracker>,
        ws_counter: WsCounter,
    ) -> (PolicyHandle, tokio::task::JoinHandle<()>) {
        let initial_state = match config.policy {
            PolicyKind::Unmanaged => PolicyState::Ready,
            _ => PolicyState::Sleeping,
        };
        let state = Arc::new(RwLock::new(initial_state));
        let failures = Arc::new(AtomicU32::new(0));
        let tunables = Arc::new(Tunables::from_config(&config));
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (evict_tx, evict_rx) = mpsc::channel(1);

        let handle = PolicyHandle {
            name: config.name.clone(),
            kind: config.policy,
            state: state.clone(),
            wake_tx,
            evict_tx,
            failures: failures.clone(),
            tunables: tunables.clone(),
        };

        let join = match config.policy {
            PolicyKind::OnDemand => tokio::spawn(run_on_demand(
                config, driver, events, activity, ws_counter, state, failures, tunables, wake_rx, evict_rx,
            )),
            PolicyKind::AlwaysOn => {
                tokio::spawn(run_always_on(config, driver, events, state, failures, tunables))
            }
            PolicyKind::Unmanaged => tokio::spawn(async move {
                // Nothing to drive: the agent's process lifecycle is
                // entirely outside this program's control.
            }),
        };

        (handle, join)
    }
}

async fn probe_health(target: &str, health_path: &str) -> bool {
    let url = format!("http://{target}{health_path}");
    match reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Poll health every 2 seconds until it passes or `timeout` elapses.
async fn wait_until_healthy(target: &str, health_path: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = interval(Duration::from_secs(2));
    loop {
        ticker.tick().await;
        if probe_health(target, health_path).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
    }
}

/// Transition into `starting`: emits `agent.starting`, resets the
/// consecutive-failure counter (entering `starting` always clears it), and
/// polls health until it passes or `wake_timeout` elapses.
async fn enter_starting(
    config: &AgentConfig,
    state: &Arc<RwLock<PolicyState>>,
    events: &EventBus,
    failures: &AtomicU32,
    wake_timeout: Duration,
) -> bool {
    set_state(state, PolicyState::Starting);
    events.emit(Event::new(event_type::AGENT_STARTING, &config.name));
    failures.store(0, Ordering::Relaxed);
    wait_until_healthy(&config.target, &config.health_path, wake_timeout).await
}

async fn run_on_demand(
    config: AgentConfig,
    driver: Arc<dyn ContainerDriver>,
    events: Arc<EventBus>,
    activity: Arc<ActivityTracker>,
    ws_counter: WsCounter,
    state: Arc<RwLock<PolicyState>>,
    failures: Arc<AtomicU32>,
    tunables: Arc<Tunables>,
    mut wake_rx: mpsc::Receiver<()>,
    mut evict_rx: mpsc::Receiver<()>,
) {
    let container = config.container.clone().unwrap_or_default();
    let wake_timeout = Duration::from_secs(config.wake_timeout_secs);

    loop {
        // Sleeping: wait for a wake request. Drop any eviction request
        // that arrived while already asleep; it's moot.
        if wake_rx.recv().await.is_none() {
            return;
        }
        while evict_rx.try_recv().is_ok() {}
        events.emit(Event::new(event_type::AGENT_WAKE, &config.name));

        if let Err(err) = driver.start(&container).await {
            error!(agent = %config.name, %err, "failed to start container");
            continue;
        }

        if !enter_starting(&config, &state, &events, &failures, wake_timeout).await {
            warn!(agent = %config.name, "did not become healthy within startup timeout");
            let _ = driver.stop(&container).await;
            set_state(&state, PolicyState::Sleeping);
            events.emit(Event::new(event_type::AGENT_SLEEP, &config.name));
            continue;
        }

        activity.touch(&config.name);
        set_state(&state, PolicyState::Ready);
        events.emit(Event::new(event_type::AGENT_READY, &config.name));

        // Ready: watch health and idle time until one of them says it's
        // time to leave this state.
        'ready: loop {
            let health_interval = Duration::from_secs(tunables.health_interval_secs.load(Ordering::Relaxed));
            tokio::select! {
                _ = tokio::time::sleep(health_interval) => {}
                _ = evict_rx.recv() => {
                    if ws_counter.has_open(&config.name) {
                        info!(agent = %config.name, "eviction skipped, websocket still open");
                        continue;
                    }
                    info!(agent = %config.name, "evicted by LRU manager, sleeping");
                    let _ = driver.stop(&container).await;
                    set_state(&state, PolicyState::Sleeping);
                    events.emit(Event::new(event_type::AGENT_SLEEP, &config.name));
                    break;
                }
            }

            if ws_counter.has_open(&config.name) {
                continue;
            }
            let idle_timeout = Duration::from_secs(tunables.idle_timeout_secs.load(Ordering::Relaxed));
            if activity.is_idle(&config.name, idle_timeout) {
                info!(agent = %config.name, "idle timeout reached, sleeping");
                let _ = driver.stop(&container).await;
                set_state(&state, PolicyState::Sleeping);
                events.emit(Event::new(event_type::AGENT_SLEEP, &config.name));
                break;
            }

            if probe_health(&config.target, &config.health_path).await {
                continue;
            }

            let count = failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(agent = %config.name, failures = count, "health probe failed while ready");
            events.emit(
                Event::new(event_type::AGENT_HEALTH_FAILED, &config.name).with_field("failures", count),
            );

            let max_failures = tunables.max_failures.load(Ordering::Relaxed);
            if count < max_failures {
                continue;
            }

            let max_restart_attempts = tunables.max_restart_attempts.load(Ordering::Relaxed);
            let mut restarted = false;
            for attempt in 1..=max_restart_attempts {
                match driver.restart(&container).await {
                    Ok(()) => {
                        restarted = true;
                        break;
                    }
                    Err(err) => {
                        warn!(agent = %config.name, attempt, %err, "restart attempt failed");
                    }
                }
            }

            if !restarted {
                error!(agent = %config.name, "restart attempts exhausted, entering degraded");
                set_state(&state, PolicyState::Degraded);
                events.emit(Event::new(event_type::AGENT_DEGRADED, &config.name));
                events.emit(Event::new(event_type::RESTART_EXHAUSTED, &config.name));
                return;
            }

            if enter_starting(&config, &state, &events, &failures, wake_timeout).await {
                activity.touch(&config.name);
                set_state(&state, PolicyState::Ready);
                events.emit(Event::new(event_type::AGENT_READY, &config.name));
                continue 'ready;
            }

            warn!(agent = %config.name, "did not become healthy within startup timeout after restart");
            let _ = driver.stop(&container).await;
            set_state(&state, PolicyState::Sleeping);
            events.emit(Event::new(event_type::AGENT_SLEEP, &config.name));
            break;
        }
    }
}

async fn run_always_on(
    config: AgentConfig,
    driver: Arc<dyn ContainerDriver>,
    events: Arc<EventBus>,
    state: Arc<RwLock<PolicyState>>,
    failures: Arc<AtomicU32>,
    tunables: Arc<Tunables>,
) {
    let container = config.container.clone().unwrap_or_default();

    set_state(&state, PolicyState::Starting);
    events.emit(Event::new(event_type::AGENT_STARTING, &config.name));

    match driver.status(&container).await {
        Ok(RunState::Running) => {}
        _ => {
            if let Err(err) = driver.start(&container).await {
                error!(agent = %config.name, %err, "failed to start always-on container");
            }
        }
    }

    let wake_timeout = Duration::from_secs(config.wake_timeout_secs);
    if wait_until_healthy(&config.target, &config.health_path, wake_timeout).await {
        set_state(&state, PolicyState::Ready);
        events.emit(Event::new(event_type::AGENT_READY, &config.name));
    } else {
        set_state(&state, PolicyState::Degraded);
        events.emit(Event::new(event_type::AGENT_DEGRADED, &config.name));
    }

    loop {
        let health_interval = Duration::from_secs(tunables.health_interval_secs.load(Ordering::Relaxed));
        tokio::time::sleep(health_interval).await;

        if probe_health(&config.target, &config.health_path).await {
            failures.store(0, Ordering::Relaxed);
            if *state.read().unwrap() == PolicyState::Degraded {
                info!(agent = %config.name, "always-on agent recovered");
                set_state(&state, PolicyState::Ready);
                events.emit(Event::new(event_type::AGENT_READY, &config.name));
            }
            continue;
        }

        let count = failures.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(agent = %config.name, failures = count, "always-on health probe failed");
        events.emit(
            Event::new(event_type::AGENT_HEALTH_FAILED, &config.name).with_field("failures", count),
        );

        let max_failures = tunables.max_failures.load(Ordering::Relaxed);
        if count >= max_failures && *state.read().unwrap() != PolicyState::Degraded {
            set_state(&state, PolicyState::Degraded);
            events.emit(Event::new(event_type::AGENT_DEGRADED, &config.name));
        }

        if let Err(err) = driver.restart(&container).await {
            error!(agent = %config.name, %err, "restart failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wakehost_common::container::DriverError;
    use std::sync::atomic::AtomicBool;

    struct AlwaysHealthyDriver {
        started: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ContainerDriver for AlwaysHealthyDriver {
        async fn start(&self, _container: &str) -> Result<(), DriverError> {
            self.started.store(true, Ordering::Relaxed);
            Ok(())
        }
        async fn stop(&self, _container: &str) -> Result<(), DriverError> {
            self.started.store(false, Ordering::Relaxed);
            Ok(())
        }
        async fn restart(&self, _container: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn status(&self, _container: &str) -> Result<RunState, DriverError> {
            Ok(if self.started.load(Ordering::Relaxed) {
                RunState::Running
            } else {
                RunState::Stopped
            })
        }
    }

    fn base_config(policy: PolicyKind) -> AgentConfig {
        AgentConfig {
            name: "notebook".to_string(),
            hostname: "notebook.example.com".to_string(),
            target: "127.0.0.1:1".to_string(),
            policy,
            idle_timeout_secs: 1,
            wake_timeout_secs: 1,
            health_path: "/healthz".to_string(),
            health_interval_secs: 1,
            max_failures: 2,
            max_restart_attempts: 2,
            container: Some("notebook-ctr".to_string()),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn unmanaged_starts_ready_with_no_wake_mailbox_effect() {
        let config = base_config(PolicyKind::Unmanaged);
        let driver: Arc<dyn ContainerDriver> = Arc::new(AlwaysHealthyDriver {
            started: AtomicBool::new(false),
        });
        let events = Arc::new(EventBus::new());
        let activity = Arc::new(ActivityTracker::new());
        let ws_counter = WsCounter::new();

        let (handle, _join) = Policy::spawn(config, driver, events, activity, ws_counter);
        assert_eq!(handle.state(), PolicyState::Ready);
        handle.wake(); // no-op, must not panic
    }

    #[tokio::test]
    async fn on_demand_starts_sleeping() {
        let config = base_config(PolicyKind::OnDemand);
        let driver: Arc<dyn ContainerDriver> = Arc::new(AlwaysHealthyDriver {
            started: AtomicBool::new(false),
        });
        let events = Arc::new(EventBus::new());
        let activity = Arc::new(ActivityTracker::new());
        let ws_counter = WsCounter::new();

        let (handle, _join) = Policy::spawn(config, driver, events, activity, ws_counter);
        assert_eq!(handle.state(), PolicyState::Sleeping);
    }

    async fn spawn_fake_health_server(healthy: Arc<AtomicBool>) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let healthy = healthy.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let response = if healthy.load(Ordering::Relaxed) {
                        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
                    } else {
                        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n"
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn wake_emits_wake_event_before_ready() {
        let addr = spawn_fake_health_server(Arc::new(AtomicBool::new(true))).await;
        let config = AgentConfig {
            target: addr.to_string(),
            wake_timeout_secs: 2,
            ..base_config(PolicyKind::OnDemand)
        };
        let driver: Arc<dyn ContainerDriver> = Arc::new(AlwaysHealthyDriver {
            started: AtomicBool::new(false),
        });
        let events = Arc::new(EventBus::new());
        let activity = Arc::new(ActivityTracker::new());
        let ws_counter = WsCounter::new();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_handler = seen.clone();
        events.on_event(move |event| {
            seen_handler.lock().unwrap().push(event.event_type.clone());
        });

        let (handle, _join) = Policy::spawn(config, driver, events, activity, ws_counter);
        handle.wake();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while handle.state() != PolicyState::Ready && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.state(), PolicyState::Ready);

        let log = seen.lock().unwrap().clone();
        assert_eq!(log[0], event_type::AGENT_WAKE);
        assert!(log.contains(&event_type::AGENT_STARTING.to_string()));
        assert!(log.contains(&event_type::AGENT_READY.to_string()));
    }

    struct FlakyThenRestartFailsDriver {
        restart_calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ContainerDriver for FlakyThenRestartFailsDriver {
        async fn start(&self, _container: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn stop(&self, _container: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn restart(&self, _container: &str) -> Result<(), DriverError> {
            self.restart_calls.fetch_add(1, Ordering::Relaxed);
            Err(DriverError::CommandFailed {
                container: _container.to_string(),
                reason: "boom".to_string(),
            })
        }
        async fn status(&self, _container: &str) -> Result<RunState, DriverError> {
            Ok(RunState::Stopped)
        }
    }

    #[tokio::test]
    async fn restart_exhaustion_transitions_to_persistent_degraded() {
        let healthy = Arc::new(AtomicBool::new(true));
        let addr = spawn_fake_health_server(healthy.clone()).await;

        let config = AgentConfig {
            target: addr.to_string(),
            max_failures: 1,
            max_restart_attempts: 1,
            wake_timeout_secs: 2,
            health_interval_secs: 1,
            ..base_config(PolicyKind::OnDemand)
        };
        let driver: Arc<dyn ContainerDriver> = Arc::new(FlakyThenRestartFailsDriver {
            restart_calls: AtomicU32::new(0),
        });
        let events = Arc::new(EventBus::new());
        let activity = Arc::new(ActivityTracker::new());
        let ws_counter = WsCounter::new();

        let (handle, _join) = Policy::spawn(config, driver, events, activity, ws_counter);
        handle.wake();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while handle.state() != PolicyState::Ready && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.state(), PolicyState::Ready);

        healthy.store(false, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handle.state() != PolicyState::Degraded && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.state(), PolicyState::Degraded);
    }

    #[test]
    fn policy_state_as_str_matches_canonical_tokens() {
        assert_eq!(PolicyState::Sleeping.as_str(), "sleeping");
        assert_eq!(PolicyState::Starting.as_str(), "starting");
        assert_eq!(PolicyState::Ready.as_str(), "ready");
        assert_eq!(PolicyState::Degraded.as_str(), "degraded");
    }
}
