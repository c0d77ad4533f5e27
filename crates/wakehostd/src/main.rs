mod daemon;
mod signals;
mod supervisor;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tracing::{error, info};

use wakehost_common::config::{ConfigSource, GlobalConfig};
use wakehost_common::events::{event_type, EventBus};
use wakehost_container::DockerDriver;
use wakehost_policy::{ActivityTracker, LruManager, WsCounter};
use wakehost_registry::ServiceRegistry;

use daemon::Daemon;
use supervisor::{spawn_supervised, ServicePriority};

fn config_path() -> PathBuf {
    std::env::var("WAKEHOST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/wakehost/config.yaml"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wakehostd=debug,tower_http=debug".parse().unwrap()),
        )
        .init();

    info!("wakehostd starting");

    let config_source = ConfigSource::new(config_path());
    let config: GlobalConfig = config_source.load().unwrap_or_else(|err| {
        error!(%err, "failed to load config, starting with an empty agent set");
        GlobalConfig::default()
    });

    let events = Arc::new(EventBus::new());
    let activity = Arc::new(ActivityTracker::new());
    let ws_counter = WsCounter::new();
    let lru = Arc::new(LruManager::new(config.max_ready_on_demand));
    let registry = Arc::new(ServiceRegistry::new());
    let driver: Arc<dyn wakehost_common::container::ContainerDriver> = Arc::new(DockerDriver::new());

    let proxy = Arc::new(wakehost_proxy::Proxy::new(
        activity.clone(),
        ws_counter.clone(),
        lru.clone(),
        registry.clone(),
    ));

    wire_lru_eviction(&events, &proxy, &lru);

    let daemon = Daemon::new(proxy.clone(), events.clone(), driver);
    daemon.reconcile(config.clone()).await;

    let public_addr: SocketAddr = config.listen_addr.parse()?;
    let admin_addr: SocketAddr = config.admin_addr.parse()?;

    let public_proxy = proxy.clone();
    spawn_supervised("public-listener", ServicePriority::Critical, move || {
        let proxy = public_proxy.clone();
        async move { run_public_listener(public_addr, proxy).await }
    });

    let admin_proxy = proxy.clone();
    spawn_supervised("admin-listener", ServicePriority::Important, move || {
        let proxy = admin_proxy.clone();
        async move { run_admin_listener(admin_addr, proxy).await }
    });

    let sighup_daemon = daemon.clone();
    tokio::spawn(async move {
        if let Err(err) = signals::handle_sighup(config_source, sighup_daemon).await {
            error!(%err, "SIGHUP handler exited");
        }
    });

    info!(listen = %public_addr, admin = %admin_addr, "wakehostd ready");

    signals::wait_for_shutdown(daemon).await?;
    info!("wakehostd exiting");
    Ok(())
}

async fn run_public_listener(addr: SocketAddr, proxy: Arc<wakehost_proxy::Proxy>) -> anyhow::Result<()> {
    let app: Router = wakehost_proxy::handler::router().with_state(proxy);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn run_admin_listener(addr: SocketAddr, proxy: Arc<wakehost_proxy::Proxy>) -> anyhow::Result<()> {
    let app = wakehost_proxy::admin::router().with_state(proxy);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Subscribe the LRU manager to lifecycle events, and enforce the ready
/// cap by evicting the least-recently-used agent whenever a newly ready
/// agent pushes the ready set over capacity.
fn wire_lru_eviction(events: &Arc<EventBus>, proxy: &Arc<wakehost_proxy::Proxy>, lru: &Arc<LruManager>) {
    let lru_ready = lru.clone();
    let proxy_ready = proxy.clone();
    events.on_event(move |event| {
        if event.event_type != event_type::AGENT_READY {
            return;
        }
        lru_ready.mark_ready(&event.agent);
        if let Some(victim) = lru_ready.eviction_candidate() {
            if victim != event.agent {
                if let Some(backend) = proxy_ready.backends.list().into_iter().find(|b| b.name == victim) {
                    backend.policy.evict();
                }
            }
        }
    });

    let lru_sleep = lru.clone();
    let registry_sleep = proxy.registry.clone();
    events.on_event(move |event| {
        if event.event_type != event_type::AGENT_SLEEP {
            return;
        }
        lru_sleep.mark_sleeping(&event.agent);
        registry_sleep.deregister_by_agent(&event.agent);
    });
}
