//! SIGHUP config reload and graceful shutdown. Reload means re-reading
//! the YAML file and reconciling the running set of `Policy` tasks
//! against it.

use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use wakehost_common::config::ConfigSource;

use crate::daemon::Daemon;

pub async fn handle_sighup(config_source: ConfigSource, daemon: Arc<Daemon>) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    while let Some(signal) = signals.next().await {
        if signal == SIGHUP {
            info!("received SIGHUP, reloading config");
            match config_source.load() {
                Ok(new_config) => {
                    daemon.reconcile(new_config).await;
                    info!("config reloaded");
                }
                Err(err) => {
                    error!(%err, "failed to reload config, keeping previous configuration");
                }
            }
        }
    }

    Ok(())
}

/// Shutdown drain timeout: the proxy stops accepting new work immediately,
/// but open WebSocket tunnels get this long to close on their own before
/// the process exits anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn wait_for_shutdown(daemon: Arc<Daemon>) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining open connections");

    match tokio::time::timeout(DRAIN_TIMEOUT, daemon.proxy.ws_counter.wait_all_closed()).await {
        Ok(()) => info!("all websocket tunnels drained"),
        Err(_) => warn!("drain timeout elapsed with connections still open, exiting anyway"),
    }

    Ok(())
}
