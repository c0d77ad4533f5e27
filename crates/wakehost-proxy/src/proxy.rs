//! Shared proxy state: a single struct threaded through axum's `State`
//! extractor that owns the pooled HTTP client, the backend routing table,
//! and the lifecycle bookkeeping the handler and admin API both need.

use std::sync::Arc;

use axum::body::Body;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;

use wakehost_policy::{ActivityTracker, LruManager, WsCounter};
use wakehost_registry::ServiceRegistry;

use crate::backend::BackendTable;
use crate::handler::new_client;

pub struct Proxy {
    pub client: Client<HttpConnector, Body>,
    pub backends: BackendTable,
    pub activity: Arc<ActivityTracker>,
    pub ws_counter: WsCounter,
    pub lru: Arc<LruManager>,
    pub registry: Arc<ServiceRegistry>,
}

impl Proxy {
    pub fn new(
        activity: Arc<ActivityTracker>,
        ws_counter: WsCounter,
        lru: Arc<LruManager>,
        registry: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            client: new_client(),
            backends: BackendTable::new(),
            activity,
            ws_counter,
            lru,
            registry,
        }
    }
}
