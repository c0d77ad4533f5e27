//! Main proxy handler: dispatches by Host header, wakes sleeping OnDemand
//! backends, fences traffic while a backend is starting, and forwards
//! everything else through a pooled hyper client.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Json;
use axum::Router;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::debug;

use wakehost_policy::PolicyState;
use wakehost_registry::registry::LookupResult;
use wakehost_registry::types::DynamicService;

use crate::backend::{Backend, BackendTable};
use crate::proxy::Proxy;
use crate::wstunnel;

/// The public-listener router: every host-routed request falls through to
/// `proxy_handler`, wrapped in request/response tracing.
pub fn router() -> Router<Arc<Proxy>> {
    Router::new()
        .fallback(any(proxy_handler))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("no route for host: {0}")]
    NotFound(String),

    #[error("backend {agent} is not ready ({status:?})")]
    NotReady { agent: String, status: PolicyState },
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::InvalidUri(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ProxyError::UpstreamError(msg) => (StatusCode::BAD_GATEWAY, msg).into_response(),
            ProxyError::NotFound(host) => (
                StatusCode::NOT_FOUND,
                format!("no route for {host}"),
            )
                .into_response(),
            ProxyError::NotReady { agent, status } => {
                let mut response = Json(json!({ "status": status.as_str(), "agent": agent })).into_response();
                *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                response.headers_mut().insert("Retry-After", HeaderValue::from_static("3"));
                response
            }
        }
    }
}

pub async fn proxy_handler(
    State(state): State<Arc<crate::proxy::Proxy>>,
    ConnectInfo(client_addr): ConnectInfo<std::net::SocketAddr>,
    req: Request,
) -> Result<Response, ProxyError> {
    let host_header = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let hostname = host_header.split(':').next().unwrap_or("").to_ascii_lowercase();
    let path = req.uri().path();

    debug!(client = %client_addr, host = %hostname, path = %path, "incoming request");

    if path.starts_with("/api/services") {
        return Err(ProxyError::NotFound(hostname));
    }

    if let Some(backend) = state.backends.lookup(&hostname) {
        return backend_flow(&state, backend, client_addr, req).await;
    }

    if let Some(LookupResult::Dynamic(service)) = state.registry.lookup(&hostname) {
        return dynamic_flow(&state, service, client_addr, req).await;
    }

    Err(ProxyError::NotFound(hostname))
}

/// Health/wake sub-routes, wake-on-request, and the sleeping/starting
/// fence, then forwarding through the reverse-proxy path.
async fn backend_flow(
    state: &crate::proxy::Proxy,
    backend: Backend,
    client_addr: std::net::SocketAddr,
    req: Request,
) -> Result<Response, ProxyError> {
    let path = req.uri().path();

    if req.method() == Method::GET && path == "/api/health" {
        return Ok(health_response(&backend));
    }

    if req.method() == Method::POST && path == "/api/wake" {
        backend.policy.wake();
        return Ok(Json(json!({ "status": "ok" })).into_response());
    }

    backend.policy.wake();
    state.activity.touch(&backend.name);
    state.lru.touch(&backend.name);

    let current = backend.state();
    if matches!(current, PolicyState::Sleeping | PolicyState::Starting) {
        return Err(ProxyError::NotReady {
            agent: backend.name.clone(),
            status: current,
        });
    }

    forward_request(
        state,
        &backend.name,
        &backend.target,
        &backend.hostname,
        client_addr,
        req,
    )
    .await
}

fn health_response(backend: &Backend) -> Response {
    let status = backend.state();
    let body = Json(json!({ "status": status.as_str(), "agent": backend.name }));
    let mut response = body.into_response();
    if status == PolicyState::Ready {
        *response.status_mut() = StatusCode::OK;
    } else {
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        response
            .headers_mut()
            .insert("Cache-Control", HeaderValue::from_static("no-cache"));
    }
    response
}

/// A hostname routed through the dynamic ServiceRegistry rather than a
/// statically configured agent. Always treated as reachable: the
/// registrant owns its own process lifecycle.
async fn dynamic_flow(
    state: &crate::proxy::Proxy,
    service: DynamicService,
    client_addr: std::net::SocketAddr,
    req: Request,
) -> Result<Response, ProxyError> {
    service
        .target
        .parse::<SocketAddr>()
        .map_err(|e| ProxyError::UpstreamError(format!("invalid dynamic target {}: {e}", service.target)))?;

    state.activity.touch(&service.owner_agent);

    forward_request(
        state,
        &service.owner_agent,
        &service.target,
        &service.hostname,
        client_addr,
        req,
    )
    .await
}

/// Shared forwarding path for both a statically configured backend and a
/// dynamically registered service: sets `X-Forwarded-*`, dispatches to the
/// WebSocket tunnel or the pooled hyper client depending on the request.
async fn forward_request(
    state: &crate::proxy::Proxy,
    agent: &str,
    target: &str,
    forwarded_host: &str,
    client_addr: std::net::SocketAddr,
    mut req: Request,
) -> Result<Response, ProxyError> {
    let is_websocket = wstunnel::is_websocket_upgrade(&req);

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let headers = req.headers_mut();
    if let Ok(val) = HeaderValue::from_str(forwarded_host) {
        headers.insert("X-Forwarded-Host", val);
    }
    headers.insert("X-Forwarded-Proto", HeaderValue::from_static("http"));
    if let Ok(val) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert("X-Forwarded-For", val.clone());
        headers.insert("X-Real-IP", val);
    }

    if is_websocket {
        let target_path = format!("http://{target}{path_and_query}");
        return wstunnel::handle_websocket_upgrade(
            req,
            agent.to_string(),
            target.to_string(),
            target_path,
            state.activity.clone(),
            state.ws_counter.clone(),
        )
        .await;
    }

    let headers = req.headers_mut();
    headers.remove("connection");
    headers.remove("upgrade");

    let target_url = format!("http://{target}{path_and_query}");
    let target_uri: Uri = target_url
        .parse()
        .map_err(|e| ProxyError::InvalidUri(format!("{e}")))?;
    *req.uri_mut() = target_uri;

    let response = state
        .client
        .request(req)
        .await
        .map_err(|e| ProxyError::UpstreamError(e.to_string()))?;

    Ok(response.into_response())
}

pub fn new_client() -> Client<HttpConnector, Body> {
    Client::builder(TokioExecutor::new()).build_http()
}
