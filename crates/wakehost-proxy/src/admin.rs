//! Admin/service HTTP API: status and service (de)registration, exposed
//! only on the admin listener.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use wakehost_registry::types::DynamicService;

use crate::proxy::Proxy;

pub fn router() -> Router<Arc<Proxy>> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/services", get(list_services).post(register_service))
        .route("/api/services/{hostname}", delete(deregister_service))
        .route("/api/agents", get(list_agents))
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_agents(State(state): State<Arc<Proxy>>) -> Json<Value> {
    let agents: Vec<Value> = state
        .backends
        .list()
        .into_iter()
        .map(|b| {
            json!({
                "name": b.name,
                "hostname": b.hostname,
                "target": b.target,
                "state": b.state().as_str(),
            })
        })
        .collect();
    Json(json!({ "success": true, "agents": agents }))
}

async fn list_services(State(state): State<Arc<Proxy>>) -> Json<Value> {
    let services: Vec<Value> = state
        .registry
        .list_dynamic()
        .into_iter()
        .map(|s| {
            json!({
                "hostname": s.hostname,
                "target": s.target,
                "owner_agent": s.owner_agent,
                "registered_at": s.registered_at,
            })
        })
        .collect();
    Json(json!({ "success": true, "services": services }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterServiceRequest {
    pub hostname: String,
    pub target: String,
    pub owner_agent: String,
}

async fn register_service(
    State(state): State<Arc<Proxy>>,
    Json(req): Json<RegisterServiceRequest>,
) -> Json<Value> {
    let service = DynamicService::new(req.hostname, req.target, req.owner_agent);
    match state.registry.register(service) {
        Ok(()) => Json(json!({ "success": true })),
        Err(err) => Json(json!({ "success": false, "error": err.to_string() })),
    }
}

#[derive(Debug, Deserialize)]
pub struct DeregisterServiceQuery {
    pub owner_agent: String,
}

async fn deregister_service(
    State(state): State<Arc<Proxy>>,
    Path(hostname): Path<String>,
    axum::extract::Query(query): axum::extract::Query<DeregisterServiceQuery>,
) -> Json<Value> {
    match state.registry.deregister(&hostname, &query.owner_agent) {
        Ok(()) => Json(json!({ "success": true })),
        Err(err) => Json(json!({ "success": false, "error": err.to_string() })),
    }
}
