//! Endpoints served by the proxy itself
//!
//! Requests that are not proxy requests (origin-form, non-CONNECT) land here.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tracing::error;

use crate::error::Result;
use crate::interfaces::EgressPolicy;

/// Build the router for `/health` and `/ips`
pub fn router(policy: Arc<dyn EgressPolicy>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ips", get(list_ips))
        .with_state(policy)
}

async fn health() -> &'static str {
    "ok"
}

/// List the egress addresses currently permitted
async fn list_ips(State(policy): State<Arc<dyn EgressPolicy>>) -> Result<Json<Value>> {
    let ips = policy
        .available()
        .inspect_err(|e| error!("Failed to list egress IPs: {}", e))?;

    Ok(Json(json!({ "ips": ips })))
}
