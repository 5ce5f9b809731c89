//! GET /health

use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};

use crate::http::HttpServerState;

pub fn create_route() -> Router<HttpServerState> {
    Router::new().route("/health", get(health))
}

pub(crate) async fn health(State(state): State<HttpServerState>) -> Json<Value> {
    let stats = state.hub.stats();
    Json(json!({
        "status": "ok",
        "connections": stats.connections,
        "channels": stats.channels,
        "liveCalls": state.calls.live_calls(),
    }))
}
