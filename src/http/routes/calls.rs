//! GET /api/calls/history?limit - 调用方的通话历史

use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::http::middleware::GatewayUser;
use crate::http::HttpServerState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 200;

pub fn create_route() -> Router<HttpServerState> {
    Router::new().route("/api/calls/history", get(call_history))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<usize>,
}

pub(crate) async fn call_history(
    State(state): State<HttpServerState>,
    GatewayUser(user_id): GatewayUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let entries = state.calls.history(user_id, limit).await?;
    Ok(Json(json!({
        "count": entries.len(),
        "data": entries,
    })))
}
