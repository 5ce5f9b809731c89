//! GET /metrics - Prometheus 抓取端点

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::http::HttpServerState;
use crate::infra::metrics;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// 抓取前刷新 Gauge，未调用 `metrics::init()` 时返回 503
pub async fn metrics_handler(State(state): State<HttpServerState>) -> Response {
    metrics::record_connection_count(state.hub.stats().connections as u64);
    metrics::record_live_calls(state.calls.live_calls() as u64);

    match metrics::render_metrics() {
        Some(body) => (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}
