//! HTTP 服务器模块 - 使用 Axum 提供 WebSocket 接入和少量 HTTP 接口
//!
//! 功能包括：
//! - `GET /ws` 实时事件通道
//! - 发送消息 / 查询消息的 HTTP 入口（与 WebSocket send_message 走同一流程）
//! - 通话历史
//! - 健康检查与 Prometheus 指标

pub mod middleware;
pub mod routes;
pub mod ws;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::server::RealtimeServices;

/// HTTP 路由共享状态
pub type HttpServerState = Arc<RealtimeServices>;

/// 构建完整路由
pub fn create_router(state: HttpServerState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .merge(routes::create_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
