//! HTTP 路由模块
//!
//! 路由结构：
//! - `/health` - 健康检查
//! - `/metrics` - Prometheus 抓取端点
//! - `/api/conversations` - 会话列表 / 打开会话（X-User-Id）
//! - `/api/conversations/{conversation_id}/messages` - 发送 / 查询消息（X-User-Id）
//! - `/api/calls/history` - 通话历史（X-User-Id）

pub mod calls;
pub mod conversations;
pub mod health;
pub mod messages;
pub mod metrics;

use axum::{routing::get, Router};

use crate::http::HttpServerState;

/// 创建所有路由
pub fn create_routes() -> Router<HttpServerState> {
    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .merge(health::create_route())
        .merge(conversations::create_route())
        .merge(messages::create_route())
        .merge(calls::create_route())
}
