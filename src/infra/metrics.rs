//! Prometheus 指标：连接数、在线用户数、消息发送量、状态推进、通话结果
//!
//! 通过 `init()` 安装全局 Recorder，通过 HTTP GET `/metrics` 暴露抓取端点。
//! 未初始化时各 record_* 调用是空操作。

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
const GAUGE_CONNECTIONS: &str = "privchat_realtime_connections_current";
const GAUGE_LIVE_CALLS: &str = "privchat_realtime_live_calls_current";
const COUNTER_USERS_ONLINE: &str = "privchat_realtime_user_online_total";
const COUNTER_USERS_OFFLINE: &str = "privchat_realtime_user_offline_total";
const COUNTER_MESSAGES_SENT: &str = "privchat_realtime_messages_sent_total";
const COUNTER_MESSAGES_REPLAYED: &str = "privchat_realtime_messages_replayed_total";
const COUNTER_STATUS_ADVANCED: &str = "privchat_realtime_status_advanced_total";
const COUNTER_RECONCILE_BATCHES: &str = "privchat_realtime_reconcile_batches_total";
const COUNTER_CALLS: &str = "privchat_realtime_calls_total";
const COUNTER_CLIENT_EVENTS: &str = "privchat_realtime_client_events_total";
const COUNTER_PRESENCE_ERRORS: &str = "privchat_realtime_presence_errors_total";

/// 初始化 Prometheus 指标（安装全局 Recorder）。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    HANDLE
        .set(handle)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

pub fn is_initialized() -> bool {
    HANDLE.get().is_some()
}

/// 渲染当前指标为 Prometheus 文本格式
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// 更新当前连接数（Gauge）
pub fn record_connection_count(count: u64) {
    metrics::gauge!(GAUGE_CONNECTIONS).set(count as f64);
}

/// 本进程内未结束的通话数（Gauge）
pub fn record_live_calls(count: u64) {
    metrics::gauge!(GAUGE_LIVE_CALLS).set(count as f64);
}

/// 用户 0 -> 1 连接
pub fn record_user_online() {
    metrics::counter!(COUNTER_USERS_ONLINE).increment(1);
}

/// 用户最后一个连接断开
pub fn record_user_offline() {
    metrics::counter!(COUNTER_USERS_OFFLINE).increment(1);
}

pub fn record_message_sent() {
    metrics::counter!(COUNTER_MESSAGES_SENT).increment(1);
}

/// clientId 重放命中
pub fn record_message_replayed() {
    metrics::counter!(COUNTER_MESSAGES_REPLAYED).increment(1);
}

/// 状态推进次数（按目标状态）
pub fn record_status_advanced(status: &'static str, count: u64) {
    metrics::counter!(COUNTER_STATUS_ADVANCED, "status" => status).increment(count);
}

/// 批量对账事件数（kind = delivered / read）
pub fn record_reconcile_batch(kind: &'static str) {
    metrics::counter!(COUNTER_RECONCILE_BATCHES, "kind" => kind).increment(1);
}

/// 通话结果（outcome = started / connected / hangup / declined / timeout）
pub fn record_call(outcome: &'static str) {
    metrics::counter!(COUNTER_CALLS, "outcome" => outcome).increment(1);
}

pub fn record_client_event(event: &'static str) {
    metrics::counter!(COUNTER_CLIENT_EVENTS, "event" => event).increment(1);
}

/// Presence 存储失败（已降级处理）
pub fn record_presence_error(op: &'static str) {
    metrics::counter!(COUNTER_PRESENCE_ERRORS, "op" => op).increment(1);
}
