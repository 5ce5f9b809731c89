//! WebSocket 接入
//!
//! 每条连接拆成读写两半：写任务从 Hub 的连接队列取事件并定时发 Ping，
//! 读循环解析客户端事件后交给 [`EventDispatcher`](crate::handler::EventDispatcher)。

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::context::SessionContext;
use crate::error::ServerError;
use crate::http::HttpServerState;
use crate::infra::{EventEmitter, EventReceiver};
use crate::protocol::{ClientEvent, ServerEvent};

/// 两次 presence 刷新之间的最小间隔
const HEARTBEAT_THROTTLE: Duration = Duration::from_secs(5);

/// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<HttpServerState>,
) -> Response {
    let connections = state.hub.stats().connections;
    if connections >= state.config.max_connections as usize {
        warn!("🚫 连接数已达上限 {}，拒绝 {}", state.config.max_connections, addr);
        return ServerError::ServiceUnavailable("连接数已达上限".to_string()).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: HttpServerState) {
    let (connection_id, outbound) = state.hub.connect();
    info!("🔌 新连接 {} 来自 {}", connection_id, addr);

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound, state.config.heartbeat()));

    let mut ctx = SessionContext::new(connection_id, Some(addr));
    let session = state.dispatcher.session().clone();
    let mut last_refresh = Instant::now();

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!("连接 {} 读取失败: {}", connection_id, e);
                break;
            }
        };

        if last_refresh.elapsed() >= HEARTBEAT_THROTTLE {
            session.heartbeat(&ctx).await;
            last_refresh = Instant::now();
        }

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => {
                warn!("连接 {} 发送了二进制帧 ({} bytes)", connection_id, data.len());
                reply_error(&state, &ctx, "不支持二进制帧".to_string());
                continue;
            }
            Message::Close(frame) => {
                debug!("连接 {} 主动关闭: {:?}", connection_id, frame);
                break;
            }
            // Pong 已经刷新过心跳，Ping 由 axum 自动回复
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let event: ClientEvent = match serde_json::from_str(text.as_str()) {
            Ok(event) => event,
            Err(e) => {
                debug!("连接 {} 的帧无法解析: {}", connection_id, e);
                reply_error(&state, &ctx, format!("无法解析的事件: {}", e));
                continue;
            }
        };

        let name = event.name();
        if let Err(e) = state.dispatcher.dispatch(&mut ctx, event).await {
            if e.status_code().is_client_error() {
                debug!("连接 {} 的 {} 被拒绝: {}", connection_id, name, e);
                reply_error(&state, &ctx, e.to_string());
            } else {
                error!("❌ 连接 {} 处理 {} 失败: {}", connection_id, name, e);
            }
        }
    }

    session.on_disconnect(&ctx).await;
    writer.abort();
    info!("🔌 连接 {} 已断开 (user: {:?})", connection_id, ctx.user_id);
}

fn reply_error(state: &HttpServerState, ctx: &SessionContext, message: String) {
    state
        .hub
        .send_to(ctx.connection_id, ServerEvent::Error { message });
}

/// 写任务：按入队顺序写出事件，空闲时按心跳间隔发 Ping
async fn write_loop<S>(mut sink: S, mut outbound: EventReceiver, heartbeat: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ticker = interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let frame = tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else { break };
                match serde_json::to_string(&event) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        error!("❌ 事件 {} 序列化失败: {}", event.name(), e);
                        continue;
                    }
                }
            }
            _ = ticker.tick() => Message::Ping(Default::default()),
        };

        if let Err(e) = sink.send(frame).await {
            debug!("写出失败，结束写任务: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}
