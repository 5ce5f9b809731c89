//! 会话消息路由
//!
//! - `POST /api/conversations/{conversation_id}/messages` 发送消息
//! - `GET  /api/conversations/{conversation_id}/messages?limit&before` 历史消息，
//!   页满时带 `nextCursor`（本页最早一条的时间戳），作为下一页的 `before`
//!
//! 发送与 WebSocket `send_message` 走同一条投递流程，房间里的连接同样会收到 `receive_message`。

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::http::middleware::GatewayUser;
use crate::http::HttpServerState;
use crate::model::{ConversationId, MediaAttachment};
use crate::repository::MessagePage;
use crate::service::SendMessageRequest;

pub fn create_route() -> Router<HttpServerState> {
    Router::new().route(
        "/api/conversations/{conversation_id}/messages",
        get(list_messages).post(send_message),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SendMessageBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    media: Vec<MediaAttachment>,
    #[serde(default)]
    client_id: Option<String>,
}

#[cfg(test)]
impl SendMessageBody {
    pub(crate) fn text(content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            media: Vec::new(),
            client_id: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<usize>,
    before: Option<i64>,
}

pub(crate) async fn send_message(
    State(state): State<HttpServerState>,
    GatewayUser(sender_id): GatewayUser,
    Path(conversation_id): Path<ConversationId>,
    Json(body): Json<SendMessageBody>,
) -> Result<(StatusCode, Json<Value>)> {
    let outcome = state
        .delivery
        .send_message(SendMessageRequest {
            conversation_id,
            sender_id,
            content: body.content,
            media: body.media,
            client_id: body.client_id,
        })
        .await?;

    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(json!({
            "isSuccess": true,
            "sentMessage": outcome.message,
        })),
    ))
}

pub(crate) async fn list_messages(
    State(state): State<HttpServerState>,
    GatewayUser(user_id): GatewayUser,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>> {
    let page = MessagePage::new(query.limit.unwrap_or(50), query.before);
    let messages = state.delivery.history(conversation_id, user_id, page).await?;
    // 升序返回，最早的一条在最前
    let next_cursor = if messages.len() == page.limit {
        messages.first().map(|m| m.timestamp)
    } else {
        None
    };
    Ok(Json(json!({
        "count": messages.len(),
        "data": messages,
        "nextCursor": next_cursor,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::ServerError;
    use crate::model::{MessageStatus, UserId};
    use crate::server::RealtimeServices;

    fn body(content: &str, client_id: Option<&str>) -> Json<SendMessageBody> {
        Json(SendMessageBody {
            content: Some(content.to_string()),
            media: Vec::new(),
            client_id: client_id.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn test_send_then_list() {
        let state = RealtimeServices::in_memory(ServerConfig::default());
        let conversation = state
            .conversations
            .find_or_create_between(UserId(1), UserId(2))
            .await
            .unwrap();

        let (status, Json(created)) = send_message(
            State(state.clone()),
            GatewayUser(UserId(1)),
            Path(conversation.id),
            body("hello", Some("c-1")),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["isSuccess"], true);
        assert_eq!(created["sentMessage"]["content"], "hello");
        // 接收方离线
        assert_eq!(created["sentMessage"]["status"], MessageStatus::Sent.as_str());

        // 同一 clientId 重发返回同一条消息
        let (status, Json(replayed)) = send_message(
            State(state.clone()),
            GatewayUser(UserId(1)),
            Path(conversation.id),
            body("hello", Some("c-1")),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(replayed["sentMessage"]["id"], created["sentMessage"]["id"]);

        let Json(history) = list_messages(
            State(state.clone()),
            GatewayUser(UserId(2)),
            Path(conversation.id),
            Query(HistoryQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(history["count"], 1);
        assert!(history["nextCursor"].is_null());
    }

    #[tokio::test]
    async fn test_history_cursor_walks_back() {
        let state = RealtimeServices::in_memory(ServerConfig::default());
        let conversation = state
            .conversations
            .find_or_create_between(UserId(1), UserId(2))
            .await
            .unwrap();
        for i in 0..3 {
            send_message(
                State(state.clone()),
                GatewayUser(UserId(1)),
                Path(conversation.id),
                body(&format!("m{}", i), None),
            )
            .await
            .unwrap();
            // 时间戳是毫秒，错开保证游标能区分
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let Json(latest) = list_messages(
            State(state.clone()),
            GatewayUser(UserId(2)),
            Path(conversation.id),
            Query(HistoryQuery {
                limit: Some(2),
                before: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(latest["data"][0]["content"], "m1");
        assert_eq!(latest["data"][1]["content"], "m2");
        let cursor = latest["nextCursor"].as_i64();
        assert!(cursor.is_some());

        let Json(older) = list_messages(
            State(state),
            GatewayUser(UserId(2)),
            Path(conversation.id),
            Query(HistoryQuery {
                limit: Some(2),
                before: cursor,
            }),
        )
        .await
        .unwrap();
        assert_eq!(older["count"], 1);
        assert_eq!(older["data"][0]["content"], "m0");
        assert!(older["nextCursor"].is_null());
    }

    #[tokio::test]
    async fn test_outsider_is_forbidden() {
        let state = RealtimeServices::in_memory(ServerConfig::default());
        let conversation = state
            .conversations
            .find_or_create_between(UserId(1), UserId(2))
            .await
            .unwrap();

        let result = send_message(
            State(state.clone()),
            GatewayUser(UserId(3)),
            Path(conversation.id),
            body("hi", None),
        )
        .await;
        assert!(matches!(result, Err(ServerError::Forbidden(_))));

        let result = list_messages(
            State(state),
            GatewayUser(UserId(3)),
            Path(conversation.id),
            Query(HistoryQuery::default()),
        )
        .await;
        assert!(matches!(result, Err(ServerError::Forbidden(_))));
    }
}
