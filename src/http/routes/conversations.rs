//! 会话列表路由
//!
//! - `GET  /api/conversations?limit&cursor` 调用方的会话，按 updatedAt 倒序
//! - `POST /api/conversations` 打开与 `peerId` 的会话，不存在则创建

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
use crate::model::UserId;
use crate::repository::ConversationPage;

pub fn create_route() -> Router<HttpServerState> {
    Router::new().route(
        "/api/conversations",
        get(list_conversations).post(open_conversation),
    )
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    limit: Option<usize>,
    /// 上一页返回的 nextCursor
    cursor: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OpenBody {
    peer_id: UserId,
}

pub(crate) async fn list_conversations(
    State(state): State<HttpServerState>,
    GatewayUser(user_id): GatewayUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>> {
    let page = ConversationPage::new(query.limit.unwrap_or(20), query.cursor);
    let page = state.conversation_list.list(user_id, page).await?;
    Ok(Json(json!({
        "conversations": page.conversations,
        "nextCursor": page.next_cursor,
    })))
}

pub(crate) async fn open_conversation(
    State(state): State<HttpServerState>,
    GatewayUser(user_id): GatewayUser,
    Json(body): Json<OpenBody>,
) -> Result<Json<Value>> {
    let conversation = state.conversation_list.open(user_id, body.peer_id).await?;
    Ok(Json(json!({ "conversation": conversation })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::ServerError;
    use crate::http::routes::messages::{send_message, SendMessageBody};
    use crate::server::RealtimeServices;
    use axum::extract::Path;
    use crate::model::ConversationId;

    #[tokio::test]
    async fn test_open_then_send_then_list() {
        let state = RealtimeServices::in_memory(ServerConfig::default());

        let Json(opened) = open_conversation(
            State(state.clone()),
            GatewayUser(UserId(1)),
            Json(OpenBody { peer_id: UserId(2) }),
        )
        .await
        .unwrap();
        let conversation_id: ConversationId =
            serde_json::from_value(opened["conversation"]["id"].clone()).unwrap();
        assert_eq!(opened["conversation"]["partnerId"], 2);
        assert_eq!(opened["conversation"]["isOnline"], false);

        send_message(
            State(state.clone()),
            GatewayUser(UserId(1)),
            Path(conversation_id),
            Json(SendMessageBody::text("hello")),
        )
        .await
        .unwrap();

        let Json(listed) = list_conversations(
            State(state.clone()),
            GatewayUser(UserId(2)),
            Query(ListQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(listed["conversations"].as_array().map(Vec::len), Some(1));
        assert_eq!(listed["conversations"][0]["unreadCount"], 1);
        assert_eq!(listed["conversations"][0]["lastMessage"]["content"], "hello");
        assert!(listed["nextCursor"].is_null());
    }

    #[tokio::test]
    async fn test_open_with_self_is_rejected() {
        let state = RealtimeServices::in_memory(ServerConfig::default());
        let result = open_conversation(
            State(state),
            GatewayUser(UserId(1)),
            Json(OpenBody { peer_id: UserId(1) }),
        )
        .await;
        assert!(matches!(result, Err(ServerError::Validation(_))));
    }
}
