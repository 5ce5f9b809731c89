//! WebSocket 帧协议
//!
//! 每一帧是 `{"event": "<name>", "data": {...}}`，字段名 camelCase。
//! SDP / ICE 负载对服务端不透明，原样转发。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    CallId, CallType, ConnectionId, ConversationId, EndReason, LastMessagePreview,
    MediaAttachment, Message, MessageId, MessageStatus, PresenceStatus, UserId,
};

/// 客户端 -> 服务端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    RegisterUser {
        user_id: UserId,
    },
    JoinChat {
        chat_id: ConversationId,
        #[serde(default)]
        user_id: Option<UserId>,
    },
    LeaveChat {
        chat_id: ConversationId,
        #[serde(default)]
        user_id: Option<UserId>,
    },
    TypingStart {
        chat_id: ConversationId,
    },
    TypingStop {
        chat_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        media: Vec<MediaAttachment>,
        #[serde(default)]
        client_id: Option<String>,
    },
    WebrtcOffer {
        callee_id: UserId,
        offer: Value,
        call_type: CallType,
        /// 主叫展示信息（昵称、头像），原样转发
        #[serde(default)]
        caller: Value,
    },
    WebrtcAnswer {
        caller_id: UserId,
        answer: Value,
        call_id: CallId,
    },
    WebrtcIceCandidate {
        target_user_id: UserId,
        candidate: Value,
    },
    WebrtcCallEnd {
        target_user_id: UserId,
        #[serde(default)]
        call_id: Option<CallId>,
    },
    WebrtcCallDeclined {
        caller_id: UserId,
        #[serde(default)]
        call_id: Option<CallId>,
    },
    WebrtcMediaState {
        target_user_id: UserId,
        camera_on: bool,
        mic_on: bool,
    },
    CheckUserOnline {
        callee_id: UserId,
    },
}

impl ClientEvent {
    /// 事件名（日志/指标用）
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::RegisterUser { .. } => "register_user",
            ClientEvent::JoinChat { .. } => "join_chat",
            ClientEvent::LeaveChat { .. } => "leave_chat",
            ClientEvent::TypingStart { .. } => "typing_start",
            ClientEvent::TypingStop { .. } => "typing_stop",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::WebrtcOffer { .. } => "webrtc_offer",
            ClientEvent::WebrtcAnswer { .. } => "webrtc_answer",
            ClientEvent::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
            ClientEvent::WebrtcCallEnd { .. } => "webrtc_call_end",
            ClientEvent::WebrtcCallDeclined { .. } => "webrtc_call_declined",
            ClientEvent::WebrtcMediaState { .. } => "webrtc_media_state",
            ClientEvent::CheckUserOnline { .. } => "check_user_online",
        }
    }
}

/// 服务端 -> 客户端
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// 注册成功回执
    Registered {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    ReceiveMessage(Message),
    MessageStatusUpdate {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
        status: MessageStatus,
    },
    ConversationUpdate {
        conversation_id: ConversationId,
        last_message: Option<LastMessagePreview>,
        updated_at: i64,
        /// 接收方自己的绝对未读数
        unread_count: u32,
    },
    PresenceUpdate {
        user_id: UserId,
        status: PresenceStatus,
        last_seen: i64,
    },
    UserTypingStart {
        chat_id: ConversationId,
        user_id: UserId,
    },
    UserTypingStop {
        chat_id: ConversationId,
        user_id: UserId,
    },
    WebrtcOffer {
        call_id: CallId,
        from_user_id: UserId,
        caller: Value,
        offer: Value,
        call_type: CallType,
    },
    WebrtcAnswer {
        call_id: CallId,
        from_user_id: UserId,
        answer: Value,
    },
    WebrtcIceCandidate {
        from_user_id: UserId,
        candidate: Value,
    },
    WebrtcCallEnd {
        call_id: Option<CallId>,
        from_user_id: Option<UserId>,
        reason: EndReason,
    },
    WebrtcCallDeclined {
        call_id: Option<CallId>,
        from_user_id: UserId,
    },
    WebrtcMediaState {
        from_user_id: UserId,
        camera_on: bool,
        mic_on: bool,
    },
    CalleeStatus {
        callee_id: UserId,
        online: bool,
    },
    CallId {
        call_id: CallId,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Registered { .. } => "registered",
            ServerEvent::ReceiveMessage(_) => "receive_message",
            ServerEvent::MessageStatusUpdate { .. } => "message_status_update",
            ServerEvent::ConversationUpdate { .. } => "conversation_update",
            ServerEvent::PresenceUpdate { .. } => "presence_update",
            ServerEvent::UserTypingStart { .. } => "user_typing_start",
            ServerEvent::UserTypingStop { .. } => "user_typing_stop",
            ServerEvent::WebrtcOffer { .. } => "webrtc_offer",
            ServerEvent::WebrtcAnswer { .. } => "webrtc_answer",
            ServerEvent::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
            ServerEvent::WebrtcCallEnd { .. } => "webrtc_call_end",
            ServerEvent::WebrtcCallDeclined { .. } => "webrtc_call_declined",
            ServerEvent::WebrtcMediaState { .. } => "webrtc_media_state",
            ServerEvent::CalleeStatus { .. } => "callee_status",
            ServerEvent::CallId { .. } => "call_id",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_frames() {
        let frame = json!({"event": "join_chat", "data": {"chatId": 5, "userId": 1}});
        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinChat { chat_id: ConversationId(5), user_id: Some(UserId(1)) }
        );

        let frame = json!({
            "event": "webrtc_offer",
            "data": {"calleeId": 2, "offer": {"sdp": "v=0"}, "callType": "video"}
        });
        let event: ClientEvent = serde_json::from_value(frame).unwrap();
        assert_eq!(event.name(), "webrtc_offer");
    }

    #[test]
    fn test_unknown_event_rejected() {
        let frame = json!({"event": "message_read", "data": {"messageId": 1}});
        assert!(serde_json::from_value::<ClientEvent>(frame).is_err());
    }

    #[test]
    fn test_server_event_wire_shape() {
        let event = ServerEvent::MessageStatusUpdate {
            conversation_id: ConversationId(3),
            message_ids: vec![MessageId(10), MessageId(11)],
            status: MessageStatus::Delivered,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "message_status_update");
        assert_eq!(value["data"]["conversationId"], 3);
        assert_eq!(value["data"]["messageIds"], json!([10, 11]));
        assert_eq!(value["data"]["status"], "delivered");

        let value = serde_json::to_value(ServerEvent::CallId { call_id: CallId(99) }).unwrap();
        assert_eq!(value, json!({"event": "call_id", "data": {"callId": 99}}));
    }
}
