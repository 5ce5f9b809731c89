use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{ConversationId, Message, MessageId, PresenceRecord, UserId};

/// 会话列表里展示的最后一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessagePreview {
    pub message_id: MessageId,
    pub content: String,
    pub sender_id: UserId,
    pub timestamp: i64,
}

impl From<&Message> for LastMessagePreview {
    fn from(message: &Message) -> Self {
        Self {
            message_id: message.id,
            content: message.preview_text(),
            sender_id: message.sender_id,
            timestamp: message.timestamp,
        }
    }
}

/// 一对一会话聚合
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: [UserId; 2],
    pub last_message: Option<LastMessagePreview>,
    pub updated_at: i64,
    /// 每个参与者的未读数，缺省为 0
    pub unread_count: HashMap<UserId, u32>,
}

impl Conversation {
    pub fn new(id: ConversationId, a: UserId, b: UserId, created_at: i64) -> Self {
        Self {
            id,
            participants: [a, b],
            last_message: None,
            updated_at: created_at,
            unread_count: HashMap::from([(a, 0), (b, 0)]),
        }
    }

    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participants.contains(&user_id)
    }

    /// 对方参与者
    pub fn other_participant(&self, user_id: UserId) -> Option<UserId> {
        match self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }

    pub fn unread_for(&self, user_id: UserId) -> u32 {
        self.unread_count.get(&user_id).copied().unwrap_or(0)
    }
}

/// 会话列表条目：某个用户视角下的会话，附带对方的在线状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub partner_id: UserId,
    pub is_online: bool,
    pub last_seen: i64,
    pub last_message: Option<LastMessagePreview>,
    pub updated_at: i64,
    pub unread_count: u32,
}

impl ConversationSummary {
    /// `viewer` 不是参与者时返回 None
    pub fn for_viewer(conversation: &Conversation, viewer: UserId, partner: &PresenceRecord) -> Option<Self> {
        let partner_id = conversation.other_participant(viewer)?;
        Some(Self {
            id: conversation.id,
            partner_id,
            is_online: partner.status.is_connected(),
            last_seen: partner.last_seen,
            last_message: conversation.last_message.clone(),
            updated_at: conversation.updated_at,
            unread_count: conversation.unread_for(viewer),
        })
    }
}
