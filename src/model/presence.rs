use serde::{Deserialize, Serialize};

use super::ConversationId;

/// 在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Offline,
    Online,
    InChat,
}

impl PresenceStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, PresenceStatus::Online | PresenceStatus::InChat)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Offline => "offline",
            PresenceStatus::Online => "online",
            PresenceStatus::InChat => "in_chat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offline" => Some(PresenceStatus::Offline),
            "online" => Some(PresenceStatus::Online),
            "in_chat" => Some(PresenceStatus::InChat),
            _ => None,
        }
    }
}

/// 每个用户一条、带版本号的在线状态记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    /// 仅在 `in_chat` 时有意义
    pub active_conversation_id: Option<ConversationId>,
    /// 毫秒时间戳
    pub last_seen: i64,
    pub version: u64,
}

impl PresenceRecord {
    pub fn offline(last_seen: i64, version: u64) -> Self {
        Self {
            status: PresenceStatus::Offline,
            active_conversation_id: None,
            last_seen,
            version,
        }
    }

    /// 是否正在查看指定会话
    pub fn is_viewing(&self, conversation_id: ConversationId) -> bool {
        self.status == PresenceStatus::InChat
            && self.active_conversation_id == Some(conversation_id)
    }
}

impl Default for PresenceRecord {
    fn default() -> Self {
        Self::offline(0, 0)
    }
}
