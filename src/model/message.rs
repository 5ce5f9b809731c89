use serde::{Deserialize, Serialize};

use super::{ConversationId, MessageId, UserId};

/// 消息投递状态
///
/// 单调格：`sending < sent < delivered < read`，`failed` 只能从 `sending` 进入且为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// 格中的位置；`failed` 不在主链上
    pub fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }

    /// 是否允许从 `self` 推进到 `next`
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Failed, _) => false,
            (MessageStatus::Sending, MessageStatus::Failed) => true,
            (_, MessageStatus::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// 两个状态合并后的结果（乱序到达时取最大值）
    pub fn merge(self, other: MessageStatus) -> MessageStatus {
        if self.can_advance_to(other) {
            other
        } else {
            self
        }
    }

    /// 数据库存储值（failed = -1）
    pub fn db_rank(self) -> i16 {
        self.rank().map(i16::from).unwrap_or(-1)
    }

    pub fn from_db_rank(rank: i16) -> Option<Self> {
        match rank {
            0 => Some(MessageStatus::Sending),
            1 => Some(MessageStatus::Sent),
            2 => Some(MessageStatus::Delivered),
            3 => Some(MessageStatus::Read),
            -1 => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }
}

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Document,
    Audio,
    Voice,
}

/// 消息附件（上传由外部服务完成，这里只保存引用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster: Option<String>,
}

/// 已持久化的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    pub status: MessageStatus,
    /// 毫秒时间戳
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// 待持久化的消息
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: Option<String>,
    pub media: Vec<MediaAttachment>,
    pub status: MessageStatus,
    pub timestamp: i64,
    pub client_id: Option<String>,
}

impl NewMessage {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            content: self.content,
            media: self.media,
            status: self.status,
            timestamp: self.timestamp,
            client_id: self.client_id,
        }
    }
}

impl Message {
    /// 会话列表预览文本：有内容显示内容，否则显示附件类型
    pub fn preview_text(&self) -> String {
        if let Some(content) = self.content.as_deref().filter(|c| !c.is_empty()) {
            return content.to_string();
        }
        match self.media.first().map(|m| m.kind) {
            Some(MediaKind::Image) => "[image]".to_string(),
            Some(MediaKind::Video) => "[video]".to_string(),
            Some(MediaKind::Document) => "[document]".to_string(),
            Some(MediaKind::Audio) => "[audio]".to_string(),
            Some(MediaKind::Voice) => "[voice]".to_string(),
            None => String::new(),
        }
    }
}
