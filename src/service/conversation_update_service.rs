//! 会话聚合更新
//!
//! 维护会话的 last_message / updated_at / 未读数，并向双方个人频道推送
//! `conversation_update`。推送携带的是接收者自己的**绝对**未读数，客户端覆盖而不是累加。

use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::infra::{Channel, EventEmitter};
use crate::model::{Conversation, ConversationId, LastMessagePreview, Message, UserId};
use crate::protocol::ServerEvent;
use crate::repository::ConversationRepository;

pub struct ConversationUpdateService {
    conversations: Arc<dyn ConversationRepository>,
    emitter: Arc<dyn EventEmitter>,
}

impl ConversationUpdateService {
    pub fn new(conversations: Arc<dyn ConversationRepository>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            conversations,
            emitter,
        }
    }

    /// 新消息写入会话聚合。`receiver_reading` 为真时接收方未读数不变
    pub async fn apply_sent_message(&self, message: &Message, receiver_reading: bool) -> Result<Conversation> {
        let conversation = self
            .conversations
            .apply_message(
                message.conversation_id,
                LastMessagePreview::from(message),
                message.sender_id,
                message.receiver_id,
                !receiver_reading,
            )
            .await?;

        debug!(
            "📝 会话 {} 已更新: receiver={} unread={}",
            conversation.id,
            message.receiver_id,
            conversation.unread_for(message.receiver_id)
        );

        self.notify(&conversation, message.receiver_id);
        self.notify(&conversation, message.sender_id);
        Ok(conversation)
    }

    /// 用户显式标记会话已读：未读清零并推送 0
    pub async fn mark_read(&self, conversation_id: ConversationId, user_id: UserId) -> Result<Conversation> {
        let conversation = self.conversations.reset_unread(conversation_id, user_id).await?;
        self.notify(&conversation, user_id);
        Ok(conversation)
    }

    /// 向 `user_id` 的个人频道推送该用户视角的会话状态
    pub fn notify(&self, conversation: &Conversation, user_id: UserId) {
        self.emitter.emit(
            &[Channel::User(user_id)],
            ServerEvent::ConversationUpdate {
                conversation_id: conversation.id,
                last_message: conversation.last_message.clone(),
                updated_at: conversation.updated_at,
                unread_count: conversation.unread_for(user_id),
            },
        );
    }
}
