//! 会话列表
//!
//! 会话聚合的读侧：按 updated_at 倒序分页，每条带上调用方自己的未读数和对方的在线状态。

use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, ServerError};
use crate::model::{Conversation, ConversationSummary, UserId};
use crate::repository::{ConversationPage, ConversationRepository};
use crate::service::PresenceService;

/// 一页会话和下一页游标
#[derive(Debug, Clone)]
pub struct ConversationListPage {
    pub conversations: Vec<ConversationSummary>,
    /// 本页已满时为最后一条的 updated_at
    pub next_cursor: Option<i64>,
}

pub struct ConversationListService {
    conversations: Arc<dyn ConversationRepository>,
    presence: Arc<PresenceService>,
}

impl ConversationListService {
    pub fn new(conversations: Arc<dyn ConversationRepository>, presence: Arc<PresenceService>) -> Self {
        Self {
            conversations,
            presence,
        }
    }

    pub async fn list(&self, user_id: UserId, page: ConversationPage) -> Result<ConversationListPage> {
        let conversations = self.conversations.list_page(user_id, page).await?;
        let next_cursor = if conversations.len() == page.limit {
            conversations.last().map(|c| c.updated_at)
        } else {
            None
        };

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in &conversations {
            summaries.push(self.summarize(conversation, user_id).await?);
        }
        debug!("📋 用户 {} 的会话列表: {} 条", user_id, summaries.len());

        Ok(ConversationListPage {
            conversations: summaries,
            next_cursor,
        })
    }

    /// 打开与 `peer_id` 的会话，不存在则创建
    pub async fn open(&self, user_id: UserId, peer_id: UserId) -> Result<ConversationSummary> {
        let conversation = self.conversations.find_or_create_between(user_id, peer_id).await?;
        self.summarize(&conversation, user_id).await
    }

    async fn summarize(&self, conversation: &Conversation, viewer: UserId) -> Result<ConversationSummary> {
        let partner_id = conversation.other_participant(viewer).ok_or_else(|| {
            ServerError::Forbidden(format!("用户 {} 不是会话 {} 的参与者", viewer, conversation.id))
        })?;
        let partner = self.presence.get(partner_id).await;
        ConversationSummary::for_viewer(conversation, viewer, &partner)
            .ok_or_else(|| ServerError::Internal(format!("会话 {} 摘要生成失败", conversation.id)))
    }
}
