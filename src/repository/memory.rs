//! 内存仓库实现（开发 / 测试）
//!
//! 所有条件更新都在单个 DashMap 条目的写锁内完成，语义与 PostgreSQL 实现一致。

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{Result, ServerError};
use crate::infra::snowflake;
use crate::model::{
    now_millis, CallId, CallRecord, Conversation, ConversationId, LastMessagePreview, Message,
    MessageId, MessageStatus, NewMessage, UserId,
};
use crate::repository::call_repo::CallRepository;
use crate::repository::ConversationPage;
use crate::repository::conversation_repo::{ordered_pair, ConversationRepository};
use crate::repository::message_repo::MessageRepository;
use crate::repository::MessagePage;

// ==================== 消息 ====================

#[derive(Default)]
pub struct MemoryMessageRepository {
    messages: DashMap<MessageId, Message>,
    client_index: DashMap<(UserId, String), MessageId>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn bulk_advance<F>(&self, target: MessageStatus, predicate: F) -> Vec<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let mut advanced = Vec::new();
        for mut entry in self.messages.iter_mut() {
            if predicate(entry.value()) && entry.status.can_advance_to(target) {
                entry.status = target;
                advanced.push(entry.value().clone());
            }
        }
        advanced.sort_by_key(|m| (m.timestamp, m.id));
        advanced
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn create_or_get(&self, message: NewMessage) -> Result<(Message, bool)> {
        let Some(client_id) = message.client_id.clone() else {
            let message = message.into_message();
            self.messages.insert(message.id, message.clone());
            return Ok((message, true));
        };

        match self.client_index.entry((message.sender_id, client_id)) {
            Entry::Occupied(existing) => {
                let existing = self
                    .messages
                    .get(existing.get())
                    .map(|m| m.clone())
                    .ok_or_else(|| ServerError::Internal("client_id 索引指向不存在的消息".to_string()))?;
                Ok((existing, false))
            }
            Entry::Vacant(slot) => {
                let message = message.into_message();
                self.messages.insert(message.id, message.clone());
                slot.insert(message.id);
                Ok((message, true))
            }
        }
    }

    async fn find_by_id(&self, message_id: MessageId) -> Result<Option<Message>> {
        Ok(self.messages.get(&message_id).map(|m| m.clone()))
    }

    async fn advance_status(&self, message_id: MessageId, status: MessageStatus) -> Result<Option<Message>> {
        let Some(mut entry) = self.messages.get_mut(&message_id) else {
            return Ok(None);
        };
        if !entry.status.can_advance_to(status) {
            return Ok(None);
        }
        entry.status = status;
        Ok(Some(entry.clone()))
    }

    async fn mark_delivered_for_receiver(&self, receiver_id: UserId) -> Result<Vec<Message>> {
        Ok(self.bulk_advance(MessageStatus::Delivered, |m| {
            m.receiver_id == receiver_id && m.status == MessageStatus::Sent
        }))
    }

    async fn mark_read_in_conversation(&self, conversation_id: ConversationId, reader_id: UserId) -> Result<Vec<Message>> {
        Ok(self.bulk_advance(MessageStatus::Read, |m| {
            m.conversation_id == conversation_id && m.receiver_id == reader_id
        }))
    }

    async fn list_by_conversation(&self, conversation_id: ConversationId, page: MessagePage) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| page.before.map_or(true, |before| m.timestamp < before))
            .map(|m| m.clone())
            .collect();
        messages.sort_by_key(|m| (m.timestamp, m.id));
        let skip = messages.len().saturating_sub(page.limit);
        Ok(messages.split_off(skip))
    }
}

// ==================== 会话 ====================

#[derive(Default)]
pub struct MemoryConversationRepository {
    conversations: DashMap<ConversationId, Conversation>,
    pairs: DashMap<(UserId, UserId), ConversationId>,
}

impl MemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, conversation_id: ConversationId, apply: F) -> Result<Conversation>
    where
        F: FnOnce(&mut Conversation),
    {
        let mut entry = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| ServerError::ConversationNotFound(conversation_id.to_string()))?;
        apply(entry.value_mut());
        Ok(entry.clone())
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationRepository {
    async fn find_by_id(&self, conversation_id: ConversationId) -> Result<Option<Conversation>> {
        Ok(self.conversations.get(&conversation_id).map(|c| c.clone()))
    }

    async fn find_or_create_between(&self, a: UserId, b: UserId) -> Result<Conversation> {
        if a == b {
            return Err(ServerError::Validation("不能和自己创建会话".to_string()));
        }
        let (low, high) = ordered_pair(a, b);
        let conversation_id = match self.pairs.entry((low, high)) {
            Entry::Occupied(existing) => *existing.get(),
            Entry::Vacant(slot) => {
                let id = snowflake::next_conversation_id()?;
                self.conversations
                    .insert(id, Conversation::new(id, low, high, now_millis()));
                slot.insert(id);
                id
            }
        };
        self.conversations
            .get(&conversation_id)
            .map(|c| c.clone())
            .ok_or_else(|| ServerError::ConversationNotFound(conversation_id.to_string()))
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.has_participant(user_id))
            .map(|c| c.clone())
            .collect();
        conversations.sort_by(|x, y| y.updated_at.cmp(&x.updated_at));
        Ok(conversations)
    }

    async fn list_page(&self, user_id: UserId, page: ConversationPage) -> Result<Vec<Conversation>> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.has_participant(user_id))
            .filter(|c| page.before.map_or(true, |before| c.updated_at < before))
            .map(|c| c.clone())
            .collect();
        conversations.sort_by(|x, y| y.updated_at.cmp(&x.updated_at).then(y.id.cmp(&x.id)));
        conversations.truncate(page.limit);
        Ok(conversations)
    }

    async fn apply_message(
        &self,
        conversation_id: ConversationId,
        preview: LastMessagePreview,
        sender_id: UserId,
        receiver_id: UserId,
        increment_receiver: bool,
    ) -> Result<Conversation> {
        self.update(conversation_id, |conversation| {
            // 乱序提交时不让较旧的消息覆盖预览
            let newer = conversation
                .last_message
                .as_ref()
                .map_or(true, |last| preview.timestamp >= last.timestamp);
            if newer {
                conversation.updated_at = preview.timestamp;
                conversation.last_message = Some(preview);
            }
            conversation.unread_count.insert(sender_id, 0);
            let receiver_unread = conversation.unread_count.entry(receiver_id).or_insert(0);
            if increment_receiver {
                *receiver_unread += 1;
            }
        })
    }

    async fn reset_unread(&self, conversation_id: ConversationId, user_id: UserId) -> Result<Conversation> {
        self.update(conversation_id, |conversation| {
            conversation.unread_count.insert(user_id, 0);
        })
    }
}

// ==================== 通话 ====================

#[derive(Default)]
pub struct MemoryCallRepository {
    calls: DashMap<CallId, CallRecord>,
}

impl MemoryCallRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallRepository for MemoryCallRepository {
    async fn create(&self, record: &CallRecord) -> Result<()> {
        match self.calls.entry(record.call_id) {
            Entry::Occupied(_) => Err(ServerError::Duplicate(format!("call {}", record.call_id))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn find_by_id(&self, call_id: CallId) -> Result<Option<CallRecord>> {
        Ok(self.calls.get(&call_id).map(|c| c.clone()))
    }

    async fn mark_connected(&self, call_id: CallId, connected_at: i64) -> Result<bool> {
        match self.calls.get_mut(&call_id) {
            Some(mut record) if record.connected_at.is_none() && record.ended_at.is_none() => {
                record.connected_at = Some(connected_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_ended(
        &self,
        call_id: CallId,
        ended_at: i64,
        connected_at: Option<i64>,
    ) -> Result<Option<CallRecord>> {
        match self.calls.get_mut(&call_id) {
            Some(mut record) if record.ended_at.is_none() => {
                record.connected_at = record.connected_at.or(connected_at);
                record.ended_at = Some(ended_at);
                record.duration = CallRecord::compute_duration(record.connected_at, record.ended_at);
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<CallRecord>> {
        let mut calls: Vec<CallRecord> = self
            .calls
            .iter()
            .filter(|c| c.caller_id == user_id || c.callee_id == user_id)
            .map(|c| c.clone())
            .collect();
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.call_id.cmp(&a.call_id)));
        calls.truncate(limit);
        Ok(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CallType;

    fn new_message(id: u64, client_id: Option<&str>) -> NewMessage {
        NewMessage {
            id: MessageId(id),
            conversation_id: ConversationId(1),
            sender_id: UserId(1),
            receiver_id: UserId(2),
            content: Some(format!("hello {}", id)),
            media: vec![],
            status: MessageStatus::Sent,
            timestamp: id as i64,
            client_id: client_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_client_id_is_idempotent() {
        let repo = MemoryMessageRepository::new();
        let (first, created) = repo.create_or_get(new_message(1, Some("c-1"))).await.unwrap();
        assert!(created);
        let (replay, created) = repo.create_or_get(new_message(2, Some("c-1"))).await.unwrap();
        assert!(!created);
        assert_eq!(replay.id, first.id);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let repo = MemoryMessageRepository::new();
        repo.create_or_get(new_message(1, None)).await.unwrap();

        assert!(repo.advance_status(MessageId(1), MessageStatus::Read).await.unwrap().is_some());
        assert!(repo.advance_status(MessageId(1), MessageStatus::Delivered).await.unwrap().is_none());
        assert!(repo.advance_status(MessageId(1), MessageStatus::Failed).await.unwrap().is_none());
        let stored = repo.find_by_id(MessageId(1)).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_bulk_reconciliation_only_touches_matching() {
        let repo = MemoryMessageRepository::new();
        repo.create_or_get(new_message(1, None)).await.unwrap();
        repo.create_or_get(new_message(2, None)).await.unwrap();
        repo.advance_status(MessageId(2), MessageStatus::Read).await.unwrap();

        let delivered = repo.mark_delivered_for_receiver(UserId(2)).await.unwrap();
        assert_eq!(delivered.iter().map(|m| m.id).collect::<Vec<_>>(), vec![MessageId(1)]);
        assert!(repo.mark_delivered_for_receiver(UserId(2)).await.unwrap().is_empty());
        assert!(repo.mark_delivered_for_receiver(UserId(1)).await.unwrap().is_empty());

        let read = repo.mark_read_in_conversation(ConversationId(1), UserId(2)).await.unwrap();
        assert_eq!(read.len(), 1);
        assert!(repo.mark_read_in_conversation(ConversationId(1), UserId(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_pages_backwards() {
        let repo = MemoryMessageRepository::new();
        for id in 1..=5 {
            repo.create_or_get(new_message(id, None)).await.unwrap();
        }
        let latest = repo
            .list_by_conversation(ConversationId(1), MessagePage::new(2, None))
            .await
            .unwrap();
        assert_eq!(latest.iter().map(|m| m.id.0).collect::<Vec<_>>(), vec![4, 5]);
        let older = repo
            .list_by_conversation(ConversationId(1), MessagePage::new(2, Some(4)))
            .await
            .unwrap();
        assert_eq!(older.iter().map(|m| m.id.0).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_find_or_create_between_is_symmetric() {
        let repo = MemoryConversationRepository::new();
        let first = repo.find_or_create_between(UserId(2), UserId(1)).await.unwrap();
        let second = repo.find_or_create_between(UserId(1), UserId(2)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.participants, [UserId(1), UserId(2)]);
        assert!(repo.find_or_create_between(UserId(1), UserId(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_apply_message_counts() {
        let repo = MemoryConversationRepository::new();
        let conv = repo.find_or_create_between(UserId(1), UserId(2)).await.unwrap();
        let preview = |ts| LastMessagePreview {
            message_id: MessageId(ts as u64),
            content: "hi".into(),
            sender_id: UserId(1),
            timestamp: ts,
        };

        repo.apply_message(conv.id, preview(10), UserId(1), UserId(2), true).await.unwrap();
        let after = repo.apply_message(conv.id, preview(20), UserId(1), UserId(2), true).await.unwrap();
        assert_eq!(after.unread_for(UserId(2)), 2);
        assert_eq!(after.unread_for(UserId(1)), 0);
        assert_eq!(after.updated_at, 20);

        let reading = repo.apply_message(conv.id, preview(30), UserId(1), UserId(2), false).await.unwrap();
        assert_eq!(reading.unread_for(UserId(2)), 2);

        let reset = repo.reset_unread(conv.id, UserId(2)).await.unwrap();
        assert_eq!(reset.unread_for(UserId(2)), 0);
    }

    #[tokio::test]
    async fn test_older_message_does_not_replace_preview() {
        let repo = MemoryConversationRepository::new();
        let conv = repo.find_or_create_between(UserId(1), UserId(2)).await.unwrap();
        let preview = |ts: i64| LastMessagePreview {
            message_id: MessageId(ts as u64),
            content: format!("m{}", ts),
            sender_id: UserId(1),
            timestamp: ts,
        };

        repo.apply_message(conv.id, preview(50), UserId(1), UserId(2), true).await.unwrap();
        // 较早的消息后提交：未读照常累加，预览不回退
        let after = repo.apply_message(conv.id, preview(40), UserId(1), UserId(2), true).await.unwrap();
        assert_eq!(after.last_message.as_ref().map(|m| m.message_id), Some(MessageId(50)));
        assert_eq!(after.updated_at, 50);
        assert_eq!(after.unread_for(UserId(2)), 2);
    }

    #[tokio::test]
    async fn test_call_end_is_conditional() {
        let repo = MemoryCallRepository::new();
        let record = CallRecord::new(CallId(1), UserId(1), UserId(2), CallType::Audio, 1_000);
        repo.create(&record).await.unwrap();
        assert!(repo.create(&record).await.is_err());

        let ended = repo.mark_ended(CallId(1), 9_000, None).await.unwrap().unwrap();
        assert_eq!(ended.duration, 0);
        assert!(repo.mark_ended(CallId(1), 12_000, None).await.unwrap().is_none());
        // 结束后的 answer 不会写入接通时间
        assert!(!repo.mark_connected(CallId(1), 10_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_call_end_fills_pending_connect() {
        let repo = MemoryCallRepository::new();
        let record = CallRecord::new(CallId(2), UserId(1), UserId(2), CallType::Video, 1_000);
        repo.create(&record).await.unwrap();

        // 接通写入还没落库时先到了结束写入
        let ended = repo.mark_ended(CallId(2), 65_000, Some(5_000)).await.unwrap().unwrap();
        assert_eq!(ended.connected_at, Some(5_000));
        assert_eq!(ended.duration, 60);
        assert!(!repo.mark_connected(CallId(2), 5_000).await.unwrap());

        // 已落库的接通时间不会被覆盖
        let record = CallRecord::new(CallId(3), UserId(1), UserId(2), CallType::Video, 1_000);
        repo.create(&record).await.unwrap();
        repo.mark_connected(CallId(3), 2_000).await.unwrap();
        let ended = repo.mark_ended(CallId(3), 12_000, Some(4_000)).await.unwrap().unwrap();
        assert_eq!(ended.connected_at, Some(2_000));
        assert_eq!(ended.duration, 10);
    }
}
