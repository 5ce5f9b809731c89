//! 消息投递状态机
//!
//! - 初始状态由接收方在线状态决定（正在看这个会话 > 在线 > 离线）
//! - 状态只能沿 `sending < sent < delivered < read` 前进，判断在存储层的条件更新里完成
//! - 用户首个连接上线时把 `sent` 批量推进到 `delivered`，进入会话房间时把未读批量推进到 `read`，
//!   每个会话只推送一条 `message_status_update`
//! - 带 clientId 的重发返回已持久化的那条消息，不会重复写入

use moka::future::Cache;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::error::{Result, ServerError};
use crate::infra::{metrics, snowflake, Channel, EventEmitter};
use crate::model::{
    now_millis, ConversationId, MediaAttachment, Message, MessageId, MessageStatus, NewMessage,
    UserId,
};
use crate::protocol::ServerEvent;
use crate::repository::{ConversationRepository, MessagePage, MessageRepository};
use crate::service::{ConversationUpdateService, PresenceService};

/// 发送请求
#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: Option<String>,
    pub media: Vec<MediaAttachment>,
    pub client_id: Option<String>,
}

/// 发送结果
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// clientId 命中已有消息
    pub replayed: bool,
}

pub struct DeliveryService {
    messages: Arc<dyn MessageRepository>,
    conversations: Arc<dyn ConversationRepository>,
    presence: Arc<PresenceService>,
    aggregates: Arc<ConversationUpdateService>,
    emitter: Arc<dyn EventEmitter>,
    /// 会话参与者缓存（参与者不可变）
    participants: Cache<ConversationId, [UserId; 2]>,
    max_content_length: usize,
}

impl DeliveryService {
    pub fn new(
        config: &DeliveryConfig,
        messages: Arc<dyn MessageRepository>,
        conversations: Arc<dyn ConversationRepository>,
        presence: Arc<PresenceService>,
        aggregates: Arc<ConversationUpdateService>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        let participants = Cache::builder()
            .max_capacity(config.participants_cache_capacity)
            .time_to_live(Duration::from_secs(config.participants_cache_ttl_secs))
            .build();

        Self {
            messages,
            conversations,
            presence,
            aggregates,
            emitter,
            participants,
            max_content_length: config.max_content_length,
        }
    }

    /// 会话参与者，先查缓存
    pub async fn participants(&self, conversation_id: ConversationId) -> Result<[UserId; 2]> {
        if let Some(participants) = self.participants.get(&conversation_id).await {
            return Ok(participants);
        }
        let conversation = self
            .conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| ServerError::ConversationNotFound(conversation_id.to_string()))?;
        self.participants
            .insert(conversation_id, conversation.participants)
            .await;
        Ok(conversation.participants)
    }

    /// 校验 `user_id` 是会话参与者，返回对方
    pub async fn counterpart(&self, conversation_id: ConversationId, user_id: UserId) -> Result<UserId> {
        match self.participants(conversation_id).await? {
            [a, b] if a == user_id => Ok(b),
            [a, b] if b == user_id => Ok(a),
            _ => Err(ServerError::Forbidden(format!(
                "用户 {} 不是会话 {} 的参与者",
                user_id, conversation_id
            ))),
        }
    }

    /// 根据接收方在线状态决定新消息的初始状态
    pub async fn decide_initial_status(&self, conversation_id: ConversationId, receiver_id: UserId) -> MessageStatus {
        let presence = self.presence.get(receiver_id).await;
        if presence.is_viewing(conversation_id) {
            MessageStatus::Read
        } else if presence.status.is_connected() {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        }
    }

    /// 推进单条消息状态；rank 不更高时静默丢弃，返回 None
    pub async fn advance(&self, message_id: MessageId, status: MessageStatus) -> Result<Option<Message>> {
        let Some(message) = self.messages.advance_status(message_id, status).await? else {
            debug!("消息 {} 忽略状态 {}（未前进）", message_id, status.as_str());
            return Ok(None);
        };

        metrics::record_status_advanced(status.as_str(), 1);
        self.emitter.emit(
            &[
                Channel::Conversation(message.conversation_id),
                Channel::User(message.sender_id),
            ],
            ServerEvent::MessageStatusUpdate {
                conversation_id: message.conversation_id,
                message_ids: vec![message.id],
                status,
            },
        );
        Ok(Some(message))
    }

    /// 发送消息
    pub async fn send_message(&self, request: SendMessageRequest) -> Result<SendOutcome> {
        let content = self.validate(&request)?;
        let receiver_id = self
            .counterpart(request.conversation_id, request.sender_id)
            .await?;

        let status = self
            .decide_initial_status(request.conversation_id, receiver_id)
            .await;

        let new_message = NewMessage {
            id: snowflake::next_message_id()?,
            conversation_id: request.conversation_id,
            sender_id: request.sender_id,
            receiver_id,
            content,
            media: request.media,
            status,
            timestamp: now_millis(),
            client_id: request.client_id,
        };

        let (message, created) = self.messages.create_or_get(new_message).await?;

        if created {
            metrics::record_message_sent();
            info!(
                "✉️ 消息 {} 已发送: {} -> {} (conversation={}, status={})",
                message.id,
                message.sender_id,
                message.receiver_id,
                message.conversation_id,
                message.status.as_str()
            );
        } else {
            metrics::record_message_replayed();
            info!(
                "🔁 clientId 重放命中消息 {} (sender={}, clientId={:?})",
                message.id, message.sender_id, message.client_id
            );
        }

        self.emitter.emit(
            &[
                Channel::Conversation(message.conversation_id),
                Channel::User(message.sender_id),
            ],
            ServerEvent::ReceiveMessage(message.clone()),
        );

        // 重放不再累加未读
        if created {
            let receiver_reading = message.status == MessageStatus::Read;
            if let Err(e) = self.aggregates.apply_sent_message(&message, receiver_reading).await {
                warn!("⚠️ 会话 {} 聚合更新失败: {}", message.conversation_id, e);
            }
        }

        Ok(SendOutcome {
            message,
            replayed: !created,
        })
    }

    /// 首个连接上线：`sent` -> `delivered`，每个会话一条批量事件。返回推进的消息数
    pub async fn reconcile_on_connect(&self, user_id: UserId) -> Result<usize> {
        let advanced = self.messages.mark_delivered_for_receiver(user_id).await?;
        if advanced.is_empty() {
            return Ok(0);
        }

        let count = advanced.len();
        for ((conversation_id, sender_id), message_ids) in group_by_conversation(advanced) {
            metrics::record_reconcile_batch("delivered");
            self.emitter.emit(
                &[Channel::Conversation(conversation_id), Channel::User(sender_id)],
                ServerEvent::MessageStatusUpdate {
                    conversation_id,
                    message_ids,
                    status: MessageStatus::Delivered,
                },
            );
        }
        metrics::record_status_advanced(MessageStatus::Delivered.as_str(), count as u64);
        info!("📬 用户 {} 上线，{} 条消息标记为已送达", user_id, count);
        Ok(count)
    }

    /// 进入会话房间：未读全部推进到 `read`，通知发送方并清零未读数。返回推进的消息数
    pub async fn reconcile_on_join(&self, conversation_id: ConversationId, reader_id: UserId) -> Result<usize> {
        let advanced = self
            .messages
            .mark_read_in_conversation(conversation_id, reader_id)
            .await?;
        let count = advanced.len();

        for ((conversation_id, sender_id), message_ids) in group_by_conversation(advanced) {
            metrics::record_reconcile_batch("read");
            self.emitter.emit(
                &[Channel::Conversation(conversation_id), Channel::User(sender_id)],
                ServerEvent::MessageStatusUpdate {
                    conversation_id,
                    message_ids,
                    status: MessageStatus::Read,
                },
            );
        }
        if count > 0 {
            metrics::record_status_advanced(MessageStatus::Read.as_str(), count as u64);
            debug!("👀 用户 {} 已读会话 {} 的 {} 条消息", reader_id, conversation_id, count);
        }

        self.aggregates.mark_read(conversation_id, reader_id).await?;
        Ok(count)
    }

    /// 会话消息分页（参与者才能查看）
    pub async fn history(&self, conversation_id: ConversationId, user_id: UserId, page: MessagePage) -> Result<Vec<Message>> {
        self.counterpart(conversation_id, user_id).await?;
        self.messages.list_by_conversation(conversation_id, page).await
    }

    /// 内容去首尾空白；内容和附件至少要有一个
    fn validate(&self, request: &SendMessageRequest) -> Result<Option<String>> {
        let content = request
            .content
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        if content.is_none() && request.media.is_empty() {
            return Err(ServerError::Validation("消息内容和附件不能同时为空".to_string()));
        }
        if let Some(content) = &content {
            if content.chars().count() > self.max_content_length {
                return Err(ServerError::Validation(format!(
                    "消息长度超过上限 {}",
                    self.max_content_length
                )));
            }
        }
        if request.media.iter().any(|m| m.url.trim().is_empty()) {
            return Err(ServerError::Validation("附件缺少 url".to_string()));
        }
        if let Some(client_id) = &request.client_id {
            if client_id.is_empty() || client_id.len() > 128 {
                return Err(ServerError::Validation("无效的 clientId".to_string()));
            }
        }
        Ok(content)
    }
}

/// 按 (会话, 发送方) 聚合消息ID，保持时间顺序
fn group_by_conversation(messages: Vec<Message>) -> BTreeMap<(ConversationId, UserId), Vec<MessageId>> {
    let mut groups: BTreeMap<(ConversationId, UserId), Vec<MessageId>> = BTreeMap::new();
    for message in messages {
        groups
            .entry((message.conversation_id, message.sender_id))
            .or_default()
            .push(message.id);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceConfig;
    use crate::infra::{EventReceiver, MemoryPresenceStore, RealtimeHub};
    use crate::model::{ConnectionId, MediaKind};
    use crate::repository::{MemoryConversationRepository, MemoryMessageRepository};

    struct Fixture {
        hub: Arc<RealtimeHub>,
        presence: Arc<PresenceService>,
        messages: Arc<MemoryMessageRepository>,
        service: DeliveryService,
        conversation_id: ConversationId,
    }

    async fn fixture() -> Fixture {
        let hub = RealtimeHub::new();
        let conversations = Arc::new(MemoryConversationRepository::new());
        let conversation_id = conversations
            .find_or_create_between(UserId(1), UserId(2))
            .await
            .unwrap()
            .id;
        let messages = Arc::new(MemoryMessageRepository::new());
        let presence = Arc::new(PresenceService::new(
            Arc::new(MemoryPresenceStore::new(&PresenceConfig::default())),
            conversations.clone(),
            hub.clone(),
        ));
        let aggregates = Arc::new(ConversationUpdateService::new(conversations.clone(), hub.clone()));
        let service = DeliveryService::new(
            &DeliveryConfig::default(),
            messages.clone(),
            conversations,
            presence.clone(),
            aggregates,
            hub.clone(),
        );
        Fixture {
            hub,
            presence,
            messages,
            service,
            conversation_id,
        }
    }

    fn text(conversation_id: ConversationId, content: &str, client_id: Option<&str>) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id,
            sender_id: UserId(1),
            content: Some(content.to_string()),
            media: vec![],
            client_id: client_id.map(str::to_string),
        }
    }

    fn drain(rx: &mut EventReceiver) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_initial_status_follows_presence() {
        let f = fixture().await;
        let conv = f.conversation_id;
        assert_eq!(f.service.decide_initial_status(conv, UserId(2)).await, MessageStatus::Sent);

        let conn = ConnectionId::new();
        f.presence.connect(UserId(2), conn).await;
        assert_eq!(f.service.decide_initial_status(conv, UserId(2)).await, MessageStatus::Delivered);

        f.presence.enter_chat(UserId(2), ConversationId(999)).await;
        assert_eq!(f.service.decide_initial_status(conv, UserId(2)).await, MessageStatus::Delivered);

        f.presence.enter_chat(UserId(2), conv).await;
        assert_eq!(f.service.decide_initial_status(conv, UserId(2)).await, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_advance_converges_to_max_rank() {
        let f = fixture().await;
        let sent = f.service.send_message(text(f.conversation_id, "hi", None)).await.unwrap();
        let id = sent.message.id;

        assert!(f.service.advance(id, MessageStatus::Read).await.unwrap().is_some());
        assert!(f.service.advance(id, MessageStatus::Delivered).await.unwrap().is_none());
        assert!(f.service.advance(id, MessageStatus::Read).await.unwrap().is_none());
        assert!(f.service.advance(id, MessageStatus::Failed).await.unwrap().is_none());
        assert!(f.service.advance(MessageId(12345), MessageStatus::Read).await.unwrap().is_none());

        let stored = f.messages.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
    }

    #[tokio::test]
    async fn test_client_id_replay_is_single_message() {
        let f = fixture().await;
        let (conn, mut rx) = f.hub.connect();
        f.hub.bind_user(conn, UserId(1));

        let first = f.service.send_message(text(f.conversation_id, "hi", Some("tmp-1"))).await.unwrap();
        let replay = f.service.send_message(text(f.conversation_id, "hi", Some("tmp-1"))).await.unwrap();
        assert!(!first.replayed);
        assert!(replay.replayed);
        assert_eq!(first.message.id, replay.message.id);
        assert_eq!(f.messages.len(), 1);

        let echoes: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::ReceiveMessage(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(echoes.len(), 2);
        assert!(echoes.iter().all(|m| m.id == first.message.id));
        assert!(echoes.iter().all(|m| m.client_id.as_deref() == Some("tmp-1")));
    }

    #[tokio::test]
    async fn test_validation() {
        let f = fixture().await;
        let empty = text(f.conversation_id, "   ", None);
        assert!(matches!(
            f.service.send_message(empty).await,
            Err(ServerError::Validation(_))
        ));

        let media_only = SendMessageRequest {
            content: None,
            media: vec![MediaAttachment {
                kind: MediaKind::Image,
                url: "https://cdn/a.png".into(),
                file_name: None,
                file_size: None,
                poster: None,
            }],
            ..text(f.conversation_id, "", None)
        };
        let sent = f.service.send_message(media_only).await.unwrap();
        assert_eq!(sent.message.content, None);

        let trimmed = f.service.send_message(text(f.conversation_id, "  yo  ", None)).await.unwrap();
        assert_eq!(trimmed.message.content.as_deref(), Some("yo"));

        let stranger = SendMessageRequest {
            sender_id: UserId(3),
            ..text(f.conversation_id, "hi", None)
        };
        assert!(matches!(
            f.service.send_message(stranger).await,
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            f.service.send_message(text(ConversationId(404), "hi", None)).await,
            Err(ServerError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_on_connect_batches_per_conversation() {
        let f = fixture().await;
        for i in 0..3 {
            f.service
                .send_message(text(f.conversation_id, &format!("m{}", i), None))
                .await
                .unwrap();
        }

        let (sender_conn, mut sender_rx) = f.hub.connect();
        f.hub.bind_user(sender_conn, UserId(1));

        assert_eq!(f.service.reconcile_on_connect(UserId(2)).await.unwrap(), 3);
        let updates: Vec<_> = drain(&mut sender_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::MessageStatusUpdate { .. }))
            .collect();
        assert_eq!(updates.len(), 1);
        match &updates[0] {
            ServerEvent::MessageStatusUpdate { message_ids, status, .. } => {
                assert_eq!(message_ids.len(), 3);
                assert_eq!(*status, MessageStatus::Delivered);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(f.service.reconcile_on_connect(UserId(2)).await.unwrap(), 0);
    }
}
