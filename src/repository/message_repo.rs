//! 消息仓库 - PostgreSQL 实现

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{Result, ServerError};
use crate::model::{ConversationId, MediaAttachment, Message, MessageId, MessageStatus, NewMessage, UserId};
use crate::repository::MessagePage;

/// 消息仓库 trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 按 (sender_id, client_id) 幂等创建；返回 (消息, 是否新建)
    async fn create_or_get(&self, message: NewMessage) -> Result<(Message, bool)>;

    async fn find_by_id(&self, message_id: MessageId) -> Result<Option<Message>>;

    /// 条件推进状态；未推进返回 None
    async fn advance_status(&self, message_id: MessageId, status: MessageStatus) -> Result<Option<Message>>;

    /// 接收方所有 `sent` 消息推进到 `delivered`，返回被推进的消息
    async fn mark_delivered_for_receiver(&self, receiver_id: UserId) -> Result<Vec<Message>>;

    /// 会话内发给 `reader` 的未读消息推进到 `read`，返回被推进的消息
    async fn mark_read_in_conversation(&self, conversation_id: ConversationId, reader_id: UserId) -> Result<Vec<Message>>;

    /// 会话消息，按时间升序
    async fn list_by_conversation(&self, conversation_id: ConversationId, page: MessagePage) -> Result<Vec<Message>>;
}

const MESSAGE_COLUMNS: &str = "message_id, conversation_id, sender_id, receiver_id, content, media, status_rank, client_id, created_at";

#[derive(sqlx::FromRow)]
struct MessageRow {
    message_id: i64,
    conversation_id: i64,
    sender_id: i64,
    receiver_id: i64,
    content: Option<String>,
    media: serde_json::Value,
    status_rank: i16,
    client_id: Option<String>,
    created_at: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = ServerError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let status = MessageStatus::from_db_rank(row.status_rank)
            .ok_or_else(|| ServerError::Database(format!("invalid status_rank {}", row.status_rank)))?;
        let media: Vec<MediaAttachment> = serde_json::from_value(row.media)?;
        Ok(Message {
            id: MessageId(row.message_id as u64),
            conversation_id: ConversationId(row.conversation_id as u64),
            sender_id: UserId(row.sender_id as u64),
            receiver_id: UserId(row.receiver_id as u64),
            content: row.content,
            media,
            status,
            timestamp: row.created_at,
            client_id: row.client_id,
        })
    }
}

fn rows_to_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>> {
    rows.into_iter().map(Message::try_from).collect()
}

/// 消息仓库 (PostgreSQL 实现)
#[derive(Clone)]
pub struct PgMessageRepository {
    pool: PgPool,
}

impl PgMessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by_client_id(&self, sender_id: UserId, client_id: &str) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM privchat_realtime_messages WHERE sender_id = $1 AND client_id = $2"
        );
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(sender_id.0 as i64)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("按 client_id 查询消息失败: {}", e)))?;
        row.map(Message::try_from).transpose()
    }
}

#[async_trait]
impl MessageRepository for PgMessageRepository {
    async fn create_or_get(&self, message: NewMessage) -> Result<(Message, bool)> {
        let media = serde_json::to_value(&message.media)?;
        let sql = format!(
            r#"
            INSERT INTO privchat_realtime_messages
                (message_id, conversation_id, sender_id, receiver_id, content, media, status_rank, client_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (sender_id, client_id) WHERE client_id IS NOT NULL DO NOTHING
            RETURNING {MESSAGE_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(message.id.0 as i64)
            .bind(message.conversation_id.0 as i64)
            .bind(message.sender_id.0 as i64)
            .bind(message.receiver_id.0 as i64)
            .bind(&message.content)
            .bind(media)
            .bind(message.status.db_rank())
            .bind(&message.client_id)
            .bind(message.timestamp)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("创建消息失败: {}", e)))?;

        if let Some(row) = inserted {
            return Ok((Message::try_from(row)?, true));
        }

        // 冲突：同一 client_id 已存在
        let client_id = message.client_id.as_deref().unwrap_or_default();
        let existing = self
            .find_by_client_id(message.sender_id, client_id)
            .await?
            .ok_or_else(|| ServerError::Database("client_id 冲突但未找到已有消息".to_string()))?;
        Ok((existing, false))
    }

    async fn find_by_id(&self, message_id: MessageId) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM privchat_realtime_messages WHERE message_id = $1");
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(message_id.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("查询消息失败: {}", e)))?;
        row.map(Message::try_from).transpose()
    }

    async fn advance_status(&self, message_id: MessageId, status: MessageStatus) -> Result<Option<Message>> {
        // failed 只能从 sending 进入；其余只能向更高 rank 推进
        let condition = match status {
            MessageStatus::Failed => "status_rank = 0",
            _ => "status_rank >= 0 AND status_rank < $2",
        };
        let sql = format!(
            "UPDATE privchat_realtime_messages SET status_rank = $2 WHERE message_id = $1 AND {condition} RETURNING {MESSAGE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(message_id.0 as i64)
            .bind(status.db_rank())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("更新消息状态失败: {}", e)))?;
        row.map(Message::try_from).transpose()
    }

    async fn mark_delivered_for_receiver(&self, receiver_id: UserId) -> Result<Vec<Message>> {
        let sql = format!(
            "UPDATE privchat_realtime_messages SET status_rank = $2 \
             WHERE receiver_id = $1 AND status_rank = $3 RETURNING {MESSAGE_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(receiver_id.0 as i64)
            .bind(MessageStatus::Delivered.db_rank())
            .bind(MessageStatus::Sent.db_rank())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("批量标记送达失败: {}", e)))?;
        rows_to_messages(rows)
    }

    async fn mark_read_in_conversation(&self, conversation_id: ConversationId, reader_id: UserId) -> Result<Vec<Message>> {
        let sql = format!(
            "UPDATE privchat_realtime_messages SET status_rank = $3 \
             WHERE conversation_id = $1 AND receiver_id = $2 AND status_rank >= 0 AND status_rank < $3 \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(conversation_id.0 as i64)
            .bind(reader_id.0 as i64)
            .bind(MessageStatus::Read.db_rank())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("批量标记已读失败: {}", e)))?;
        rows_to_messages(rows)
    }

    async fn list_by_conversation(&self, conversation_id: ConversationId, page: MessagePage) -> Result<Vec<Message>> {
        // 先取最新的 limit 条，再按时间升序返回
        let sql = format!(
            r#"
            SELECT * FROM (
                SELECT {MESSAGE_COLUMNS} FROM privchat_realtime_messages
                WHERE conversation_id = $1 AND ($2::BIGINT IS NULL OR created_at < $2)
                ORDER BY created_at DESC, message_id DESC
                LIMIT $3
            ) page
            ORDER BY created_at ASC, message_id ASC
            "#
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(conversation_id.0 as i64)
            .bind(page.before)
            .bind(page.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("查询会话消息失败: {}", e)))?;
        rows_to_messages(rows)
    }
}
