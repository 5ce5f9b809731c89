//! 会话仓库 - PostgreSQL 实现

use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::error::{Result, ServerError};
use crate::infra::snowflake;
use crate::model::{now_millis, Conversation, ConversationId, LastMessagePreview, UserId};
use crate::repository::ConversationPage;

/// 会话仓库 trait
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_by_id(&self, conversation_id: ConversationId) -> Result<Option<Conversation>>;

    /// 两个用户之间的会话，不存在则创建
    async fn find_or_create_between(&self, a: UserId, b: UserId) -> Result<Conversation>;

    /// 用户参与的全部会话
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>>;

    /// 按 updated_at 倒序分页
    async fn list_page(&self, user_id: UserId, page: ConversationPage) -> Result<Vec<Conversation>>;

    /// 原子地写入最后一条消息：更新时间、发送方未读清零，
    /// `increment_receiver` 为真时接收方未读 +1
    async fn apply_message(
        &self,
        conversation_id: ConversationId,
        preview: LastMessagePreview,
        sender_id: UserId,
        receiver_id: UserId,
        increment_receiver: bool,
    ) -> Result<Conversation>;

    /// 未读清零
    async fn reset_unread(&self, conversation_id: ConversationId, user_id: UserId) -> Result<Conversation>;
}

/// 存储时参与者按升序排列
pub(crate) fn ordered_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    conversation_id: i64,
    participant_a: i64,
    participant_b: i64,
    last_message: Option<serde_json::Value>,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct UnreadRow {
    conversation_id: i64,
    user_id: i64,
    unread_count: i32,
}

const CONVERSATION_COLUMNS: &str = "conversation_id, participant_a, participant_b, last_message, updated_at";

fn assemble(row: ConversationRow, unread: &[UnreadRow]) -> Result<Conversation> {
    let last_message = row
        .last_message
        .map(serde_json::from_value::<LastMessagePreview>)
        .transpose()?;

    let a = UserId(row.participant_a as u64);
    let b = UserId(row.participant_b as u64);
    let mut unread_count = HashMap::from([(a, 0), (b, 0)]);
    for u in unread.iter().filter(|u| u.conversation_id == row.conversation_id) {
        unread_count.insert(UserId(u.user_id as u64), u.unread_count.max(0) as u32);
    }

    Ok(Conversation {
        id: ConversationId(row.conversation_id as u64),
        participants: [a, b],
        last_message,
        updated_at: row.updated_at,
        unread_count,
    })
}

/// 会话仓库 (PostgreSQL 实现)
#[derive(Clone)]
pub struct PgConversationRepository {
    pool: PgPool,
}

impl PgConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_unread(&self, ids: &[i64]) -> Result<Vec<UnreadRow>> {
        sqlx::query_as::<_, UnreadRow>(
            "SELECT conversation_id, user_id, unread_count FROM privchat_conversation_unread WHERE conversation_id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("查询未读数失败: {}", e)))
    }

    async fn require(&self, conversation_id: ConversationId) -> Result<Conversation> {
        self.find_by_id(conversation_id)
            .await?
            .ok_or_else(|| ServerError::ConversationNotFound(conversation_id.to_string()))
    }
}

#[async_trait]
impl ConversationRepository for PgConversationRepository {
    async fn find_by_id(&self, conversation_id: ConversationId) -> Result<Option<Conversation>> {
        let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM privchat_conversations WHERE conversation_id = $1");
        let Some(row) = sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(conversation_id.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("查询会话失败: {}", e)))?
        else {
            return Ok(None);
        };
        let unread = self.load_unread(&[row.conversation_id]).await?;
        assemble(row, &unread).map(Some)
    }

    async fn find_or_create_between(&self, a: UserId, b: UserId) -> Result<Conversation> {
        if a == b {
            return Err(ServerError::Validation("不能和自己创建会话".to_string()));
        }
        let (low, high) = ordered_pair(a, b);
        let id = snowflake::next_conversation_id()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO privchat_conversations (conversation_id, participant_a, participant_b, last_message, updated_at)
            VALUES ($1, $2, $3, NULL, $4)
            ON CONFLICT (participant_a, participant_b) DO NOTHING
            "#,
        )
        .bind(id.0 as i64)
        .bind(low.0 as i64)
        .bind(high.0 as i64)
        .bind(now_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| ServerError::Database(format!("创建会话失败: {}", e)))?;

        let conversation_id: i64 = sqlx::query_scalar(
            "SELECT conversation_id FROM privchat_conversations WHERE participant_a = $1 AND participant_b = $2",
        )
        .bind(low.0 as i64)
        .bind(high.0 as i64)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO privchat_conversation_unread (conversation_id, user_id, unread_count)
            VALUES ($1, $2, 0), ($1, $3, 0)
            ON CONFLICT (conversation_id, user_id) DO NOTHING
            "#,
        )
        .bind(conversation_id)
        .bind(low.0 as i64)
        .bind(high.0 as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.require(ConversationId(conversation_id as u64)).await
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Conversation>> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM privchat_conversations \
             WHERE participant_a = $1 OR participant_b = $1 ORDER BY updated_at DESC"
        );
        let rows = sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(user_id.0 as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("查询用户会话失败: {}", e)))?;

        let ids: Vec<i64> = rows.iter().map(|r| r.conversation_id).collect();
        let unread = self.load_unread(&ids).await?;
        rows.into_iter().map(|row| assemble(row, &unread)).collect()
    }

    async fn list_page(&self, user_id: UserId, page: ConversationPage) -> Result<Vec<Conversation>> {
        let sql = format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM privchat_conversations
            WHERE (participant_a = $1 OR participant_b = $1)
              AND ($2::BIGINT IS NULL OR updated_at < $2)
            ORDER BY updated_at DESC, conversation_id DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query_as::<_, ConversationRow>(&sql)
            .bind(user_id.0 as i64)
            .bind(page.before)
            .bind(page.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("分页查询会话失败: {}", e)))?;

        let ids: Vec<i64> = rows.iter().map(|r| r.conversation_id).collect();
        let unread = self.load_unread(&ids).await?;
        rows.into_iter().map(|row| assemble(row, &unread)).collect()
    }

    async fn apply_message(
        &self,
        conversation_id: ConversationId,
        preview: LastMessagePreview,
        sender_id: UserId,
        receiver_id: UserId,
        increment_receiver: bool,
    ) -> Result<Conversation> {
        let updated_at = preview.timestamp;
        let preview = serde_json::to_value(&preview)?;
        let mut tx = self.pool.begin().await?;

        // 乱序提交时不让较旧的消息覆盖预览
        let updated = sqlx::query(
            r#"
            UPDATE privchat_conversations
            SET last_message = $2, updated_at = $3
            WHERE conversation_id = $1
              AND (last_message IS NULL OR (last_message->>'timestamp')::BIGINT <= $3)
            "#,
        )
        .bind(conversation_id.0 as i64)
        .bind(preview)
        .bind(updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| ServerError::Database(format!("更新会话失败: {}", e)))?;
        if updated.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar(
                "SELECT conversation_id FROM privchat_conversations WHERE conversation_id = $1",
            )
            .bind(conversation_id.0 as i64)
            .fetch_optional(&mut *tx)
            .await?;
            if exists.is_none() {
                return Err(ServerError::ConversationNotFound(conversation_id.to_string()));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO privchat_conversation_unread (conversation_id, user_id, unread_count)
            VALUES ($1, $2, 0)
            ON CONFLICT (conversation_id, user_id) DO UPDATE SET unread_count = 0
            "#,
        )
        .bind(conversation_id.0 as i64)
        .bind(sender_id.0 as i64)
        .execute(&mut *tx)
        .await?;

        let increment: i32 = if increment_receiver { 1 } else { 0 };
        sqlx::query(
            r#"
            INSERT INTO privchat_conversation_unread (conversation_id, user_id, unread_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (conversation_id, user_id)
            DO UPDATE SET unread_count = privchat_conversation_unread.unread_count + EXCLUDED.unread_count
            "#,
        )
        .bind(conversation_id.0 as i64)
        .bind(receiver_id.0 as i64)
        .bind(increment)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.require(conversation_id).await
    }

    async fn reset_unread(&self, conversation_id: ConversationId, user_id: UserId) -> Result<Conversation> {
        sqlx::query(
            r#"
            INSERT INTO privchat_conversation_unread (conversation_id, user_id, unread_count)
            VALUES ($1, $2, 0)
            ON CONFLICT (conversation_id, user_id) DO UPDATE SET unread_count = 0
            "#,
        )
        .bind(conversation_id.0 as i64)
        .bind(user_id.0 as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("清零未读数失败: {}", e)))?;
        self.require(conversation_id).await
    }
}
