//! 通话记录仓库 - PostgreSQL 实现

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{Result, ServerError};
use crate::model::{CallId, CallRecord, CallType, UserId};

/// 通话记录仓库 trait
#[async_trait]
pub trait CallRepository: Send + Sync {
    async fn create(&self, record: &CallRecord) -> Result<()>;

    async fn find_by_id(&self, call_id: CallId) -> Result<Option<CallRecord>>;

    /// 写入接通时间；已结束或已接通的通话不会被修改。返回是否写入
    async fn mark_connected(&self, call_id: CallId, connected_at: i64) -> Result<bool>;

    /// 写入结束时间并计算时长；已结束的通话不会被修改。返回更新后的记录。
    /// `connected_at` 是进程内记下的接通时间，接通写入尚未落库时以它补齐
    async fn mark_ended(
        &self,
        call_id: CallId,
        ended_at: i64,
        connected_at: Option<i64>,
    ) -> Result<Option<CallRecord>>;

    /// 用户参与的通话，按开始时间倒序
    async fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<CallRecord>>;
}

const CALL_COLUMNS: &str = "call_id, caller_id, callee_id, call_type, created_at, connected_at, ended_at, duration_secs";

#[derive(sqlx::FromRow)]
struct CallRow {
    call_id: i64,
    caller_id: i64,
    callee_id: i64,
    call_type: String,
    created_at: i64,
    connected_at: Option<i64>,
    ended_at: Option<i64>,
    duration_secs: i64,
}

impl TryFrom<CallRow> for CallRecord {
    type Error = ServerError;

    fn try_from(row: CallRow) -> Result<Self> {
        let call_type = CallType::parse(&row.call_type)
            .ok_or_else(|| ServerError::Database(format!("invalid call_type {}", row.call_type)))?;
        Ok(CallRecord {
            call_id: CallId(row.call_id as u64),
            caller_id: UserId(row.caller_id as u64),
            callee_id: UserId(row.callee_id as u64),
            call_type,
            created_at: row.created_at,
            connected_at: row.connected_at,
            ended_at: row.ended_at,
            duration: row.duration_secs.max(0) as u64,
        })
    }
}

/// 通话记录仓库 (PostgreSQL 实现)
#[derive(Clone)]
pub struct PgCallRepository {
    pool: PgPool,
}

impl PgCallRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CallRepository for PgCallRepository {
    async fn create(&self, record: &CallRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO privchat_call_records
                (call_id, caller_id, callee_id, call_type, created_at, connected_at, ended_at, duration_secs)
            VALUES ($1, $2, $3, $4, $5, NULL, NULL, 0)
            "#,
        )
        .bind(record.call_id.0 as i64)
        .bind(record.caller_id.0 as i64)
        .bind(record.callee_id.0 as i64)
        .bind(record.call_type.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("创建通话记录失败: {}", e)))?;
        Ok(())
    }

    async fn find_by_id(&self, call_id: CallId) -> Result<Option<CallRecord>> {
        let sql = format!("SELECT {CALL_COLUMNS} FROM privchat_call_records WHERE call_id = $1");
        let row = sqlx::query_as::<_, CallRow>(&sql)
            .bind(call_id.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("查询通话记录失败: {}", e)))?;
        row.map(CallRecord::try_from).transpose()
    }

    async fn mark_connected(&self, call_id: CallId, connected_at: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE privchat_call_records SET connected_at = $2
            WHERE call_id = $1 AND connected_at IS NULL AND ended_at IS NULL
            "#,
        )
        .bind(call_id.0 as i64)
        .bind(connected_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ServerError::Database(format!("更新接通时间失败: {}", e)))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_ended(
        &self,
        call_id: CallId,
        ended_at: i64,
        connected_at: Option<i64>,
    ) -> Result<Option<CallRecord>> {
        let sql = format!(
            r#"
            UPDATE privchat_call_records
            SET ended_at = $2,
                connected_at = COALESCE(connected_at, $3),
                duration_secs = CASE
                    WHEN COALESCE(connected_at, $3) IS NOT NULL AND $2 > COALESCE(connected_at, $3)
                        THEN ($2 - COALESCE(connected_at, $3)) / 1000
                    ELSE 0
                END
            WHERE call_id = $1 AND ended_at IS NULL
            RETURNING {CALL_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, CallRow>(&sql)
            .bind(call_id.0 as i64)
            .bind(ended_at)
            .bind(connected_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("更新结束时间失败: {}", e)))?;
        row.map(CallRecord::try_from).transpose()
    }

    async fn list_for_user(&self, user_id: UserId, limit: usize) -> Result<Vec<CallRecord>> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM privchat_call_records \
             WHERE caller_id = $1 OR callee_id = $1 ORDER BY created_at DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, CallRow>(&sql)
            .bind(user_id.0 as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ServerError::Database(format!("查询通话历史失败: {}", e)))?;
        rows.into_iter().map(CallRecord::try_from).collect()
    }
}
