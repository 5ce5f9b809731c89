//! Redis 在线状态存储
//!
//! Key 布局：
//! - `presence:{user_id}`  Hash { status, activeChatId, lastSeen, version }
//! - `sockets:{user_id}`   Set<connection_id>
//!
//! 所有读改写都放在 Lua 脚本里，保证单用户操作原子化。

use async_trait::async_trait;
use redis::Script;
use std::sync::LazyLock;

use crate::config::PresenceConfig;
use crate::error::{Result, ServerError};
use crate::infra::presence_store::PresenceStore;
use crate::infra::redis::RedisClient;
use crate::model::{now_millis, ConnectionId, ConversationId, PresenceRecord, PresenceStatus, UserId};

// KEYS[1]=presence KEYS[2]=sockets ARGV[1]=conn ARGV[2]=now ARGV[3]=ttl
static SET_ONLINE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local before = redis.call('SCARD', KEYS[2])
        local added = redis.call('SADD', KEYS[2], ARGV[1])
        redis.call('EXPIRE', KEYS[2], ARGV[3])
        redis.call('HSET', KEYS[1], 'status', 'online', 'activeChatId', '', 'lastSeen', ARGV[2])
        redis.call('HINCRBY', KEYS[1], 'version', 1)
        redis.call('EXPIRE', KEYS[1], ARGV[3])
        if before == 0 and added == 1 then return 1 end
        return 0
        "#,
    )
});

// ARGV[1]=status ARGV[2]=activeChatId ARGV[3]=now ARGV[4]=ttl
static SET_STATUS_IF_CONNECTED: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('SCARD', KEYS[2]) == 0 then return 0 end
        redis.call('HSET', KEYS[1], 'status', ARGV[1], 'activeChatId', ARGV[2], 'lastSeen', ARGV[3])
        redis.call('HINCRBY', KEYS[1], 'version', 1)
        redis.call('EXPIRE', KEYS[1], ARGV[4])
        redis.call('EXPIRE', KEYS[2], ARGV[4])
        return 1
        "#,
    )
});

// ARGV[1]=conn ARGV[2]=now ARGV[3]=ttl
static HEARTBEAT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 0 then return 0 end
        if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
        redis.call('HSET', KEYS[1], 'lastSeen', ARGV[2])
        redis.call('EXPIRE', KEYS[1], ARGV[3])
        redis.call('EXPIRE', KEYS[2], ARGV[3])
        return 1
        "#,
    )
});

// ARGV[1]=conn ARGV[2]=now ARGV[3]=offline retention
static DISCONNECT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local removed = redis.call('SREM', KEYS[2], ARGV[1])
        if removed == 0 then return 0 end
        if redis.call('SCARD', KEYS[2]) > 0 then return 0 end
        redis.call('HSET', KEYS[1], 'status', 'offline', 'activeChatId', '', 'lastSeen', ARGV[2])
        redis.call('HINCRBY', KEYS[1], 'version', 1)
        redis.call('EXPIRE', KEYS[1], ARGV[3])
        return 1
        "#,
    )
});

static GET_PRESENCE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local size = redis.call('SCARD', KEYS[2])
        local h = redis.call('HMGET', KEYS[1], 'status', 'activeChatId', 'lastSeen', 'version')
        return { tostring(size), h[1] or '', h[2] or '', h[3] or '0', h[4] or '0' }
        "#,
    )
});

/// Redis 在线状态存储（多实例部署）
pub struct RedisPresenceStore {
    client: RedisClient,
    ttl_secs: u64,
    offline_retention_secs: u64,
}

impl RedisPresenceStore {
    pub fn new(client: RedisClient, config: &PresenceConfig) -> Self {
        tracing::info!(
            "🟢 RedisPresenceStore initialized: ttl={}s, offline_retention={}s",
            config.ttl_secs,
            config.offline_retention_secs
        );
        Self {
            client,
            ttl_secs: config.ttl_secs,
            offline_retention_secs: config.offline_retention_secs,
        }
    }

    fn keys(user_id: UserId) -> Vec<String> {
        vec![format!("presence:{}", user_id), format!("sockets:{}", user_id)]
    }
}

/// 解析 GET_PRESENCE 脚本的返回值
pub(crate) fn parse_presence_reply(reply: &[String]) -> Result<PresenceRecord> {
    let [size, status, chat, last_seen, version] = reply else {
        return Err(ServerError::Store(format!("unexpected presence reply: {:?}", reply)));
    };
    let size: u64 = size.parse().unwrap_or(0);
    let last_seen: i64 = last_seen.parse().unwrap_or(0);
    let version: u64 = version.parse().unwrap_or(0);

    let status = PresenceStatus::parse(status).unwrap_or(PresenceStatus::Offline);
    if size == 0 || !status.is_connected() {
        return Ok(PresenceRecord::offline(last_seen, version));
    }

    let active_conversation_id = match status {
        PresenceStatus::InChat => chat.parse().ok().map(ConversationId),
        _ => None,
    };
    Ok(PresenceRecord {
        status,
        active_conversation_id,
        last_seen,
        version,
    })
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_online(&self, user_id: UserId, connection_id: ConnectionId) -> Result<bool> {
        let first: i64 = self
            .client
            .invoke_script(
                &SET_ONLINE,
                &Self::keys(user_id),
                &[
                    connection_id.to_string(),
                    now_millis().to_string(),
                    self.ttl_secs.to_string(),
                ],
            )
            .await?;
        Ok(first == 1)
    }

    async fn set_in_chat(&self, user_id: UserId, conversation_id: ConversationId) -> Result<()> {
        let _: i64 = self
            .client
            .invoke_script(
                &SET_STATUS_IF_CONNECTED,
                &Self::keys(user_id),
                &[
                    PresenceStatus::InChat.as_str().to_string(),
                    conversation_id.to_string(),
                    now_millis().to_string(),
                    self.ttl_secs.to_string(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn set_online_from_chat(&self, user_id: UserId) -> Result<()> {
        let _: i64 = self
            .client
            .invoke_script(
                &SET_STATUS_IF_CONNECTED,
                &Self::keys(user_id),
                &[
                    PresenceStatus::Online.as_str().to_string(),
                    String::new(),
                    now_millis().to_string(),
                    self.ttl_secs.to_string(),
                ],
            )
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, user_id: UserId, connection_id: ConnectionId) -> Result<bool> {
        let refreshed: i64 = self
            .client
            .invoke_script(
                &HEARTBEAT,
                &Self::keys(user_id),
                &[
                    connection_id.to_string(),
                    now_millis().to_string(),
                    self.ttl_secs.to_string(),
                ],
            )
            .await?;
        Ok(refreshed == 1)
    }

    async fn handle_disconnect(&self, user_id: UserId, connection_id: ConnectionId) -> Result<bool> {
        let went_offline: i64 = self
            .client
            .invoke_script(
                &DISCONNECT,
                &Self::keys(user_id),
                &[
                    connection_id.to_string(),
                    now_millis().to_string(),
                    self.offline_retention_secs.to_string(),
                ],
            )
            .await?;
        Ok(went_offline == 1)
    }

    async fn get_presence(&self, user_id: UserId) -> Result<PresenceRecord> {
        let reply: Vec<String> = self
            .client
            .invoke_script(&GET_PRESENCE, &Self::keys(user_id), &[])
            .await?;
        parse_presence_reply(&reply)
    }

    async fn connection_count(&self, user_id: UserId) -> Result<usize> {
        let reply: Vec<String> = self
            .client
            .invoke_script(&GET_PRESENCE, &Self::keys(user_id), &[])
            .await?;
        Ok(reply.first().and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(parts: [&str; 5]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_in_chat() {
        let record = parse_presence_reply(&reply(["2", "in_chat", "15", "1700", "4"])).unwrap();
        assert_eq!(record.status, PresenceStatus::InChat);
        assert_eq!(record.active_conversation_id, Some(ConversationId(15)));
        assert_eq!(record.version, 4);
    }

    #[test]
    fn test_empty_socket_set_reads_offline() {
        let record = parse_presence_reply(&reply(["0", "online", "", "1700", "3"])).unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.last_seen, 1700);
    }

    #[test]
    fn test_missing_record_reads_offline() {
        let record = parse_presence_reply(&reply(["0", "", "", "0", "0"])).unwrap();
        assert_eq!(record, PresenceRecord::default());
        assert!(parse_presence_reply(&["1".to_string()]).is_err());
    }
}
