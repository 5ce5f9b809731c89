//! 在线状态存储
//!
//! 每个用户一条带版本号的记录 + 一个连接集合，二者都有 TTL。
//! 所有操作对单个用户是原子的：内存后端靠 DashMap 的分片锁，Redis 后端靠 Lua 脚本。

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::PresenceConfig;
use crate::error::Result;
use crate::model::{now_millis, ConnectionId, ConversationId, PresenceRecord, PresenceStatus, UserId};

/// 在线状态存储接口
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 添加连接并标记在线；返回是否为 0 -> 1 的首个连接
    async fn set_online(&self, user_id: UserId, connection_id: ConnectionId) -> Result<bool>;

    /// 进入会话（仅对在线用户生效）
    async fn set_in_chat(&self, user_id: UserId, conversation_id: ConversationId) -> Result<()>;

    /// 离开会话，回到在线
    async fn set_online_from_chat(&self, user_id: UserId) -> Result<()>;

    /// 刷新 TTL；连接已不在集合中时返回 false
    async fn heartbeat(&self, user_id: UserId, connection_id: ConnectionId) -> Result<bool>;

    /// 移除连接；仅当确实移除了成员且集合变空时返回 true
    async fn handle_disconnect(&self, user_id: UserId, connection_id: ConnectionId) -> Result<bool>;

    /// 读取在线状态；不存在或已过期视为离线
    async fn get_presence(&self, user_id: UserId) -> Result<PresenceRecord>;

    /// 当前存活连接数
    async fn connection_count(&self, user_id: UserId) -> Result<usize>;

    fn backend_name(&self) -> &'static str;
}

struct PresenceEntry {
    status: PresenceStatus,
    active_conversation_id: Option<ConversationId>,
    last_seen: i64,
    version: u64,
    record_expires_at: Instant,
    connections: HashSet<ConnectionId>,
    connections_expire_at: Instant,
}

impl PresenceEntry {
    fn new(now: Instant) -> Self {
        Self {
            status: PresenceStatus::Offline,
            active_conversation_id: None,
            last_seen: 0,
            version: 0,
            record_expires_at: now,
            connections: HashSet::new(),
            connections_expire_at: now,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        !self.connections.is_empty() && now < self.connections_expire_at && now < self.record_expires_at
    }

    fn refresh(&mut self, now: Instant, ttl: Duration) {
        self.connections_expire_at = now + ttl;
        self.record_expires_at = now + ttl;
        self.last_seen = now_millis();
    }

    fn go_offline(&mut self, now: Instant, retention: Duration) {
        self.connections.clear();
        self.status = PresenceStatus::Offline;
        self.active_conversation_id = None;
        self.record_expires_at = now + retention;
        self.version += 1;
    }

    fn view(&self, now: Instant) -> PresenceRecord {
        if self.is_live(now) {
            PresenceRecord {
                status: self.status,
                active_conversation_id: self.active_conversation_id,
                last_seen: self.last_seen,
                version: self.version,
            }
        } else {
            PresenceRecord::offline(self.last_seen, self.version)
        }
    }
}

/// 内存在线状态存储（单实例部署 / 测试）
pub struct MemoryPresenceStore {
    entries: DashMap<UserId, PresenceEntry>,
    ttl: Duration,
    offline_retention: Duration,
}

impl MemoryPresenceStore {
    pub fn new(config: &PresenceConfig) -> Self {
        info!(
            "🟢 MemoryPresenceStore initialized: ttl={}s, offline_retention={}s",
            config.ttl_secs, config.offline_retention_secs
        );
        Self {
            entries: DashMap::new(),
            ttl: config.ttl(),
            offline_retention: config.offline_retention(),
        }
    }

    /// 清理过期记录：TTL 到期的在线记录衰减为离线，超过保留期的离线记录删除。
    /// 返回本次衰减的用户数
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let retention = self.offline_retention;
        let mut decayed = 0;
        self.entries.retain(|_, entry| {
            if entry.status.is_connected() && !entry.is_live(now) {
                entry.go_offline(now, retention);
                decayed += 1;
                true
            } else {
                entry.status.is_connected() || now < entry.record_expires_at
            }
        });
        decayed
    }

    /// 启动后台清理任务
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let decayed = store.sweep();
                if decayed > 0 {
                    debug!("🧹 presence TTL 到期: {} 个用户衰减为离线", decayed);
                }
            }
        })
    }

    pub fn tracked_users(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_online(&self, user_id: UserId, connection_id: ConnectionId) -> Result<bool> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(user_id)
            .or_insert_with(|| PresenceEntry::new(now));

        if !entry.is_live(now) {
            entry.connections.clear();
        }
        let was_empty = entry.connections.is_empty();
        let inserted = entry.connections.insert(connection_id);

        entry.status = PresenceStatus::Online;
        entry.active_conversation_id = None;
        entry.refresh(now, self.ttl);
        entry.version += 1;

        Ok(was_empty && inserted)
    }

    async fn set_in_chat(&self, user_id: UserId, conversation_id: ConversationId) -> Result<()> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(&user_id) {
            if entry.is_live(now) {
                entry.status = PresenceStatus::InChat;
                entry.active_conversation_id = Some(conversation_id);
                entry.refresh(now, self.ttl);
                entry.version += 1;
                return Ok(());
            }
        }
        debug!("用户 {} 不在线，忽略 set_in_chat({})", user_id, conversation_id);
        Ok(())
    }

    async fn set_online_from_chat(&self, user_id: UserId) -> Result<()> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(&user_id) {
            if entry.is_live(now) {
                entry.status = PresenceStatus::Online;
                entry.active_conversation_id = None;
                entry.refresh(now, self.ttl);
                entry.version += 1;
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, user_id: UserId, connection_id: ConnectionId) -> Result<bool> {
        let now = Instant::now();
        match self.entries.get_mut(&user_id) {
            Some(mut entry) if entry.is_live(now) && entry.connections.contains(&connection_id) => {
                entry.refresh(now, self.ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn handle_disconnect(&self, user_id: UserId, connection_id: ConnectionId) -> Result<bool> {
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(&user_id) else {
            return Ok(false);
        };

        if !entry.is_live(now) {
            // TTL 已经让它离线了，这里不再报告下线
            if entry.status.is_connected() {
                entry.go_offline(now, self.offline_retention);
            }
            return Ok(false);
        }

        let removed = entry.connections.remove(&connection_id);
        if !removed || !entry.connections.is_empty() {
            return Ok(false);
        }

        entry.last_seen = now_millis();
        entry.go_offline(now, self.offline_retention);
        Ok(true)
    }

    async fn get_presence(&self, user_id: UserId) -> Result<PresenceRecord> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(&user_id)
            .map(|entry| entry.view(now))
            .unwrap_or_default())
    }

    async fn connection_count(&self, user_id: UserId) -> Result<usize> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(&user_id)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.connections.len())
            .unwrap_or(0))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
