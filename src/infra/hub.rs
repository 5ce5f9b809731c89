//! 实时传输 Hub
//!
//! 维护连接 -> 发送队列、频道 -> 连接集合两张表。每个连接一个无界 mpsc 队列，
//! 同一连接上的事件按入队顺序写出。

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::model::{ConnectionId, ConversationId, UserId};
use crate::protocol::ServerEvent;

/// 每个连接的写队列
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

/// 广播频道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// 会话房间（join_chat 加入）
    Conversation(ConversationId),
    /// 用户个人频道（register_user 加入）
    User(UserId),
}

/// 事件发送接口，组件通过它向频道广播
pub trait EventEmitter: Send + Sync {
    /// 向多个频道的并集广播，同一连接只收到一份；返回送达的连接数
    fn emit(&self, channels: &[Channel], event: ServerEvent) -> usize;

    /// 同 `emit`，但跳过 `except` 连接
    fn emit_except(&self, channels: &[Channel], except: ConnectionId, event: ServerEvent) -> usize;

    /// 直接发给单个连接
    fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool;
}

struct ConnectionEntry {
    sender: EventSender,
    user_id: Option<UserId>,
    channels: HashSet<Channel>,
}

/// Hub 统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub channels: usize,
}

/// 进程内连接与房间管理
#[derive(Default)]
pub struct RealtimeHub {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    channels: DashMap<Channel, HashSet<ConnectionId>>,
}

impl RealtimeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ==================== 连接管理 ====================

    /// 注册新连接，返回连接ID和它的接收端
    pub fn connect(&self) -> (ConnectionId, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = ConnectionId::new();
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                sender: tx,
                user_id: None,
                channels: HashSet::new(),
            },
        );
        crate::infra::metrics::record_connection_count(self.connections.len() as u64);
        debug!("🔗 连接已建立: {}", connection_id);
        (connection_id, rx)
    }

    /// 绑定用户身份并加入个人频道。重复注册同一用户是幂等的；换用户会先离开旧频道
    pub fn bind_user(&self, connection_id: ConnectionId, user_id: UserId) -> bool {
        let previous = match self.connections.get_mut(&connection_id) {
            Some(mut entry) => entry.user_id.replace(user_id),
            None => return false,
        };
        if let Some(previous) = previous.filter(|p| *p != user_id) {
            self.leave(connection_id, Channel::User(previous));
        }
        self.join(connection_id, Channel::User(user_id));
        info!("👤 用户 {} 绑定连接 {}", user_id, connection_id);
        true
    }

    pub fn connection_user(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.connections.get(&connection_id).and_then(|e| e.user_id)
    }

    /// 断开连接：离开所有频道，返回绑定的用户
    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<UserId> {
        let (_, entry) = self.connections.remove(&connection_id)?;
        for channel in &entry.channels {
            self.remove_member(*channel, connection_id);
        }
        crate::infra::metrics::record_connection_count(self.connections.len() as u64);
        debug!("🔌 连接已断开: {} (user={:?})", connection_id, entry.user_id);
        entry.user_id
    }

    // ==================== 频道管理 ====================

    pub fn join(&self, connection_id: ConnectionId, channel: Channel) -> bool {
        match self.connections.get_mut(&connection_id) {
            Some(mut entry) => {
                entry.channels.insert(channel);
            }
            None => return false,
        }
        self.channels.entry(channel).or_default().insert(connection_id);
        true
    }

    pub fn leave(&self, connection_id: ConnectionId, channel: Channel) {
        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.channels.remove(&channel);
        }
        self.remove_member(channel, connection_id);
    }

    fn remove_member(&self, channel: Channel, connection_id: ConnectionId) {
        let now_empty = match self.channels.get_mut(&channel) {
            Some(mut members) => {
                members.remove(&connection_id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.channels.remove_if(&channel, |_, members| members.is_empty());
        }
    }

    pub fn is_member(&self, connection_id: ConnectionId, channel: Channel) -> bool {
        self.channels
            .get(&channel)
            .map(|members| members.contains(&connection_id))
            .unwrap_or(false)
    }

    /// 用户是否还有连接留在某个频道里
    pub fn user_in_channel(&self, user_id: UserId, channel: Channel) -> bool {
        let Some(members) = self.channels.get(&channel) else {
            return false;
        };
        members
            .iter()
            .any(|connection_id| self.connection_user(*connection_id) == Some(user_id))
    }

    /// 频道当前的连接数
    pub fn channel_size(&self, channel: Channel) -> usize {
        self.channels.get(&channel).map(|m| m.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            channels: self.channels.len(),
        }
    }

    fn collect_targets(&self, channels: &[Channel], except: Option<ConnectionId>) -> HashSet<ConnectionId> {
        let mut targets = HashSet::new();
        for channel in channels {
            if let Some(members) = self.channels.get(channel) {
                targets.extend(members.iter().copied());
            }
        }
        if let Some(except) = except {
            targets.remove(&except);
        }
        targets
    }

    fn deliver(&self, targets: HashSet<ConnectionId>, event: ServerEvent) -> usize {
        let mut delivered = 0;
        for connection_id in targets {
            if self.send_to(connection_id, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }
}

impl EventEmitter for RealtimeHub {
    fn emit(&self, channels: &[Channel], event: ServerEvent) -> usize {
        let targets = self.collect_targets(channels, None);
        let name = event.name();
        let delivered = self.deliver(targets, event);
        debug!("📤 {} -> {:?} ({} 个连接)", name, channels, delivered);
        delivered
    }

    fn emit_except(&self, channels: &[Channel], except: ConnectionId, event: ServerEvent) -> usize {
        let targets = self.collect_targets(channels, Some(except));
        self.deliver(targets, event)
    }

    fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        match self.connections.get(&connection_id) {
            Some(entry) => entry.sender.send(event).is_ok(),
            None => false,
        }
    }
}
