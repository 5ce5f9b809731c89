use std::collections::HashSet;
use std::net::SocketAddr;

use crate::error::{Result, ServerError};
use crate::model::{ConnectionId, ConversationId, UserId};

/// 单条 WebSocket 连接的上下文
///
/// 只属于这条连接，不跨连接共享；跨连接的状态一律走 PresenceStore 和持久化层。
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// 连接ID
    pub connection_id: ConnectionId,
    /// register_user 之后才有
    pub user_id: Option<UserId>,
    /// 本连接加入的会话房间
    pub joined: HashSet<ConversationId>,
    /// 最近一次 join_chat 的会话；离开后清空
    pub active: Option<ConversationId>,
    /// 客户端地址
    pub remote_addr: Option<SocketAddr>,
    /// 建立时间
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

impl SessionContext {
    pub fn new(connection_id: ConnectionId, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            connection_id,
            user_id: None,
            joined: HashSet::new(),
            active: None,
            remote_addr,
            connected_at: chrono::Utc::now(),
        }
    }

    /// 已注册的用户；未注册时返回 Unauthorized
    pub fn require_user(&self) -> Result<UserId> {
        self.user_id.ok_or_else(|| {
            ServerError::Unauthorized(format!("连接 {} 尚未 register_user", self.connection_id))
        })
    }

    pub fn has_joined(&self, conversation_id: ConversationId) -> bool {
        self.joined.contains(&conversation_id)
    }

    pub fn enter(&mut self, conversation_id: ConversationId) {
        self.joined.insert(conversation_id);
        self.active = Some(conversation_id);
    }

    pub fn exit(&mut self, conversation_id: ConversationId) {
        self.joined.remove(&conversation_id);
        if self.active == Some(conversation_id) {
            self.active = None;
        }
    }

    /// 切换用户时清空房间
    pub fn reset_rooms(&mut self) {
        self.joined.clear();
        self.active = None;
    }
}
