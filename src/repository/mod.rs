//! 持久化层
//!
//! 每个聚合一个 trait，提供 PostgreSQL 实现和内存实现（开发 / 测试）。
//! 所有状态变更都是存储层的条件更新，调用方拿到的是更新后的结果。

pub mod call_repo;
pub mod conversation_repo;
pub mod memory;
pub mod message_repo;

pub use call_repo::{CallRepository, PgCallRepository};
pub use conversation_repo::{ConversationRepository, PgConversationRepository};
pub use memory::{MemoryCallRepository, MemoryConversationRepository, MemoryMessageRepository};
pub use message_repo::{MessageRepository, PgMessageRepository};

/// 游标分页参数：按时间戳向前翻页
#[derive(Debug, Clone, Copy)]
pub struct MessagePage {
    pub limit: usize,
    /// 只返回早于该时间戳的消息
    pub before: Option<i64>,
}

impl MessagePage {
    pub const MAX_LIMIT: usize = 200;

    pub fn new(limit: usize, before: Option<i64>) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            before,
        }
    }
}

impl Default for MessagePage {
    fn default() -> Self {
        Self::new(50, None)
    }
}

/// 会话列表分页：按 updated_at 向前翻页
#[derive(Debug, Clone, Copy)]
pub struct ConversationPage {
    pub limit: usize,
    /// 只返回 updated_at 早于该值的会话
    pub before: Option<i64>,
}

impl ConversationPage {
    pub const MAX_LIMIT: usize = 100;

    pub fn new(limit: usize, before: Option<i64>) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            before,
        }
    }
}

impl Default for ConversationPage {
    fn default() -> Self {
        Self::new(20, None)
    }
}
