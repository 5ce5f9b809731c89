//! 领域模型
//!
//! 所有标识符均为强类型 newtype，序列化为底层数值/字符串。

pub mod call;
pub mod conversation;
pub mod message;
pub mod presence;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use call::{
    CallDirection, CallHistoryEntry, CallHistoryStatus, CallPhase, CallRecord, CallRole,
    CallState, CallType, EndReason,
};
pub use conversation::{Conversation, ConversationSummary, LastMessagePreview};
pub use message::{MediaAttachment, MediaKind, Message, MessageStatus, NewMessage};
pub use presence::{PresenceRecord, PresenceStatus};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map(Self)
            }
        }
    };
}

numeric_id!(
    /// 用户ID
    UserId
);
numeric_id!(
    /// 会话ID
    ConversationId
);
numeric_id!(
    /// 消息ID（Snowflake）
    MessageId
);
numeric_id!(
    /// 通话ID（Snowflake）
    CallId
);

/// 连接ID（每条 WebSocket 连接一个，跨进程唯一）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 当前毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_serializes_transparently() {
        let id = UserId(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let parsed: ConversationId = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, ConversationId(7));
        assert_eq!("9".parse::<CallId>().unwrap(), CallId(9));
    }

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }
}
