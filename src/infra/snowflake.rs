//! Snowflake ID 生成器
//!
//! 消息、会话、通话ID共用一个生成器：41位时间戳 + 5位数据中心ID + 5位机器ID + 12位序列号。
//! 数据中心/机器ID从 `SNOWFLAKE_DATA_CENTER_ID` / `SNOWFLAKE_MACHINE_ID` 读取，默认 1。

use parking_lot::Mutex;
use snowflake_me::Snowflake;
use std::sync::OnceLock;

use crate::error::{Result, ServerError};
use crate::model::{CallId, ConversationId, MessageId};

static ID_GENERATOR: OnceLock<Option<Mutex<Snowflake>>> = OnceLock::new();

fn generator() -> Result<&'static Mutex<Snowflake>> {
    ID_GENERATOR
        .get_or_init(|| {
            let data_center_id = std::env::var("SNOWFLAKE_DATA_CENTER_ID")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1u16);

            let machine_id = std::env::var("SNOWFLAKE_MACHINE_ID")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1u16);

            tracing::info!(
                "初始化 Snowflake ID 生成器: data_center_id={}, machine_id={}",
                data_center_id,
                machine_id
            );

            // 手动指定 machine_id / data_center_id，避免依赖 IP 检测
            match Snowflake::builder()
                .machine_id(&|| Ok(machine_id))
                .data_center_id(&|| Ok(data_center_id))
                .finalize()
            {
                Ok(snowflake) => Some(Mutex::new(snowflake)),
                Err(e) => {
                    tracing::error!("❌ Snowflake 初始化失败: {}", e);
                    None
                }
            }
        })
        .as_ref()
        .ok_or_else(|| ServerError::Internal("snowflake generator unavailable".to_string()))
}

fn next_id() -> Result<u64> {
    let guard = generator()?.lock();
    guard
        .next_id()
        .map_err(|e| ServerError::Internal(format!("snowflake id generation failed: {}", e)))
}

/// 生成下一个消息ID
pub fn next_message_id() -> Result<MessageId> {
    next_id().map(MessageId)
}

/// 生成下一个会话ID
pub fn next_conversation_id() -> Result<ConversationId> {
    next_id().map(ConversationId)
}

/// 生成下一个通话ID
pub fn next_call_id() -> Result<CallId> {
    next_id().map(CallId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_monotonic() {
        let id1 = next_message_id().unwrap();
        let id2 = next_message_id().unwrap();
        assert!(id2 > id1, "IDs should be monotonically increasing");
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..100).map(|_| next_call_id().unwrap()).collect::<Vec<_>>()))
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        assert_eq!(all.len(), 800, "All IDs should be unique");
    }
}
