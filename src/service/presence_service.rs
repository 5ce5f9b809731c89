//! 在线状态服务
//!
//! 包装 PresenceStore：存储出错时按离线处理（读）或记录后忽略（写），
//! 并在用户上线 / 下线时向会话对方推送 presence_update。

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::infra::metrics;
use crate::infra::{Channel, EventEmitter, PresenceStore};
use crate::model::{ConnectionId, ConversationId, PresenceRecord, UserId};
use crate::protocol::ServerEvent;
use crate::repository::ConversationRepository;

pub struct PresenceService {
    store: Arc<dyn PresenceStore>,
    conversations: Arc<dyn ConversationRepository>,
    emitter: Arc<dyn EventEmitter>,
}

impl PresenceService {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        conversations: Arc<dyn ConversationRepository>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        info!("🔔 PresenceService initialized (backend={})", store.backend_name());
        Self {
            store,
            conversations,
            emitter,
        }
    }

    /// 连接上线；返回是否为首个连接
    pub async fn connect(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        match self.store.set_online(user_id, connection_id).await {
            Ok(first) => {
                if first {
                    info!("🟢 用户 {} 上线", user_id);
                    metrics::record_user_online();
                    self.broadcast(user_id).await;
                }
                first
            }
            Err(e) => {
                warn!("⚠️ set_online 失败 user={}: {}", user_id, e);
                metrics::record_presence_error("set_online");
                false
            }
        }
    }

    /// 连接断开；返回用户是否因此离线
    pub async fn disconnect(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        match self.store.handle_disconnect(user_id, connection_id).await {
            Ok(true) => {
                info!("⚪ 用户 {} 离线", user_id);
                metrics::record_user_offline();
                self.broadcast(user_id).await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("⚠️ handle_disconnect 失败 user={}: {}", user_id, e);
                metrics::record_presence_error("handle_disconnect");
                false
            }
        }
    }

    pub async fn enter_chat(&self, user_id: UserId, conversation_id: ConversationId) {
        if let Err(e) = self.store.set_in_chat(user_id, conversation_id).await {
            warn!("⚠️ set_in_chat 失败 user={} conversation={}: {}", user_id, conversation_id, e);
            metrics::record_presence_error("set_in_chat");
        }
    }

    pub async fn leave_chat(&self, user_id: UserId) {
        if let Err(e) = self.store.set_online_from_chat(user_id).await {
            warn!("⚠️ set_online_from_chat 失败 user={}: {}", user_id, e);
            metrics::record_presence_error("set_online_from_chat");
        }
    }

    /// 刷新 TTL；连接已不在集合中时返回 false
    pub async fn heartbeat(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        match self.store.heartbeat(user_id, connection_id).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                debug!("heartbeat 失败 user={}: {}", user_id, e);
                metrics::record_presence_error("heartbeat");
                // 存储不可用时不触发重新上线
                true
            }
        }
    }

    /// 读取在线状态；存储出错按离线处理
    pub async fn get(&self, user_id: UserId) -> PresenceRecord {
        match self.store.get_presence(user_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("⚠️ get_presence 失败 user={}，按离线处理: {}", user_id, e);
                metrics::record_presence_error("get_presence");
                PresenceRecord::default()
            }
        }
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.get(user_id).await.status.is_connected()
    }

    /// 向所有会话对方推送当前状态
    async fn broadcast(&self, user_id: UserId) {
        let partners: Vec<Channel> = match self.conversations.list_for_user(user_id).await {
            Ok(conversations) => conversations
                .iter()
                .filter_map(|c| c.other_participant(user_id))
                .map(Channel::User)
                .collect(),
            Err(e) => {
                warn!("⚠️ 查询用户 {} 的会话失败，跳过 presence 推送: {}", user_id, e);
                return;
            }
        };
        if partners.is_empty() {
            return;
        }

        let record = self.get(user_id).await;
        self.emitter.emit(
            &partners,
            ServerEvent::PresenceUpdate {
                user_id,
                status: record.status,
                last_seen: record.last_seen,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceConfig;
    use crate::error::{Result, ServerError};
    use crate::infra::{MemoryPresenceStore, RealtimeHub};
    use crate::model::PresenceStatus;
    use crate::repository::MemoryConversationRepository;
    use async_trait::async_trait;

    /// 所有操作都失败的存储
    struct BrokenStore;

    #[async_trait]
    impl PresenceStore for BrokenStore {
        async fn set_online(&self, _: UserId, _: ConnectionId) -> Result<bool> {
            Err(ServerError::Store("down".into()))
        }
        async fn set_in_chat(&self, _: UserId, _: ConversationId) -> Result<()> {
            Err(ServerError::Store("down".into()))
        }
        async fn set_online_from_chat(&self, _: UserId) -> Result<()> {
            Err(ServerError::Store("down".into()))
        }
        async fn heartbeat(&self, _: UserId, _: ConnectionId) -> Result<bool> {
            Err(ServerError::Store("down".into()))
        }
        async fn handle_disconnect(&self, _: UserId, _: ConnectionId) -> Result<bool> {
            Err(ServerError::Store("down".into()))
        }
        async fn get_presence(&self, _: UserId) -> Result<PresenceRecord> {
            Err(ServerError::Store("down".into()))
        }
        async fn connection_count(&self, _: UserId) -> Result<usize> {
            Err(ServerError::Store("down".into()))
        }
        fn backend_name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_store_failure_reads_offline() {
        let service = PresenceService::new(
            Arc::new(BrokenStore),
            Arc::new(MemoryConversationRepository::new()),
            RealtimeHub::new(),
        );
        assert!(!service.connect(UserId(1), ConnectionId::new()).await);
        assert_eq!(service.get(UserId(1)).await.status, PresenceStatus::Offline);
        assert!(!service.is_online(UserId(1)).await);
        assert!(!service.disconnect(UserId(1), ConnectionId::new()).await);
    }

    #[tokio::test]
    async fn test_partners_notified_on_transitions() {
        let hub = RealtimeHub::new();
        let conversations = Arc::new(MemoryConversationRepository::new());
        conversations
            .find_or_create_between(UserId(1), UserId(2))
            .await
            .unwrap();
        let service = PresenceService::new(
            Arc::new(MemoryPresenceStore::new(&PresenceConfig::default())),
            conversations,
            hub.clone(),
        );

        let (partner_conn, mut partner_rx) = hub.connect();
        hub.bind_user(partner_conn, UserId(2));

        let conn = ConnectionId::new();
        assert!(service.connect(UserId(1), conn).await);
        match partner_rx.recv().await {
            Some(ServerEvent::PresenceUpdate { user_id, status, .. }) => {
                assert_eq!(user_id, UserId(1));
                assert_eq!(status, PresenceStatus::Online);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(service.disconnect(UserId(1), conn).await);
        match partner_rx.recv().await {
            Some(ServerEvent::PresenceUpdate { status, .. }) => assert_eq!(status, PresenceStatus::Offline),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
