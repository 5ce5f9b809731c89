use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{PresenceBackend, ServerConfig, StorageBackend};
use crate::error::ServerError;
use crate::handler::{CallHandler, EventDispatcher, MessageHandler, SessionHandler};
use crate::infra::{
    database::Database, metrics, MemoryPresenceStore, PresenceStore, RealtimeHub, RedisClient,
    RedisPresenceStore,
};
use crate::repository::{
    CallRepository, ConversationRepository, MemoryCallRepository, MemoryConversationRepository,
    MemoryMessageRepository, MessageRepository, PgCallRepository, PgConversationRepository,
    PgMessageRepository,
};
use crate::service::{
    CallSignalingService, ConversationListService, ConversationUpdateService, DeliveryService,
    PresenceService,
};

/// 实时投递子系统的全部组件
///
/// 进程启动时构造一次，以 `Arc` 注入到 WebSocket 会话和 HTTP 路由。
pub struct RealtimeServices {
    pub config: ServerConfig,
    pub hub: Arc<RealtimeHub>,
    pub presence: Arc<PresenceService>,
    pub delivery: Arc<DeliveryService>,
    pub aggregates: Arc<ConversationUpdateService>,
    pub conversation_list: Arc<ConversationListService>,
    pub calls: CallSignalingService,
    pub messages: Arc<dyn MessageRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub call_records: Arc<dyn CallRepository>,
    pub dispatcher: Arc<EventDispatcher>,
}

impl RealtimeServices {
    /// 按给定的存储后端装配组件
    pub fn new(
        config: ServerConfig,
        presence_store: Arc<dyn PresenceStore>,
        messages: Arc<dyn MessageRepository>,
        conversations: Arc<dyn ConversationRepository>,
        call_records: Arc<dyn CallRepository>,
    ) -> Arc<Self> {
        let hub = RealtimeHub::new();

        let presence = Arc::new(PresenceService::new(
            presence_store,
            conversations.clone(),
            hub.clone(),
        ));
        let aggregates = Arc::new(ConversationUpdateService::new(
            conversations.clone(),
            hub.clone(),
        ));
        let delivery = Arc::new(DeliveryService::new(
            &config.delivery,
            messages.clone(),
            conversations.clone(),
            presence.clone(),
            aggregates.clone(),
            hub.clone(),
        ));
        let conversation_list = Arc::new(ConversationListService::new(
            conversations.clone(),
            presence.clone(),
        ));
        let calls = CallSignalingService::new(
            &config.call,
            call_records.clone(),
            presence.clone(),
            hub.clone(),
        );

        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::new(SessionHandler::new(
                hub.clone(),
                presence.clone(),
                delivery.clone(),
                calls.clone(),
            )),
            Arc::new(MessageHandler::new(delivery.clone())),
            Arc::new(CallHandler::new(calls.clone())),
        ));

        Arc::new(Self {
            config,
            hub,
            presence,
            delivery,
            aggregates,
            conversation_list,
            calls,
            messages,
            conversations,
            call_records,
            dispatcher,
        })
    }

    /// 全内存后端（开发 / 测试）
    pub fn in_memory(config: ServerConfig) -> Arc<Self> {
        let store = Arc::new(MemoryPresenceStore::new(&config.presence));
        Self::new(
            config,
            store,
            Arc::new(MemoryMessageRepository::new()),
            Arc::new(MemoryConversationRepository::new()),
            Arc::new(MemoryCallRepository::new()),
        )
    }
}

/// 实时投递服务器
pub struct RealtimeServer {
    services: Arc<RealtimeServices>,
    database: Option<Database>,
    background: Vec<JoinHandle<()>>,
}

impl RealtimeServer {
    /// 按配置创建存储后端并装配服务
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        info!("🔧 初始化实时投递服务组件...");

        if config.metrics_enabled && !metrics::is_initialized() {
            if let Err(e) = metrics::init() {
                warn!("⚠️ Prometheus 指标初始化失败: {}", e);
            } else {
                info!("📊 Prometheus 指标已启用 (GET /metrics)");
            }
        }

        let mut background = Vec::new();

        // 在线状态存储
        let presence_store: Arc<dyn PresenceStore> = match config.presence.backend {
            PresenceBackend::Memory => {
                let store = Arc::new(MemoryPresenceStore::new(&config.presence));
                background.push(store.start_sweeper(config.presence.sweep_interval()));
                store
            }
            PresenceBackend::Redis => {
                let redis_config = config.redis.as_ref().ok_or_else(|| {
                    ServerError::Configuration("presence.backend = redis 但缺少 [redis] 配置".to_string())
                })?;
                let client = RedisClient::new(redis_config).await?;
                Arc::new(RedisPresenceStore::new(client, &config.presence))
            }
        };

        // 持久化
        let (database, messages, conversations, call_records): (
            Option<Database>,
            Arc<dyn MessageRepository>,
            Arc<dyn ConversationRepository>,
            Arc<dyn CallRepository>,
        ) = match config.storage.backend {
            StorageBackend::Memory => {
                info!("📦 使用内存存储（重启后数据丢失）");
                (
                    None,
                    Arc::new(MemoryMessageRepository::new()),
                    Arc::new(MemoryConversationRepository::new()),
                    Arc::new(MemoryCallRepository::new()),
                )
            }
            StorageBackend::Postgres => {
                let url = config.storage.database_url.as_deref().ok_or_else(|| {
                    ServerError::Configuration("storage.backend = postgres 但缺少 database_url".to_string())
                })?;
                let database = Database::new(url, config.storage.max_connections)
                    .await
                    .map_err(|e| ServerError::Database(format!("数据库连接失败: {}", e)))?;
                let pool = database.pool().clone();
                (
                    Some(database),
                    Arc::new(PgMessageRepository::new(pool.clone())),
                    Arc::new(PgConversationRepository::new(pool.clone())),
                    Arc::new(PgCallRepository::new(pool)),
                )
            }
        };

        let services = RealtimeServices::new(config, presence_store, messages, conversations, call_records);
        info!("✅ 实时投递服务组件初始化完成");

        Ok(Self {
            services,
            database,
            background,
        })
    }

    pub fn services(&self) -> &Arc<RealtimeServices> {
        &self.services
    }

    /// 启动 HTTP / WebSocket 服务，直到收到 Ctrl-C
    pub async fn run(self) -> Result<(), ServerError> {
        let address = self.services.config.bind_address();
        let app = crate::http::create_router(self.services.clone());
        let listener = tokio::net::TcpListener::bind(&address).await?;

        info!("🌐 实时投递服务启动: http://{} (WebSocket: ws://{}/ws)", address, address);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        info!("🛑 服务器正在关闭...");
        for handle in self.background {
            handle.abort();
        }
        if let Some(database) = self.database {
            database.pool().close().await;
        }
        info!("✅ 服务器已关闭");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("⚠️ 无法监听 Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("📴 收到关闭信号");
}
