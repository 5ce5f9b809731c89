use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::handler::EventHandler;
use crate::infra::{Channel, EventEmitter, RealtimeHub};
use crate::model::{ConversationId, UserId};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::service::{CallSignalingService, DeliveryService, PresenceService};
use crate::Result;

/// 连接生命周期处理器：注册、进出会话房间、输入状态、断开
pub struct SessionHandler {
    hub: Arc<RealtimeHub>,
    presence: Arc<PresenceService>,
    delivery: Arc<DeliveryService>,
    calls: CallSignalingService,
}

impl SessionHandler {
    pub fn new(
        hub: Arc<RealtimeHub>,
        presence: Arc<PresenceService>,
        delivery: Arc<DeliveryService>,
        calls: CallSignalingService,
    ) -> Self {
        Self {
            hub,
            presence,
            delivery,
            calls,
        }
    }

    async fn register(&self, ctx: &mut SessionContext, user_id: UserId) -> Result<()> {
        match ctx.user_id {
            Some(current) if current == user_id => {
                debug!("连接 {} 重复注册用户 {}", ctx.connection_id, user_id);
                self.heartbeat(ctx).await;
                return Ok(());
            }
            Some(previous) => {
                info!("🔄 连接 {} 从用户 {} 切换到 {}", ctx.connection_id, previous, user_id);
                self.release(ctx, previous).await;
                ctx.reset_rooms();
            }
            None => {}
        }

        self.hub.bind_user(ctx.connection_id, user_id);
        ctx.user_id = Some(user_id);
        let first = self.presence.connect(user_id, ctx.connection_id).await;

        self.hub.send_to(
            ctx.connection_id,
            ServerEvent::Registered {
                user_id,
                connection_id: ctx.connection_id,
            },
        );

        if first {
            if let Err(e) = self.delivery.reconcile_on_connect(user_id).await {
                warn!("⚠️ 用户 {} 上线对账失败，下次上线重试: {}", user_id, e);
            }
        }
        Ok(())
    }

    async fn join_chat(&self, ctx: &mut SessionContext, chat_id: ConversationId, claimed: Option<UserId>) -> Result<()> {
        let user_id = ctx.require_user()?;
        if let Some(claimed) = claimed.filter(|c| *c != user_id) {
            warn!("⚠️ join_chat 携带的 userId {} 与连接身份 {} 不一致，以连接身份为准", claimed, user_id);
        }
        self.delivery.counterpart(chat_id, user_id).await?;

        self.hub.join(ctx.connection_id, Channel::Conversation(chat_id));
        ctx.enter(chat_id);
        self.presence.enter_chat(user_id, chat_id).await;
        debug!("💬 用户 {} 进入会话 {}", user_id, chat_id);

        self.delivery.reconcile_on_join(chat_id, user_id).await?;
        Ok(())
    }

    async fn leave_chat(&self, ctx: &mut SessionContext, chat_id: ConversationId) -> Result<()> {
        let user_id = ctx.require_user()?;
        self.hub.leave(ctx.connection_id, Channel::Conversation(chat_id));
        ctx.exit(chat_id);

        // 同一用户的其他设备还开着这个会话时保持 in_chat
        let room = Channel::Conversation(chat_id);
        if !self.hub.user_in_channel(user_id, room)
            && self.presence.get(user_id).await.is_viewing(chat_id)
        {
            self.presence.leave_chat(user_id).await;
        }
        debug!("👋 用户 {} 离开会话 {}", user_id, chat_id);
        Ok(())
    }

    fn typing(&self, ctx: &SessionContext, chat_id: ConversationId, started: bool) -> Result<()> {
        let user_id = ctx.require_user()?;
        if !ctx.has_joined(chat_id) {
            debug!("连接 {} 未加入会话 {}，忽略 typing", ctx.connection_id, chat_id);
            return Ok(());
        }
        let event = if started {
            ServerEvent::UserTypingStart { chat_id, user_id }
        } else {
            ServerEvent::UserTypingStop { chat_id, user_id }
        };
        self.hub
            .emit_except(&[Channel::Conversation(chat_id)], ctx.connection_id, event);
        Ok(())
    }

    /// 任意入站帧或 pong 时刷新 TTL；记录已衰减则按重新上线处理
    pub async fn heartbeat(&self, ctx: &SessionContext) {
        let Some(user_id) = ctx.user_id else {
            return;
        };
        if self.presence.heartbeat(user_id, ctx.connection_id).await {
            return;
        }
        debug!("用户 {} 的 presence 已过期，重新上线", user_id);
        if self.presence.connect(user_id, ctx.connection_id).await {
            if let Err(e) = self.delivery.reconcile_on_connect(user_id).await {
                warn!("⚠️ 用户 {} 上线对账失败: {}", user_id, e);
            }
        }
        if let Some(active) = ctx.active {
            self.presence.enter_chat(user_id, active).await;
        }
    }

    /// 连接断开：离开所有房间，最后一个连接断开时用户下线
    pub async fn on_disconnect(&self, ctx: &SessionContext) {
        self.hub.disconnect(ctx.connection_id);
        if let Some(user_id) = ctx.user_id {
            self.release(ctx, user_id).await;
        }
    }

    /// 从 presence 中移除这条连接；用户彻底离线时结束其通话
    async fn release(&self, ctx: &SessionContext, user_id: UserId) {
        for chat_id in &ctx.joined {
            self.hub.leave(ctx.connection_id, Channel::Conversation(*chat_id));
        }
        let went_offline = self.presence.disconnect(user_id, ctx.connection_id).await;
        if went_offline {
            self.calls.end_calls_for(user_id);
            return;
        }
        // 其他连接还在：活跃会话是这条连接打开的、且没有别的设备开着它时，回到 online
        let record = self.presence.get(user_id).await;
        if let Some(active) = record.active_conversation_id {
            if ctx.has_joined(active) && !self.hub.user_in_channel(user_id, Channel::Conversation(active)) {
                self.presence.leave_chat(user_id).await;
            }
        }
    }
}

#[async_trait]
impl EventHandler for SessionHandler {
    async fn handle(&self, ctx: &mut SessionContext, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::RegisterUser { user_id } => self.register(ctx, user_id).await,
            ClientEvent::JoinChat { chat_id, user_id } => self.join_chat(ctx, chat_id, user_id).await,
            ClientEvent::LeaveChat { chat_id, .. } => self.leave_chat(ctx, chat_id).await,
            ClientEvent::TypingStart { chat_id } => self.typing(ctx, chat_id, true),
            ClientEvent::TypingStop { chat_id } => self.typing(ctx, chat_id, false),
            other => {
                debug!("SessionHandler 忽略事件 {}", other.name());
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "SessionHandler"
    }
}
