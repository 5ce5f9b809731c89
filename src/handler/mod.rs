use async_trait::async_trait;
use std::sync::Arc;

use crate::context::SessionContext;
use crate::infra::metrics;
use crate::protocol::ClientEvent;
use crate::Result;

/// 客户端事件处理器 trait
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &mut SessionContext, event: ClientEvent) -> Result<()>;
    fn name(&self) -> &'static str;
}

// 导出所有处理器
pub mod call_handler;
pub mod message_handler;
pub mod session_handler;

pub use call_handler::CallHandler;
pub use message_handler::MessageHandler;
pub use session_handler::SessionHandler;

/// 按事件类型分发到对应处理器
pub struct EventDispatcher {
    session: Arc<SessionHandler>,
    message: Arc<MessageHandler>,
    call: Arc<CallHandler>,
}

impl EventDispatcher {
    pub fn new(session: Arc<SessionHandler>, message: Arc<MessageHandler>, call: Arc<CallHandler>) -> Self {
        Self {
            session,
            message,
            call,
        }
    }

    pub fn session(&self) -> &Arc<SessionHandler> {
        &self.session
    }

    pub async fn dispatch(&self, ctx: &mut SessionContext, event: ClientEvent) -> Result<()> {
        metrics::record_client_event(event.name());
        let handler: &dyn EventHandler = match &event {
            ClientEvent::RegisterUser { .. }
            | ClientEvent::JoinChat { .. }
            | ClientEvent::LeaveChat { .. }
            | ClientEvent::TypingStart { .. }
            | ClientEvent::TypingStop { .. } => self.session.as_ref(),
            ClientEvent::SendMessage { .. } => self.message.as_ref(),
            ClientEvent::WebrtcOffer { .. }
            | ClientEvent::WebrtcAnswer { .. }
            | ClientEvent::WebrtcIceCandidate { .. }
            | ClientEvent::WebrtcCallEnd { .. }
            | ClientEvent::WebrtcCallDeclined { .. }
            | ClientEvent::WebrtcMediaState { .. }
            | ClientEvent::CheckUserOnline { .. } => self.call.as_ref(),
        };
        tracing::trace!("{} <- {} ({})", handler.name(), event.name(), ctx.connection_id);
        handler.handle(ctx, event).await
    }
}
