use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::context::SessionContext;
use crate::handler::EventHandler;
use crate::protocol::ClientEvent;
use crate::service::{DeliveryService, SendMessageRequest};
use crate::Result;

/// 发送消息处理器
pub struct MessageHandler {
    delivery: Arc<DeliveryService>,
}

impl MessageHandler {
    pub fn new(delivery: Arc<DeliveryService>) -> Self {
        Self { delivery }
    }
}

#[async_trait]
impl EventHandler for MessageHandler {
    async fn handle(&self, ctx: &mut SessionContext, event: ClientEvent) -> Result<()> {
        let name = event.name();
        let ClientEvent::SendMessage {
            conversation_id,
            content,
            media,
            client_id,
        } = event
        else {
            debug!("MessageHandler 忽略事件 {}", name);
            return Ok(());
        };

        let sender_id = ctx.require_user()?;
        self.delivery
            .send_message(SendMessageRequest {
                conversation_id,
                sender_id,
                content,
                media,
                client_id,
            })
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MessageHandler"
    }
}
