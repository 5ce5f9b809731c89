use async_trait::async_trait;
use tracing::debug;

use crate::context::SessionContext;
use crate::handler::EventHandler;
use crate::protocol::ClientEvent;
use crate::service::{CallOffer, CallSignalingService};
use crate::Result;

/// WebRTC 信令处理器
pub struct CallHandler {
    calls: CallSignalingService,
}

impl CallHandler {
    pub fn new(calls: CallSignalingService) -> Self {
        Self { calls }
    }
}

#[async_trait]
impl EventHandler for CallHandler {
    async fn handle(&self, ctx: &mut SessionContext, event: ClientEvent) -> Result<()> {
        // 未注册的连接不参与信令
        let user_id = ctx.require_user()?;

        match event {
            ClientEvent::WebrtcOffer {
                callee_id,
                offer,
                call_type,
                caller,
            } => {
                self.calls
                    .offer(CallOffer {
                        origin: ctx.connection_id,
                        caller_id: user_id,
                        callee_id,
                        call_type,
                        offer,
                        caller,
                    })
                    .await;
            }
            ClientEvent::WebrtcAnswer {
                caller_id,
                answer,
                call_id,
            } => {
                if !self.calls.answer(call_id, user_id, answer).await {
                    debug!("通话 {} 的 answer 未转发 (声明的主叫 {})", call_id, caller_id);
                }
            }
            ClientEvent::WebrtcIceCandidate {
                target_user_id,
                candidate,
            } => {
                if candidate.is_null() {
                    return Ok(());
                }
                self.calls.ice_candidate(user_id, target_user_id, candidate);
            }
            ClientEvent::WebrtcCallEnd {
                target_user_id,
                call_id,
            } => self.calls.end(call_id, user_id, target_user_id),
            ClientEvent::WebrtcCallDeclined { caller_id, call_id } => {
                self.calls.declined(call_id, user_id, caller_id)
            }
            ClientEvent::WebrtcMediaState {
                target_user_id,
                camera_on,
                mic_on,
            } => self
                .calls
                .media_state(user_id, target_user_id, camera_on, mic_on),
            ClientEvent::CheckUserOnline { callee_id } => {
                self.calls.check_user_online(ctx.connection_id, callee_id).await;
            }
            other => debug!("CallHandler 忽略事件 {}", other.name()),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "CallHandler"
    }
}
