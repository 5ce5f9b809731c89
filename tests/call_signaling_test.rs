//! 通话信令：通过 EventDispatcher 驱动主叫和被叫，检查转发和通话记录

use std::sync::Arc;
use std::time::Duration;

use privchat_realtime::infra::EventReceiver;
use privchat_realtime::{
    CallId, CallPhase, CallType, ClientEvent, EndReason, RealtimeServices, ServerConfig,
    ServerEvent, SessionContext, UserId,
};
use serde_json::json;

const CALLER: UserId = UserId(10);
const CALLEE: UserId = UserId(20);

struct TestClient {
    services: Arc<RealtimeServices>,
    ctx: SessionContext,
    rx: EventReceiver,
}

impl TestClient {
    async fn register(services: &Arc<RealtimeServices>, user_id: UserId) -> Self {
        let (connection_id, rx) = services.hub.connect();
        let mut client = Self {
            services: services.clone(),
            ctx: SessionContext::new(connection_id, None),
            rx,
        };
        client.send(ClientEvent::RegisterUser { user_id }).await;
        client.drain();
        client
    }

    async fn send(&mut self, event: ClientEvent) {
        self.services
            .dispatcher
            .dispatch(&mut self.ctx, event)
            .await
            .unwrap();
    }

    async fn disconnect(self) {
        self.services.dispatcher.session().on_disconnect(&self.ctx).await;
    }

    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn call(&mut self, callee_id: UserId) -> CallId {
        self.send(ClientEvent::WebrtcOffer {
            callee_id,
            offer: json!({"type": "offer", "sdp": "v=0"}),
            call_type: CallType::Audio,
            caller: json!({"name": "caller"}),
        })
        .await;
        self.drain()
            .into_iter()
            .find_map(|event| match event {
                ServerEvent::CallId { call_id } => Some(call_id),
                _ => None,
            })
            .expect("call_id reply")
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_offer_answer_hangup() {
    let services = RealtimeServices::in_memory(ServerConfig::default());
    let mut caller = TestClient::register(&services, CALLER).await;
    let mut callee = TestClient::register(&services, CALLEE).await;

    caller
        .send(ClientEvent::WebrtcOffer {
            callee_id: CALLEE,
            offer: json!({"type": "offer", "sdp": "v=0"}),
            call_type: CallType::Video,
            caller: json!({"name": "caller"}),
        })
        .await;
    let replies = caller.drain();
    let call_id = match replies.first() {
        Some(ServerEvent::CallId { call_id }) => *call_id,
        other => panic!("expected call_id first, got {:?}", other),
    };
    assert_eq!(
        replies.get(1),
        Some(&ServerEvent::CalleeStatus {
            callee_id: CALLEE,
            online: true,
        })
    );
    assert!(matches!(
        callee.drain().as_slice(),
        [ServerEvent::WebrtcOffer { from_user_id: CALLER, call_type: CallType::Video, .. }]
    ));

    callee
        .send(ClientEvent::WebrtcAnswer {
            caller_id: CALLER,
            answer: json!({"type": "answer"}),
            call_id,
        })
        .await;
    assert_eq!(
        caller.drain(),
        vec![ServerEvent::WebrtcAnswer {
            call_id,
            from_user_id: CALLEE,
            answer: json!({"type": "answer"}),
        }]
    );

    // ICE 候选原样转发，null 候选被忽略
    caller
        .send(ClientEvent::WebrtcIceCandidate {
            target_user_id: CALLEE,
            candidate: json!({"candidate": "candidate:1"}),
        })
        .await;
    caller
        .send(ClientEvent::WebrtcIceCandidate {
            target_user_id: CALLEE,
            candidate: serde_json::Value::Null,
        })
        .await;
    assert_eq!(
        callee.drain(),
        vec![ServerEvent::WebrtcIceCandidate {
            from_user_id: CALLER,
            candidate: json!({"candidate": "candidate:1"}),
        }]
    );

    callee
        .send(ClientEvent::WebrtcCallEnd {
            target_user_id: CALLER,
            call_id: Some(call_id),
        })
        .await;
    assert!(matches!(
        caller.drain().as_slice(),
        [ServerEvent::WebrtcCallEnd { from_user_id: Some(CALLEE), reason: EndReason::Hangup, .. }]
    ));
    assert_eq!(services.calls.live_calls(), 0);

    settle().await;
    let record = services.call_records.find_by_id(call_id).await.unwrap().unwrap();
    assert!(record.connected_at.is_some());
    assert!(record.ended_at.is_some());
}

#[tokio::test]
async fn test_check_user_online_replies_to_origin_only() {
    let services = RealtimeServices::in_memory(ServerConfig::default());
    let mut phone = TestClient::register(&services, CALLER).await;
    let mut laptop = TestClient::register(&services, CALLER).await;

    phone.send(ClientEvent::CheckUserOnline { callee_id: CALLEE }).await;
    assert_eq!(
        phone.drain(),
        vec![ServerEvent::CalleeStatus {
            callee_id: CALLEE,
            online: false,
        }]
    );
    assert!(laptop.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_offline_callee_times_out_and_late_answer_is_dropped() {
    let services = RealtimeServices::in_memory(ServerConfig::default());
    let mut caller = TestClient::register(&services, CALLER).await;

    caller
        .send(ClientEvent::WebrtcOffer {
            callee_id: CALLEE,
            offer: json!({"type": "offer"}),
            call_type: CallType::Audio,
            caller: json!({}),
        })
        .await;
    let replies = caller.drain();
    let call_id = match replies.first() {
        Some(ServerEvent::CallId { call_id }) => *call_id,
        other => panic!("expected call_id first, got {:?}", other),
    };
    assert!(replies.contains(&ServerEvent::CalleeStatus {
        callee_id: CALLEE,
        online: false,
    }));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(
        caller.drain(),
        vec![ServerEvent::WebrtcCallEnd {
            call_id: Some(call_id),
            from_user_id: None,
            reason: EndReason::Timeout,
        }]
    );

    // 被叫迟到上线并接听：主叫收不到 answer，记录不产生接通时间
    let mut callee = TestClient::register(&services, CALLEE).await;
    callee
        .send(ClientEvent::WebrtcAnswer {
            caller_id: CALLER,
            answer: json!({"type": "answer"}),
            call_id,
        })
        .await;
    settle().await;
    assert!(!caller
        .drain()
        .iter()
        .any(|event| matches!(event, ServerEvent::WebrtcAnswer { .. })));

    let record = services.call_records.find_by_id(call_id).await.unwrap().unwrap();
    assert!(record.connected_at.is_none());
    assert!(record.ended_at.is_some());
    assert_eq!(record.duration, 0);

    let history = services.calls.history(CALLER, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].call_id, call_id);
}

#[tokio::test]
async fn test_declined_call_is_forwarded_to_caller() {
    let services = RealtimeServices::in_memory(ServerConfig::default());
    let mut caller = TestClient::register(&services, CALLER).await;
    let mut callee = TestClient::register(&services, CALLEE).await;

    let call_id = caller.call(CALLEE).await;
    callee.drain();
    callee
        .send(ClientEvent::WebrtcCallDeclined {
            caller_id: CALLER,
            call_id: Some(call_id),
        })
        .await;
    assert_eq!(
        caller.drain(),
        vec![ServerEvent::WebrtcCallDeclined {
            call_id: Some(call_id),
            from_user_id: CALLEE,
        }]
    );
    assert_eq!(
        services.calls.phase(call_id),
        Some(CallPhase::Ended {
            reason: EndReason::Declined
        })
    );

    // 拒接之后迟到的接听不会转发给主叫
    callee
        .send(ClientEvent::WebrtcAnswer {
            caller_id: CALLER,
            answer: json!({"type": "answer"}),
            call_id,
        })
        .await;
    assert!(caller.drain().is_empty());
    settle().await;
    let record = services.call_records.find_by_id(call_id).await.unwrap().unwrap();
    assert!(record.connected_at.is_none());
}

#[tokio::test]
async fn test_connected_call_ends_when_party_goes_offline() {
    let services = RealtimeServices::in_memory(ServerConfig::default());
    let mut caller = TestClient::register(&services, CALLER).await;
    let mut callee = TestClient::register(&services, CALLEE).await;

    let call_id = caller.call(CALLEE).await;
    callee.drain();
    callee
        .send(ClientEvent::WebrtcAnswer {
            caller_id: CALLER,
            answer: json!({"type": "answer"}),
            call_id,
        })
        .await;
    caller.drain();
    assert_eq!(services.calls.live_calls(), 1);

    // 主叫关掉页面，没有发 webrtc_call_end
    caller.disconnect().await;
    assert!(matches!(
        callee.drain().as_slice(),
        [ServerEvent::WebrtcCallEnd { from_user_id: Some(CALLER), reason: EndReason::Hangup, .. }]
    ));
    assert_eq!(services.calls.live_calls(), 0);

    callee.disconnect().await;
    settle().await;
    let record = services.call_records.find_by_id(call_id).await.unwrap().unwrap();
    assert!(record.connected_at.is_some());
    assert!(record.ended_at.is_some());
}

#[tokio::test]
async fn test_call_survives_while_another_device_is_online() {
    let services = RealtimeServices::in_memory(ServerConfig::default());
    let mut caller = TestClient::register(&services, CALLER).await;
    let spare = TestClient::register(&services, CALLER).await;
    let mut callee = TestClient::register(&services, CALLEE).await;

    let call_id = caller.call(CALLEE).await;
    callee.drain();
    spare.disconnect().await;
    assert!(callee.drain().is_empty());
    assert!(services.calls.phase(call_id).map_or(false, |phase| !phase.is_ended()));
}
