//! 端到端投递流程：通过 EventDispatcher 驱动两个客户端，检查推送的事件和持久化状态

use std::sync::Arc;

use privchat_realtime::infra::EventReceiver;
use privchat_realtime::{
    ClientEvent, ConversationId, MessageId, MessageStatus, PresenceStatus, RealtimeServices,
    ServerConfig, ServerError, ServerEvent, SessionContext, UserId,
};

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

/// 一条模拟的 WebSocket 连接
struct TestClient {
    services: Arc<RealtimeServices>,
    ctx: SessionContext,
    rx: EventReceiver,
}

impl TestClient {
    fn connect(services: &Arc<RealtimeServices>) -> Self {
        let (connection_id, rx) = services.hub.connect();
        Self {
            services: services.clone(),
            ctx: SessionContext::new(connection_id, None),
            rx,
        }
    }

    async fn send(&mut self, event: ClientEvent) -> Result<(), ServerError> {
        self.services.dispatcher.dispatch(&mut self.ctx, event).await
    }

    async fn register(services: &Arc<RealtimeServices>, user_id: UserId) -> Self {
        let mut client = Self::connect(services);
        client.send(ClientEvent::RegisterUser { user_id }).await.unwrap();
        client
    }

    async fn join(&mut self, chat_id: ConversationId) {
        self.send(ClientEvent::JoinChat { chat_id, user_id: None })
            .await
            .unwrap();
    }

    async fn say(&mut self, conversation_id: ConversationId, text: &str, client_id: Option<&str>) {
        self.send(ClientEvent::SendMessage {
            conversation_id,
            content: Some(text.to_string()),
            media: Vec::new(),
            client_id: client_id.map(str::to_string),
        })
        .await
        .unwrap();
    }

    async fn disconnect(self) {
        self.services.dispatcher.session().on_disconnect(&self.ctx).await;
    }

    /// 取出队列里已有的全部事件
    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

fn status_updates(events: &[ServerEvent]) -> Vec<(Vec<MessageId>, MessageStatus)> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::MessageStatusUpdate {
                message_ids, status, ..
            } => Some((message_ids.clone(), *status)),
            _ => None,
        })
        .collect()
}

fn received(events: &[ServerEvent]) -> Vec<(MessageId, MessageStatus)> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::ReceiveMessage(message) => Some((message.id, message.status)),
            _ => None,
        })
        .collect()
}

fn last_unread(events: &[ServerEvent]) -> Option<u32> {
    events.iter().rev().find_map(|event| match event {
        ServerEvent::ConversationUpdate { unread_count, .. } => Some(*unread_count),
        _ => None,
    })
}

async fn setup() -> (Arc<RealtimeServices>, ConversationId) {
    let services = RealtimeServices::in_memory(ServerConfig::default());
    let conversation = services
        .conversations
        .find_or_create_between(ALICE, BOB)
        .await
        .unwrap();
    (services, conversation.id)
}

async fn unread(services: &RealtimeServices, conversation_id: ConversationId, user_id: UserId) -> u32 {
    services
        .conversations
        .find_by_id(conversation_id)
        .await
        .unwrap()
        .unwrap()
        .unread_for(user_id)
}

#[tokio::test]
async fn test_offline_receiver_catches_up_in_two_batches() {
    let (services, chat) = setup().await;
    let mut alice = TestClient::register(&services, ALICE).await;
    alice.join(chat).await;
    alice.drain();

    for i in 0..3 {
        alice.say(chat, &format!("msg {}", i), None).await;
    }
    let events = alice.drain();
    let sent = received(&events);
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|(_, status)| *status == MessageStatus::Sent));
    assert_eq!(last_unread(&events), Some(0));
    assert_eq!(unread(&services, chat, BOB).await, 3);
    assert_eq!(unread(&services, chat, ALICE).await, 0);

    let ids: Vec<MessageId> = sent.iter().map(|(id, _)| *id).collect();

    // Bob 上线：一条 delivered 批量事件
    let mut bob = TestClient::register(&services, BOB).await;
    let updates = status_updates(&alice.drain());
    assert_eq!(updates, vec![(ids.clone(), MessageStatus::Delivered)]);

    // Bob 进入会话：一条 read 批量事件，未读清零
    bob.join(chat).await;
    let updates = status_updates(&alice.drain());
    assert_eq!(updates, vec![(ids.clone(), MessageStatus::Read)]);
    assert_eq!(last_unread(&bob.drain()), Some(0));
    assert_eq!(unread(&services, chat, BOB).await, 0);

    for id in ids {
        let message = services.messages.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Read);
    }
}

#[tokio::test]
async fn test_receiver_in_room_reads_immediately() {
    let (services, chat) = setup().await;
    let mut alice = TestClient::register(&services, ALICE).await;
    let mut bob = TestClient::register(&services, BOB).await;
    bob.join(chat).await;
    bob.drain();

    alice.say(chat, "hi", None).await;
    let bob_events = bob.drain();
    assert_eq!(received(&bob_events).len(), 1);
    assert_eq!(received(&bob_events)[0].1, MessageStatus::Read);
    assert_eq!(last_unread(&bob_events), Some(0));
    assert_eq!(unread(&services, chat, BOB).await, 0);

    // 在线但不在会话里：delivered，未读加一
    bob.send(ClientEvent::LeaveChat { chat_id: chat, user_id: None })
        .await
        .unwrap();
    alice.drain();
    alice.say(chat, "still there?", None).await;
    assert_eq!(received(&alice.drain())[0].1, MessageStatus::Delivered);
    assert_eq!(unread(&services, chat, BOB).await, 1);
}

#[tokio::test]
async fn test_client_id_replay_does_not_duplicate() {
    let (services, chat) = setup().await;
    let mut alice = TestClient::register(&services, ALICE).await;
    alice.drain();

    alice.say(chat, "once", Some("retry-1")).await;
    alice.say(chat, "once", Some("retry-1")).await;

    let events = alice.drain();
    let sent = received(&events);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, sent[1].0);
    assert_eq!(unread(&services, chat, BOB).await, 1);

    let page = services
        .delivery
        .history(chat, ALICE, Default::default())
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
}

#[tokio::test]
async fn test_status_never_regresses() {
    let (services, chat) = setup().await;
    let mut alice = TestClient::register(&services, ALICE).await;
    let mut bob = TestClient::register(&services, BOB).await;
    bob.join(chat).await;

    alice.say(chat, "read on arrival", None).await;
    let (id, status) = received(&alice.drain())[0];
    assert_eq!(status, MessageStatus::Read);

    // 迟到的 delivered 被丢弃，不推送
    assert!(services.delivery.advance(id, MessageStatus::Delivered).await.unwrap().is_none());
    assert!(status_updates(&alice.drain()).is_empty());
    let message = services.messages.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(message.status, MessageStatus::Read);
}

#[tokio::test]
async fn test_unregistered_and_outsider_are_rejected() {
    let (services, chat) = setup().await;
    let mut anonymous = TestClient::connect(&services);
    let result = anonymous
        .send(ClientEvent::SendMessage {
            conversation_id: chat,
            content: Some("hi".into()),
            media: Vec::new(),
            client_id: None,
        })
        .await;
    assert!(matches!(result, Err(ServerError::Unauthorized(_))));

    let mut mallory = TestClient::register(&services, UserId(99)).await;
    let result = mallory
        .send(ClientEvent::JoinChat { chat_id: chat, user_id: None })
        .await;
    assert!(matches!(result, Err(ServerError::Forbidden(_))));
    assert!(!mallory.ctx.has_joined(chat));
}

#[tokio::test]
async fn test_presence_goes_offline_after_last_connection() {
    let (services, chat) = setup().await;
    let mut alice = TestClient::register(&services, ALICE).await;
    alice.drain();

    let phone = TestClient::register(&services, BOB).await;
    let mut laptop = TestClient::register(&services, BOB).await;
    laptop.join(chat).await;
    assert!(services.presence.get(BOB).await.is_viewing(chat));

    // 第一个连接断开：仍在线
    phone.disconnect().await;
    assert!(services.presence.is_online(BOB).await);

    // 最后一个连接断开：离线，伙伴收到一次 offline
    alice.drain();
    laptop.disconnect().await;
    assert!(!services.presence.is_online(BOB).await);
    let offline: Vec<_> = alice
        .drain()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                ServerEvent::PresenceUpdate {
                    user_id: BOB,
                    status: PresenceStatus::Offline,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(offline.len(), 1);
}

#[tokio::test]
async fn test_typing_reaches_only_the_other_member() {
    let (services, chat) = setup().await;
    let mut alice = TestClient::register(&services, ALICE).await;
    let mut bob = TestClient::register(&services, BOB).await;
    alice.join(chat).await;
    bob.join(chat).await;
    alice.drain();
    bob.drain();

    alice.send(ClientEvent::TypingStart { chat_id: chat }).await.unwrap();
    assert!(alice.drain().is_empty());
    assert_eq!(
        bob.drain(),
        vec![ServerEvent::UserTypingStart {
            chat_id: chat,
            user_id: ALICE,
        }]
    );
}

#[tokio::test]
async fn test_leaving_on_one_device_keeps_chat_open_on_another() {
    let (services, chat) = setup().await;
    let mut alice = TestClient::register(&services, ALICE).await;
    let mut phone = TestClient::register(&services, BOB).await;
    let mut laptop = TestClient::register(&services, BOB).await;
    phone.join(chat).await;
    laptop.join(chat).await;

    phone
        .send(ClientEvent::LeaveChat { chat_id: chat, user_id: None })
        .await
        .unwrap();
    assert!(services.presence.get(BOB).await.is_viewing(chat));

    // 笔记本还开着会话：新消息直接已读
    alice.drain();
    alice.say(chat, "seen on laptop", None).await;
    assert_eq!(received(&alice.drain())[0].1, MessageStatus::Read);
    assert_eq!(unread(&services, chat, BOB).await, 0);

    // 手机断开也不影响
    phone.disconnect().await;
    assert!(services.presence.get(BOB).await.is_viewing(chat));

    laptop
        .send(ClientEvent::LeaveChat { chat_id: chat, user_id: None })
        .await
        .unwrap();
    assert!(!services.presence.get(BOB).await.is_viewing(chat));
}

#[tokio::test(start_paused = true)]
async fn test_expired_presence_restores_latest_chat() {
    let (services, chat) = setup().await;
    let other = services
        .conversations
        .find_or_create_between(BOB, UserId(3))
        .await
        .unwrap()
        .id;
    let mut bob = TestClient::register(&services, BOB).await;
    bob.join(chat).await;
    bob.join(other).await;

    tokio::time::sleep(std::time::Duration::from_secs(61)).await;
    assert!(!services.presence.is_online(BOB).await);

    services.dispatcher.session().heartbeat(&bob.ctx).await;
    let record = services.presence.get(BOB).await;
    assert!(record.is_viewing(other));
}
