//! 通话信令中继
//!
//! offer / answer / ICE 在主叫和被叫的个人频道之间转发，同时维护通话记录。
//! 转发是延迟敏感的，answer / end / declined 的数据库写入一律在后台任务里完成，
//! 失败只记日志，不回滚已经转发出去的信令。
//!
//! 每个进行中的通话有一个振铃看门狗：超时未接通则按结束处理；接通或结束时取消。
//! 结束的通话以 `Ended` 阶段在内存里再保留一分钟，迟到的 answer 不会绕到持久化记录上。

use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::error::Result;
use crate::infra::{metrics, snowflake, Channel, EventEmitter};
use crate::model::{
    now_millis, CallHistoryEntry, CallId, CallPhase, CallRecord, CallRole, CallState, CallType,
    ConnectionId, EndReason, UserId,
};
use crate::protocol::ServerEvent;
use crate::repository::CallRepository;
use crate::service::PresenceService;

/// 已结束通话在内存中的保留时长
const ENDED_CALL_RETENTION: Duration = Duration::from_secs(60);

/// 进程内的通话状态
struct LiveCall {
    caller_id: UserId,
    callee_id: UserId,
    phase: CallPhase,
    watchdog: Option<JoinHandle<()>>,
}

impl LiveCall {
    fn role_of(&self, user_id: UserId) -> Option<CallRole> {
        if user_id == self.caller_id {
            Some(CallRole::Caller)
        } else if user_id == self.callee_id {
            Some(CallRole::Callee)
        } else {
            None
        }
    }

    fn cancel_watchdog(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

/// 发起通话的参数
#[derive(Debug, Clone)]
pub struct CallOffer {
    /// 发起 offer 的连接，call_id / callee_status 回复给它
    pub origin: ConnectionId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallType,
    pub offer: Value,
    /// 主叫展示信息，原样转发
    pub caller: Value,
}

#[derive(Clone)]
pub struct CallSignalingService {
    calls: Arc<dyn CallRepository>,
    presence: Arc<PresenceService>,
    emitter: Arc<dyn EventEmitter>,
    live: Arc<DashMap<CallId, LiveCall>>,
    ring_timeout: Duration,
}

impl CallSignalingService {
    pub fn new(
        config: &CallConfig,
        calls: Arc<dyn CallRepository>,
        presence: Arc<PresenceService>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        info!("📞 CallSignalingService initialized (ring_timeout={}s)", config.ring_timeout_secs);
        Self {
            calls,
            presence,
            emitter,
            live: Arc::new(DashMap::new()),
            ring_timeout: config.ring_timeout(),
        }
    }

    /// 发起通话；返回新通话ID。自呼叫返回 None
    pub async fn offer(&self, request: CallOffer) -> Option<CallId> {
        if request.caller_id == request.callee_id {
            warn!("⚠️ 用户 {} 尝试呼叫自己，已忽略", request.caller_id);
            return None;
        }

        let call_id = match snowflake::next_call_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("⚠️ 生成通话ID失败: {}", e);
                return None;
            }
        };
        let record = CallRecord::new(
            call_id,
            request.caller_id,
            request.callee_id,
            request.call_type,
            now_millis(),
        );
        if let Err(e) = self.calls.create(&record).await {
            warn!("⚠️ 通话记录 {} 创建失败，信令继续: {}", call_id, e);
        }

        let watchdog = self.spawn_watchdog(call_id);
        self.live.insert(
            call_id,
            LiveCall {
                caller_id: request.caller_id,
                callee_id: request.callee_id,
                phase: CallPhase::Initiated,
                watchdog: Some(watchdog),
            },
        );
        metrics::record_call("started");

        let delivered = self.emitter.emit(
            &[Channel::User(request.callee_id)],
            ServerEvent::WebrtcOffer {
                call_id,
                from_user_id: request.caller_id,
                caller: request.caller,
                offer: request.offer,
                call_type: request.call_type,
            },
        );
        self.emitter
            .send_to(request.origin, ServerEvent::CallId { call_id });
        info!(
            "📞 通话 {} 发起: {} -> {} ({}, offer 送达 {} 个连接)",
            call_id,
            request.caller_id,
            request.callee_id,
            request.call_type.as_str(),
            delivered
        );

        // 被叫在线状态只用于主叫 UI 提示
        let online = self.presence.is_online(request.callee_id).await;
        if online {
            if let Some(mut call) = self.live.get_mut(&call_id) {
                if call.phase == CallPhase::Initiated {
                    call.phase = CallPhase::Ringing;
                }
            }
        }
        self.emitter.send_to(
            request.origin,
            ServerEvent::CalleeStatus {
                callee_id: request.callee_id,
                online,
            },
        );

        Some(call_id)
    }

    /// 被叫接听；只有振铃中的通话会被接通并转发
    pub async fn answer(&self, call_id: CallId, answerer: UserId, answer: Value) -> bool {
        let connected_at = now_millis();
        let local = self.live.get_mut(&call_id).map(|mut call| {
            if call.callee_id != answerer || !call.phase.accepts_answer() {
                debug!("通话 {} 忽略来自 {} 的 answer (phase={:?})", call_id, answerer, call.phase);
                return None;
            }
            call.phase = CallPhase::Connected { connected_at };
            call.cancel_watchdog();
            Some(call.caller_id)
        });
        let caller_id = match local {
            Some(Some(caller_id)) => caller_id,
            Some(None) => return false,
            None => match self.recover_caller(call_id, answerer).await {
                Some(caller_id) => caller_id,
                None => return false,
            },
        };

        self.emitter.emit(
            &[Channel::User(caller_id)],
            ServerEvent::WebrtcAnswer {
                call_id,
                from_user_id: answerer,
                answer,
            },
        );
        metrics::record_call("connected");
        info!("✅ 通话 {} 已接通", call_id);

        let calls = Arc::clone(&self.calls);
        self.persist("mark_connected", call_id, async move {
            if !calls.mark_connected(call_id, connected_at).await? {
                debug!("通话 {} 接通时间未写入（已结束或已接通）", call_id);
            }
            Ok(())
        });
        true
    }

    /// 通话不在本进程（重启或多实例）时以持久化记录为准
    async fn recover_caller(&self, call_id: CallId, answerer: UserId) -> Option<UserId> {
        match self.calls.find_by_id(call_id).await {
            Ok(Some(record))
                if record.callee_id == answerer
                    && record.connected_at.is_none()
                    && record.ended_at.is_none() =>
            {
                Some(record.caller_id)
            }
            Ok(_) => {
                debug!("通话 {} 已结束或不存在，丢弃迟到的 answer", call_id);
                None
            }
            Err(e) => {
                warn!("⚠️ 查询通话 {} 失败，丢弃 answer: {}", call_id, e);
                None
            }
        }
    }

    /// ICE 候选，纯转发
    pub fn ice_candidate(&self, from: UserId, target: UserId, candidate: Value) {
        let delivered = self.emitter.emit(
            &[Channel::User(target)],
            ServerEvent::WebrtcIceCandidate {
                from_user_id: from,
                candidate,
            },
        );
        if delivered == 0 {
            debug!("ICE candidate 目标 {} 不在线，丢弃", target);
        }
    }

    /// 挂断
    pub fn end(&self, call_id: Option<CallId>, from: UserId, target: UserId) {
        if let Some(call_id) = call_id {
            if !self.finish(call_id, from, EndReason::Hangup) {
                return;
            }
        }
        let delivered = self.emitter.emit(
            &[Channel::User(target)],
            ServerEvent::WebrtcCallEnd {
                call_id,
                from_user_id: Some(from),
                reason: EndReason::Hangup,
            },
        );
        if delivered == 0 {
            debug!("挂断通知目标 {} 不在线", target);
        }
    }

    /// 被叫拒接
    pub fn declined(&self, call_id: Option<CallId>, from: UserId, caller: UserId) {
        if let Some(call_id) = call_id {
            if !self.finish(call_id, from, EndReason::Declined) {
                return;
            }
        }
        self.emitter.emit(
            &[Channel::User(caller)],
            ServerEvent::WebrtcCallDeclined {
                call_id,
                from_user_id: from,
            },
        );
    }

    /// 摄像头 / 麦克风状态，纯转发
    pub fn media_state(&self, from: UserId, target: UserId, camera_on: bool, mic_on: bool) {
        self.emitter.emit(
            &[Channel::User(target)],
            ServerEvent::WebrtcMediaState {
                from_user_id: from,
                camera_on,
                mic_on,
            },
        );
    }

    /// 回复被叫是否在线
    pub async fn check_user_online(&self, origin: ConnectionId, callee_id: UserId) -> bool {
        let online = self.presence.is_online(callee_id).await;
        self.emitter
            .send_to(origin, ServerEvent::CalleeStatus { callee_id, online });
        online
    }

    /// 服务端视角的通话阶段；不在内存中返回 None
    pub fn phase(&self, call_id: CallId) -> Option<CallPhase> {
        self.live.get(&call_id).map(|call| call.phase)
    }

    /// 某一方看到的通话状态
    pub fn state_for(&self, call_id: CallId, user_id: UserId) -> CallState {
        self.live
            .get(&call_id)
            .and_then(|call| call.role_of(user_id).map(|role| call.phase.view_for(role)))
            .unwrap_or(CallState::Idle)
    }

    /// 尚未结束的通话数
    pub fn live_calls(&self) -> usize {
        self.live.iter().filter(|call| !call.phase.is_ended()).count()
    }

    /// 通话历史，按开始时间倒序
    pub async fn history(&self, user_id: UserId, limit: usize) -> Result<Vec<CallHistoryEntry>> {
        let records = self.calls.list_for_user(user_id, limit).await?;
        Ok(records
            .iter()
            .filter_map(|record| record.history_entry(user_id))
            .collect())
    }

    /// 用户最后一个连接断开：结束其参与的所有通话并通知对方
    pub fn end_calls_for(&self, user_id: UserId) -> usize {
        let affected: Vec<(CallId, UserId)> = self
            .live
            .iter()
            .filter(|call| !call.phase.is_ended())
            .filter_map(|call| match call.role_of(user_id)? {
                CallRole::Caller => Some((*call.key(), call.callee_id)),
                CallRole::Callee => Some((*call.key(), call.caller_id)),
            })
            .collect();

        let mut ended = 0;
        for (call_id, peer) in affected {
            if !self.finish(call_id, user_id, EndReason::Hangup) {
                continue;
            }
            self.emitter.emit(
                &[Channel::User(peer)],
                ServerEvent::WebrtcCallEnd {
                    call_id: Some(call_id),
                    from_user_id: Some(user_id),
                    reason: EndReason::Hangup,
                },
            );
            ended += 1;
        }
        if ended > 0 {
            info!("📴 用户 {} 已离线，结束 {} 个通话", user_id, ended);
        }
        ended
    }

    /// 结束进行中的通话并在后台写入结束时间。
    /// 通话不在本进程时照常写入（条件更新保证幂等）；`from` 不是参与方或通话已结束时拒绝
    fn finish(&self, call_id: CallId, from: UserId, reason: EndReason) -> bool {
        let mut connected_at = None;
        if let Some(mut call) = self.live.get_mut(&call_id) {
            if call.role_of(from).is_none() {
                warn!("⚠️ 用户 {} 不是通话 {} 的参与方，忽略结束请求", from, call_id);
                return false;
            }
            if call.phase.is_ended() {
                debug!("通话 {} 已结束，忽略重复的结束请求", call_id);
                return false;
            }
            call.cancel_watchdog();
            connected_at = call.phase.connected_at();
            call.phase = CallPhase::Ended { reason };
            drop(call);
            self.spawn_tombstone_cleanup(call_id);
        }
        metrics::record_call(match reason {
            EndReason::Hangup => "hangup",
            EndReason::Declined => "declined",
            EndReason::Timeout => "timeout",
        });
        info!("📴 通话 {} 结束 ({:?}, by {})", call_id, reason, from);
        self.persist_end(call_id, connected_at);
        true
    }

    /// 接通时间随结束写入一起带上，接通写入落后于结束写入时不会丢失
    fn persist_end(&self, call_id: CallId, connected_at: Option<i64>) {
        let ended_at = now_millis();
        let calls = Arc::clone(&self.calls);
        self.persist("mark_ended", call_id, async move {
            if let Some(record) = calls.mark_ended(call_id, ended_at, connected_at).await? {
                debug!("通话 {} 记录已结束, duration={}s", call_id, record.duration);
            }
            Ok(())
        });
    }

    /// 后台执行持久化，失败只记录
    fn persist<F>(&self, op: &'static str, call_id: CallId, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                warn!("⚠️ 通话 {} {} 持久化失败（信令已转发）: {}", call_id, op, e);
            }
        });
    }

    /// 已结束的通话保留一段时间，期间迟到的 answer 在本地就被拒绝
    fn spawn_tombstone_cleanup(&self, call_id: CallId) {
        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            tokio::time::sleep(ENDED_CALL_RETENTION).await;
            live.remove_if(&call_id, |_, call| call.phase.is_ended());
        });
    }

    fn spawn_watchdog(&self, call_id: CallId) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.ring_timeout).await;
            this.expire(call_id);
        })
    }

    /// 振铃超时：未接通的通话按结束处理，通知双方
    fn expire(&self, call_id: CallId) {
        let (caller_id, callee_id) = match self.live.get_mut(&call_id) {
            Some(mut call) if call.phase.accepts_answer() => {
                // 看门狗自己在执行，不能 abort
                call.watchdog = None;
                call.phase = CallPhase::Ended {
                    reason: EndReason::Timeout,
                };
                (call.caller_id, call.callee_id)
            }
            _ => return,
        };
        self.spawn_tombstone_cleanup(call_id);

        metrics::record_call("timeout");
        info!("⏰ 通话 {} 振铃超时 ({} -> {})", call_id, caller_id, callee_id);
        self.emitter.emit(
            &[Channel::User(caller_id), Channel::User(callee_id)],
            ServerEvent::WebrtcCallEnd {
                call_id: Some(call_id),
                from_user_id: None,
                reason: EndReason::Timeout,
            },
        );
        self.persist_end(call_id, None);
    }
}
