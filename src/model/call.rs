use serde::{Deserialize, Serialize};

use super::{CallId, UserId};

/// 通话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "audio" => Some(CallType::Audio),
            "video" => Some(CallType::Video),
            _ => None,
        }
    }
}

/// 通话结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    Declined,
    Timeout,
}

/// 服务端视角的通话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// 已发起，被叫尚未收到（不在线）
    Initiated,
    /// 被叫在线，振铃中
    Ringing,
    Connected { connected_at: i64 },
    Ended { reason: EndReason },
}

impl CallPhase {
    /// 是否还能接受 answer
    pub fn accepts_answer(&self) -> bool {
        matches!(self, CallPhase::Initiated | CallPhase::Ringing)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, CallPhase::Ended { .. })
    }

    pub fn connected_at(&self) -> Option<i64> {
        match self {
            CallPhase::Connected { connected_at } => Some(*connected_at),
            _ => None,
        }
    }

    /// 某一方看到的状态
    pub fn view_for(&self, role: CallRole) -> CallState {
        match (self, role) {
            (CallPhase::Initiated, CallRole::Caller) => CallState::Calling,
            (CallPhase::Ringing, CallRole::Caller) => CallState::Ringing,
            (CallPhase::Initiated | CallPhase::Ringing, CallRole::Callee) => CallState::Incoming,
            (CallPhase::Connected { .. }, _) => CallState::Connected,
            (CallPhase::Ended { .. }, _) => CallState::Ended,
        }
    }
}

/// 通话参与方角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// 客户端通话状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Calling,
    Incoming,
    Ringing,
    Connected,
    Ended,
}

/// 持久化的通话记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallType,
    /// 毫秒时间戳
    pub created_at: i64,
    pub connected_at: Option<i64>,
    pub ended_at: Option<i64>,
    /// 通话时长（秒）
    pub duration: u64,
}

impl CallRecord {
    pub fn new(call_id: CallId, caller_id: UserId, callee_id: UserId, call_type: CallType, created_at: i64) -> Self {
        Self {
            call_id,
            caller_id,
            callee_id,
            call_type,
            created_at,
            connected_at: None,
            ended_at: None,
            duration: 0,
        }
    }

    /// 时长只从接通时刻算起；未接通为 0
    pub fn compute_duration(connected_at: Option<i64>, ended_at: Option<i64>) -> u64 {
        match (connected_at, ended_at) {
            (Some(connected), Some(ended)) if ended > connected => ((ended - connected) / 1000) as u64,
            _ => 0,
        }
    }

    pub fn history_status(&self) -> CallHistoryStatus {
        if self.connected_at.is_some() {
            CallHistoryStatus::Connected
        } else if self.ended_at.is_some() {
            CallHistoryStatus::Missed
        } else {
            CallHistoryStatus::Initiated
        }
    }

    /// 以 `viewer` 的视角生成通话历史条目
    pub fn history_entry(&self, viewer: UserId) -> Option<CallHistoryEntry> {
        let (direction, other_user_id) = if self.caller_id == viewer {
            (CallDirection::Outgoing, self.callee_id)
        } else if self.callee_id == viewer {
            (CallDirection::Incoming, self.caller_id)
        } else {
            return None;
        };

        Some(CallHistoryEntry {
            call_id: self.call_id,
            call_type: self.call_type,
            direction,
            other_user_id,
            status: self.history_status(),
            started_at: self.created_at,
            ended_at: self.ended_at,
            duration: self.duration,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallHistoryStatus {
    Connected,
    Missed,
    Initiated,
}

/// 通话历史条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryEntry {
    pub call_id: CallId,
    pub call_type: CallType,
    pub direction: CallDirection,
    pub other_user_id: UserId,
    pub status: CallHistoryStatus,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub duration: u64,
}
