use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{DrawMode, EventId, GroupNo, PlayerId, SessionId, SessionStatus, TournamentId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawSessionSeed {
    pub session_id: SessionId,
    pub tournament_id: TournamentId,
    pub status: SessionStatus,
    pub group_count: u32,
    pub group_size: u32,
    pub total_players: u32,
    pub player_ids: Vec<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Animation knobs carried by `STEP_CONFIGURED`. Every field is optional on
/// the wire; the path generator clamps and defaults them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tempo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_hz: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slowdown_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub near_miss: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_ids: Option<Vec<PlayerId>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfigured {
    pub mode: DrawMode,
    #[serde(default)]
    pub target_group_no: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<Tempo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deck_order: Option<Vec<PlayerId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickResult {
    pub player_id: PlayerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAssignment {
    pub player_id: PlayerId,
    pub group_no: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberMoved {
    pub player_id: PlayerId,
    #[serde(default)]
    pub from_group_no: Option<i64>,
    pub to_group_no: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoLast {
    pub player_id: PlayerId,
    #[serde(default)]
    pub group_no: Option<i64>,
}

/// Closed set of log entries. Group numbers stay signed on the wire so an
/// out-of-range value still decodes and is rejected by the reducer instead
/// of failing the whole snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "eventType",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE"
)]
pub enum DrawEvent {
    SessionStarted(SessionStarted),
    StepConfigured(StepConfigured),
    PickResult(PickResult),
    AssignUpdated(GroupAssignment),
    AssignConfirmed(GroupAssignment),
    MemberMoved(MemberMoved),
    UndoLast(UndoLast),
}

impl DrawEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStarted(_) => "SESSION_STARTED",
            Self::StepConfigured(_) => "STEP_CONFIGURED",
            Self::PickResult(_) => "PICK_RESULT",
            Self::AssignUpdated(_) => "ASSIGN_UPDATED",
            Self::AssignConfirmed(_) => "ASSIGN_CONFIRMED",
            Self::MemberMoved(_) => "MEMBER_MOVED",
            Self::UndoLast(_) => "UNDO_LAST",
        }
    }

    /// Rebuilds an event from its stored `(eventType, payload)` columns.
    pub fn from_parts(
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "eventType": event_type,
            "payload": payload,
        }))
    }

    /// The payload object alone, as stored next to the event type.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        Ok(value
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawEventRecord {
    pub id: EventId,
    pub session_id: SessionId,
    pub step: u32,
    #[serde(flatten)]
    pub event: DrawEvent,
    pub created_at: DateTime<Utc>,
}

impl DrawEventRecord {
    pub fn order_key(&self) -> (u32, EventId) {
        (self.step, self.id)
    }
}

/// Sorts records into fold order: `(step ASC, id ASC)`.
pub fn sort_events(events: &mut [DrawEventRecord]) {
    events.sort_by_key(DrawEventRecord::order_key);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawSnapshot {
    pub session: DrawSessionSeed,
    pub events: Vec<DrawEventRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub tournament_id: TournamentId,
    pub group_count: u32,
    pub group_size: u32,
    pub player_ids: Vec<PlayerId>,
}

impl StartSessionRequest {
    /// Seats available across all groups.
    pub fn capacity(&self) -> u64 {
        u64::from(self.group_count) * u64::from(self.group_size)
    }
}

/// Operator console actions. Each one maps to exactly one appended event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "action",
    content = "params",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum DrawAction {
    StartStep {
        mode: DrawMode,
        #[serde(default)]
        target_group_no: Option<GroupNo>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default)]
        tempo: Option<Tempo>,
    },
    PickResult,
    /// Timer-driven pick: accepted only while `step` is still configured and
    /// unpicked, so it never overwrites a manual pick.
    AutoPick {
        step: u32,
    },
    AssignUpdate {
        group_no: GroupNo,
    },
    AssignConfirm {
        #[serde(default)]
        group_no: Option<GroupNo>,
    },
    MoveMember {
        player_id: PlayerId,
        to_group_no: GroupNo,
    },
    UndoLast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    DrawEventAppended { event: DrawEventRecord },
    SessionUpdated { session: DrawSessionSeed },
    Error(ApiError),
}

impl ServerEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::DrawEventAppended { event } => Some(event.session_id),
            Self::SessionUpdated { session } => Some(session.session_id),
            Self::Error(_) => None,
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
