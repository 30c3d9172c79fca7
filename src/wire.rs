//! Wire protocol (spec.md §6): HTTP request/response bodies and the
//! websocket frame envelopes. Inbound frames are validated at this
//! boundary; anything that doesn't parse becomes a `bad_format` error
//! frame rather than propagating a serde error into the coordinator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ErrorFrame;
use crate::model::{ActivityKind, Mark, Phase, RpsMove, Session, SessionStatus, StoryRole};

// ---------------------------------------------------------------------
// HTTP request/response bodies (§6.1)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub activity_key: String,
    pub creator_user_id: String,
    pub participants: Vec<String>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub ok: bool,
    pub permit_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyRequest {
    pub user_id: String,
    #[serde(default)]
    pub ready: Option<bool>,
    /// Story-only: `"boy"` or `"girl"`, required before that participant can
    /// go ready.
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub activity_key: &'static str,
    pub status: SessionStatus,
    pub phase: Phase,
    pub created_at_ms: u64,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id,
            activity_key: s.kind.as_str(),
            status: s.status,
            phase: s.phase,
            created_at_ms: s.created_at_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionSummary>,
    pub counts: SessionCounts,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionCounts {
    pub pending: usize,
    pub running: usize,
    pub ended: usize,
}

// ---------------------------------------------------------------------
// Websocket envelopes (§6.2)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum InboundFrame {
    Submit(SubmitPayload),
    Keystroke(KeystrokePayload),
    Ping(PingPayload),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SubmitPayload {
    Typing { text: String },
    Trivia { #[serde(rename = "choiceIndex")] choice_index: usize },
    Rps { #[serde(rename = "move")] mv: RpsMove },
    TicTacToe { cell: u8 },
    StoryVote { vote: StoryVote },
    StoryParagraph { paragraph: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryVote {
    pub paragraph_index: u32,
    pub score: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystrokePayload {
    pub client_time_ms: u64,
    pub length: u32,
    #[serde(default)]
    pub paste: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub client_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum OutboundEvent {
    #[serde(rename = "session.snapshot")]
    SessionSnapshot(Box<Session>),
    #[serde(rename = "activity.session.presence")]
    Presence(PresencePayload),
    #[serde(rename = "activity.session.countdown")]
    Countdown(CountdownPayload),
    #[serde(rename = "activity.session.countdown.cancelled")]
    CountdownCancelled(SessionIdPayload),
    #[serde(rename = "activity.session.started")]
    SessionStarted(SessionIdPayload),
    #[serde(rename = "activity.round.started")]
    RoundStarted(RoundStartedPayload),
    #[serde(rename = "activity.score.updated")]
    ScoreUpdated(ScoreUpdatedPayload),
    #[serde(rename = "activity.anti_cheat.flag")]
    AntiCheatFlag(AntiCheatPayload),
    #[serde(rename = "activity.round.ended")]
    RoundEnded(RoundEndedPayload),
    #[serde(rename = "activity.session.ended")]
    SessionEnded(SessionEndedPayload),
    #[serde(rename = "pong")]
    Pong(PongPayload),
    #[serde(rename = "ack")]
    Ack(AckPayload),
    #[serde(rename = "error")]
    Error(ErrorFrame),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdPayload {
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub session_id: Uuid,
    pub user_id: String,
    pub joined: bool,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountdownPayload {
    pub session_id: Uuid,
    pub starts_in_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStartedPayload {
    pub session_id: Uuid,
    pub round_index: i32,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreUpdatedPayload {
    pub session_id: Uuid,
    pub user_id: String,
    pub delta: i64,
    pub score: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AntiCheatPayload {
    pub session_id: Uuid,
    pub user_id: String,
    pub incident: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundEndedPayload {
    pub session_id: Uuid,
    pub round_index: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndedPayload {
    pub session_id: Uuid,
    pub winner_user_id: Option<String>,
    pub draw: bool,
    pub reason: &'static str,
    pub scores: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub server_time_ms: u64,
    pub skew_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub for_type: &'static str,
}

/// Bearer-token derived identity (spec.md §6: `Bearer <secret>:<userId>[:flag]...`).
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub admin: bool,
}

pub fn story_role(key: &str) -> Option<StoryRole> {
    match key {
        "boy" => Some(StoryRole::Boy),
        "girl" => Some(StoryRole::Girl),
        _ => None,
    }
}

pub fn mark_str(mark: Mark) -> &'static str {
    match mark {
        Mark::X => "X",
        Mark::O => "O",
    }
}

pub fn activity_kind_required(key: &str) -> Option<ActivityKind> {
    ActivityKind::parse(key)
}
