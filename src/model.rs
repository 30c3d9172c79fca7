//! Data model (spec.md §3): the session/participant/round/submission shapes
//! shared by every activity machine, plus the kind-specific bodies each
//! machine owns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    TypingDuel,
    Trivia,
    Rps,
    TicTacToe,
    Story,
}

impl ActivityKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TypingDuel => "typing_duel",
            Self::Trivia => "trivia",
            Self::Rps => "rps",
            Self::TicTacToe => "tictactoe",
            Self::Story => "story",
        }
    }

    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "typing_duel" => Some(Self::TypingDuel),
            "trivia" => Some(Self::Trivia),
            "rps" => Some(Self::Rps),
            "tictactoe" => Some(Self::TicTacToe),
            "story" => Some(Self::Story),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Lobby,
    Countdown,
    Running,
    RoundResult,
    Voting,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryRole {
    Boy,
    Girl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mark {
    X,
    O,
}

impl Mark {
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::X => Self::O,
            Self::O => Self::X,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParticipantRole {
    Story(StoryRole),
    TicTacToe(Mark),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub joined: bool,
    pub ready: bool,
    pub score: i64,
    pub role: Option<ParticipantRole>,
}

impl Participant {
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            joined: false,
            ready: false,
            score: 0,
            role: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Queued,
    Running,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoundPayload {
    Typing {
        text: String,
    },
    Trivia {
        #[serde(rename = "questionId")]
        question_id: String,
        options: Vec<String>,
        #[serde(skip_serializing, rename = "correctIndex")]
        correct_index: usize,
    },
    Rps,
    TicTacToe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpsMove {
    Rock,
    Paper,
    Scissors,
}

impl RpsMove {
    /// `Ordering::Greater` if `self` beats `other`.
    #[must_use]
    pub fn beats(self, other: Self) -> bool {
        matches!(
            (self, other),
            (Self::Rock, Self::Scissors) | (Self::Scissors, Self::Paper) | (Self::Paper, Self::Rock)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AntiCheatKind {
    PasteDetected,
    ImplausibleRate,
    LateInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AntiCheatIncident {
    pub kind: AntiCheatKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystrokeSample {
    pub server_time_ms: u64,
    pub length: u32,
    pub paste: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSubmission {
    pub text: String,
    pub keystrokes: Vec<KeystrokeSample>,
    pub accuracy: f64,
    pub duration_ms: u64,
    pub wpm: f64,
    pub anti_cheat: Vec<AntiCheatIncident>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriviaSubmission {
    pub choice_index: usize,
    pub response_time_ms: u64,
    pub correct: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RpsSubmission {
    #[serde(rename = "move")]
    pub mv: RpsMove,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TicTacToeSubmission {
    pub cell: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Submission {
    Typing(TypingSubmission),
    Trivia(TriviaSubmission),
    Rps(RpsSubmission),
    TicTacToe(TicTacToeSubmission),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub index: i32,
    pub state: RoundState,
    pub payload: RoundPayload,
    pub start_ts_ms: u64,
    pub deadline_ts_ms: u64,
    pub submissions: HashMap<UserId, Submission>,
    /// Typing-only: the running keystroke buffer per user, accumulated by
    /// `keystroke` frames ahead of the final `submit`.
    #[serde(default)]
    pub keystroke_log: HashMap<UserId, Vec<KeystrokeSample>>,
}

impl Round {
    #[must_use]
    pub fn new(index: i32, payload: RoundPayload, start_ts_ms: u64, deadline_ts_ms: u64) -> Self {
        Self {
            index,
            state: RoundState::Running,
            payload,
            start_ts_ms,
            deadline_ts_ms,
            submissions: HashMap::new(),
            keystroke_log: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paragraph {
    pub author: UserId,
    pub index: u32,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryState {
    pub turn_order: Vec<UserId>,
    pub paragraph_cap: u32,
    pub paragraphs: Vec<Paragraph>,
    /// votes[voter][paragraph_index] = score in 0..=10
    pub votes: HashMap<UserId, HashMap<u32, u8>>,
    /// Which of the three prompt pools (mixed/same_boy/same_girl) this
    /// match drew from, selected deterministically from the two roles.
    pub prompt_pool: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriviaState {
    pub rounds_total: u32,
    pub time_limit_ms: u64,
    pub asked_question_ids: Vec<String>,
    /// response_times[user_id] = per-round response time in ms, answered rounds only
    pub response_times: HashMap<UserId, Vec<u64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpsState {
    pub round_wins: HashMap<UserId, u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicTacToeState {
    pub board: [Option<Mark>; 9],
    pub win_target: u8,
    pub round_wins: HashMap<UserId, u8>,
    pub turn: Mark,
}

impl Default for TicTacToeState {
    fn default() -> Self {
        Self {
            board: [None; 9],
            win_target: 2,
            round_wins: HashMap::new(),
            turn: Mark::X,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    pub prompt: String,
    pub time_limit_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityBody {
    Typing(TypingState),
    Trivia(TriviaState),
    Rps(RpsState),
    TicTacToe(TicTacToeState),
    Story(StoryState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Normal,
    OpponentLeft,
    InactivityDraw,
    Tie,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub kind: ActivityKind,
    pub status: SessionStatus,
    pub phase: Phase,
    pub creator: UserId,
    pub participants: Vec<Participant>,
    pub round_index: i32,
    pub rounds: Vec<Round>,
    pub body: ActivityBody,
    pub created_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub leave_reason: Option<String>,
    pub version: u64,
    pub stats_recorded: bool,
    pub winner_user_id: Option<UserId>,
    pub end_reason: Option<EndReason>,
    /// per-user clock skew estimate, EWMA(serverNow - clientNow), ms.
    pub clock_skew_ms: HashMap<UserId, f64>,
    pub last_activity_ms: u64,
}

impl Session {
    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    #[must_use]
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    #[must_use]
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    #[must_use]
    pub fn other_participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id != user_id)
    }

    #[must_use]
    pub fn joined_count(&self) -> usize {
        self.participants.iter().filter(|p| p.joined).count()
    }

    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.joined_count() >= 2 && self.participants.iter().all(|p| !p.joined || p.ready)
    }

    #[must_use]
    pub fn current_round(&self) -> Option<&Round> {
        self.rounds.iter().find(|r| r.index == self.round_index)
    }

    pub fn current_round_mut(&mut self) -> Option<&mut Round> {
        let idx = self.round_index;
        self.rounds.iter_mut().find(|r| r.index == idx)
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}
