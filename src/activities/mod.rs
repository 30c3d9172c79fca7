//! Activity State Machines (spec.md §4.F).
//!
//! All five kinds share one lifecycle — `lobby → countdown → running →
//! ended`, with `unready`/leave cancelling an in-flight countdown back to
//! `lobby` — implemented once here. Each kind module supplies only what
//! differs: how a round's payload is built, how a submission is scored, and
//! what happens when a round's timer fires.
//!
//! Every entry point here is a pure function over `&mut Session`: it has no
//! access to the Scheduler, SocketHub, or Clock directly. It returns an
//! [`Outcome`] — the events to publish and the timer action to take — and
//! leaves actually arming timers and publishing to the Session Coordinator
//! (`coordinator.rs`), which is the only thing allowed to touch those
//! shared components. That split is what makes the machines testable
//! without a runtime.

pub mod rps;
pub mod story;
pub mod tictactoe;
pub mod trivia;
pub mod typing;

use std::collections::HashMap;

use crate::errors::{CoreError, ErrorKind};
use crate::model::{ActivityKind, EndReason, ParticipantRole, Phase, Round, RoundState, Session, SessionStatus};
use crate::wire::{
    CountdownPayload, OutboundEvent, PresencePayload, RoundEndedPayload, RoundStartedPayload,
    ScoreUpdatedPayload, SessionEndedPayload, SessionIdPayload, SubmitPayload,
};

pub const COUNTDOWN_TYPING_MS: u64 = 10_000;
pub const COUNTDOWN_TRIVIA_MS: u64 = 10_000;
pub const COUNTDOWN_RPS_MS: u64 = 5_000;
pub const COUNTDOWN_TICTACTOE_MS: u64 = 3_000;
pub const COUNTDOWN_STORY_MS: u64 = 10_000;
pub const WATCHDOG_MS: u64 = 120_000;

#[must_use]
pub const fn countdown_ms(kind: ActivityKind) -> u64 {
    match kind {
        ActivityKind::TypingDuel => COUNTDOWN_TYPING_MS,
        ActivityKind::Trivia => COUNTDOWN_TRIVIA_MS,
        ActivityKind::Rps => COUNTDOWN_RPS_MS,
        ActivityKind::TicTacToe => COUNTDOWN_TICTACTOE_MS,
        ActivityKind::Story => COUNTDOWN_STORY_MS,
    }
}

/// What the coordinator should do to this session's timers after applying an
/// [`Outcome`]. `Scheduler` tracks one slot per key (see `clock::watchdog_key`
/// for why the watchdog gets its own), so these are phrased per-slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerCmd {
    #[default]
    None,
    ArmCountdown { delay_ms: u64 },
    CancelCountdown,
    ArmRound { delay_ms: u64 },
    /// rps/tictactoe: the fixed pause between one round ending and the next
    /// one's payload being built, with no visible countdown event.
    ArmRoundGap { delay_ms: u64 },
    /// Session ended: drop every timer slot for it (round/countdown and
    /// watchdog both).
    CancelAll,
}

/// The round/countdown timer (`timer`) and the inactivity watchdog
/// (`rearm_watchdog`) occupy distinct Scheduler slots (see
/// `clock::watchdog_key`) and are driven independently: the watchdog only
/// resets on participant-caused state changes, never on a timer callback
/// firing, so it cannot be folded into `timer`.
#[derive(Debug, Default)]
pub struct Outcome {
    pub events: Vec<OutboundEvent>,
    pub timer: TimerCmd,
    pub rearm_watchdog: bool,
}

impl Outcome {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            timer: TimerCmd::None,
            rearm_watchdog: false,
        }
    }

    fn push(&mut self, event: OutboundEvent) -> &mut Self {
        self.events.push(event);
        self
    }
}

/// Result of a kind's round-build step: either the next round started, or
/// the match is over and the session should end.
pub enum RoundOutcome {
    Started(Round),
    MatchOver {
        winner_user_id: Option<String>,
        reason: EndReason,
        scores: HashMap<String, i64>,
    },
}

/// Per-kind hooks the common lifecycle dispatches into. Each kind module
/// exposes a free function of this shape rather than a trait object —
/// there is no need for dynamic dispatch since `Session::kind` picks the
/// implementation once per call.
struct KindOps {
    build_round: fn(&mut Session, now_ms: u64) -> RoundOutcome,
    handle_submit: fn(&mut Session, &str, SubmitPayload, u64) -> Result<Outcome, CoreError>,
    handle_round_timeout: fn(&mut Session, u64) -> Outcome,
}

fn ops(kind: ActivityKind) -> KindOps {
    match kind {
        ActivityKind::TypingDuel => KindOps {
            build_round: typing::build_round,
            handle_submit: typing::handle_submit,
            handle_round_timeout: typing::handle_round_timeout,
        },
        ActivityKind::Trivia => KindOps {
            build_round: trivia::build_round,
            handle_submit: trivia::handle_submit,
            handle_round_timeout: trivia::handle_round_timeout,
        },
        ActivityKind::Rps => KindOps {
            build_round: rps::build_round,
            handle_submit: rps::handle_submit,
            handle_round_timeout: rps::handle_round_timeout,
        },
        ActivityKind::TicTacToe => KindOps {
            build_round: tictactoe::build_round,
            handle_submit: tictactoe::handle_submit,
            handle_round_timeout: tictactoe::handle_round_timeout,
        },
        ActivityKind::Story => KindOps {
            build_round: story::build_round,
            handle_submit: story::handle_submit,
            handle_round_timeout: story::handle_round_timeout,
        },
    }
}

// ---------------------------------------------------------------------
// Common lifecycle
// ---------------------------------------------------------------------

/// `ready(on/off)` (§4.G). For `story` sessions a role must already be
/// assigned (via `role`) before `ready=true` is accepted.
pub fn ready(
    session: &mut Session,
    user_id: &str,
    ready: bool,
    role: Option<String>,
) -> Result<Outcome, CoreError> {
    if !matches!(session.phase, Phase::Lobby | Phase::Countdown) {
        return Err(ErrorKind::SessionNotInLobby.into());
    }
    if !session.is_participant(user_id) {
        return Err(ErrorKind::ParticipantNotInSession.into());
    }

    if session.kind == ActivityKind::Story {
        if let Some(role_key) = role {
            let parsed = crate::wire::story_role(&role_key)
                .ok_or_else(|| CoreError::new(ErrorKind::InvalidRequest).with_details("unknown role"))?;
            if let Some(p) = session.participant_mut(user_id) {
                p.role = Some(ParticipantRole::Story(parsed));
            }
        }
        if ready && session.participant(user_id).and_then(|p| p.role).is_none() {
            return Err(CoreError::new(ErrorKind::InvalidRequest).with_details("role required before ready"));
        }
    }

    let was_countdown = session.phase == Phase::Countdown;
    if let Some(p) = session.participant_mut(user_id) {
        p.ready = ready;
    }
    session.bump_version();

    let mut out = Outcome::new();
    out.push(OutboundEvent::Presence(PresencePayload {
        session_id: session.id,
        user_id: user_id.to_owned(),
        joined: session.participant(user_id).is_some_and(|p| p.joined),
        ready,
    }));

    if ready && session.all_ready() && session.phase == Phase::Lobby {
        enter_countdown(session, &mut out);
    } else if !ready && was_countdown {
        cancel_countdown(session, &mut out);
    }
    Ok(out)
}

fn enter_countdown(session: &mut Session, out: &mut Outcome) {
    session.phase = Phase::Countdown;
    session.bump_version();
    let delay_ms = countdown_ms(session.kind);
    out.push(OutboundEvent::Countdown(CountdownPayload {
        session_id: session.id,
        starts_in_ms: delay_ms,
    }));
    out.timer = TimerCmd::ArmCountdown { delay_ms };
}

fn cancel_countdown(session: &mut Session, out: &mut Outcome) {
    session.phase = Phase::Lobby;
    session.bump_version();
    out.push(OutboundEvent::CountdownCancelled(SessionIdPayload {
        session_id: session.id,
    }));
    out.timer = TimerCmd::CancelCountdown;
}

/// `start` (§4.G): the creator (or admin) can force lobby/countdown straight
/// into countdown regardless of readiness.
pub fn force_start(session: &mut Session, caller: &str, is_admin: bool) -> Result<Outcome, CoreError> {
    if !matches!(session.phase, Phase::Lobby | Phase::Countdown) {
        return Err(ErrorKind::SessionNotInLobby.into());
    }
    if session.creator != caller && !is_admin {
        return Err(ErrorKind::Forbidden.into());
    }
    if session.joined_count() < 2 {
        return Err(CoreError::new(ErrorKind::InvalidRequest).with_details("not enough participants joined"));
    }
    let mut out = Outcome::new();
    if session.phase != Phase::Countdown {
        enter_countdown(session, &mut out);
    }
    Ok(out)
}

/// Countdown timer fired: transition to `running` and build the first round.
pub fn countdown_elapsed(session: &mut Session, now_ms: u64) -> Outcome {
    if session.phase != Phase::Countdown {
        return Outcome::new();
    }
    session.status = SessionStatus::Running;
    session.phase = Phase::Running;
    session.last_activity_ms = now_ms;
    session.bump_version();

    let mut out = Outcome::new();
    out.push(OutboundEvent::SessionStarted(SessionIdPayload {
        session_id: session.id,
    }));
    if session.kind == ActivityKind::Story {
        story::begin_writing(session, now_ms, &mut out);
    } else {
        advance_round(session, now_ms, &mut out);
    }
    if session.status == SessionStatus::Running {
        out.rearm_watchdog = true;
    }
    out
}

/// Starts (or restarts, for multi-round kinds) the next round, or ends the
/// session if the kind's `build_round` reports the match is over. Leaves
/// `out.timer` set to `ArmRound`; `out.rearm_watchdog` is independent and set
/// by the caller, since it lives in its own Scheduler slot.
fn advance_round(session: &mut Session, now_ms: u64, out: &mut Outcome) {
    match (ops(session.kind).build_round)(session, now_ms) {
        RoundOutcome::Started(round) => {
            let deadline_ms = round.deadline_ts_ms;
            let round_index = round.index;
            session.round_index = round.index;
            session.rounds.push(round);
            session.phase = Phase::Running;
            session.bump_version();
            out.push(OutboundEvent::RoundStarted(RoundStartedPayload {
                session_id: session.id,
                round_index,
                deadline_ms,
            }));
            out.timer = TimerCmd::ArmRound {
                delay_ms: deadline_ms.saturating_sub(now_ms),
            };
        }
        RoundOutcome::MatchOver {
            winner_user_id,
            reason,
            scores,
        } => {
            end_session(session, now_ms, reason, winner_user_id, scores, out);
        }
    }
}

fn end_session(
    session: &mut Session,
    now_ms: u64,
    reason: EndReason,
    winner_user_id: Option<String>,
    scores: HashMap<String, i64>,
    out: &mut Outcome,
) {
    if session.stats_recorded {
        return;
    }
    session.status = SessionStatus::Ended;
    session.phase = Phase::Ended;
    session.ended_at_ms = Some(now_ms);
    session.winner_user_id = winner_user_id.clone();
    session.end_reason = Some(reason);
    session.stats_recorded = true;
    // Kinds that only settle the scoreboard at match end (rps) report it
    // here; kinds that apply deltas per round (typing, trivia) just echo
    // what's already on the participant.
    for p in &mut session.participants {
        if let Some(&s) = scores.get(&p.user_id) {
            p.score = s;
        }
    }
    session.bump_version();

    out.push(OutboundEvent::SessionEnded(SessionEndedPayload {
        session_id: session.id,
        winner_user_id,
        draw: matches!(reason, EndReason::InactivityDraw | EndReason::Tie),
        reason: end_reason_str(reason),
        scores,
    }));
    out.timer = TimerCmd::CancelAll;
}

fn end_reason_str(reason: EndReason) -> &'static str {
    match reason {
        EndReason::Normal => "normal",
        EndReason::OpponentLeft => "opponent_left",
        EndReason::InactivityDraw => "inactivity_draw",
        EndReason::Tie => "tie",
    }
}

/// Per-user EWMA(serverNow − clientNow), clamped ±600 ms (§4.F.1). Shared by
/// `ping` (every kind) and the typing machine's keystroke normalization.
pub fn update_clock_skew(session: &mut Session, user_id: &str, client_time_ms: u64, now_ms: u64) -> f64 {
    let observed = now_ms as f64 - client_time_ms as f64;
    let prior = *session.clock_skew_ms.get(user_id).unwrap_or(&0.0);
    let ewma = prior + 0.4 * (observed - prior);
    let clamped = ewma.clamp(-600.0, 600.0);
    session.clock_skew_ms.insert(user_id.to_owned(), clamped);
    clamped
}

fn score_snapshot(session: &Session) -> HashMap<String, i64> {
    session
        .participants
        .iter()
        .map(|p| (p.user_id.clone(), p.score))
        .collect()
}

/// Applies a score delta to `user_id` and appends a `score.updated` event.
fn apply_score_delta(session: &mut Session, user_id: &str, delta: i64, out: &mut Outcome) {
    let new_score = if let Some(p) = session.participant_mut(user_id) {
        p.score += delta;
        p.score
    } else {
        return;
    };
    out.push(OutboundEvent::ScoreUpdated(ScoreUpdatedPayload {
        session_id: session.id,
        user_id: user_id.to_owned(),
        delta,
        score: new_score,
    }));
}

/// `round.ended` bookkeeping shared by every kind: marks the round `Done`
/// and emits the event. Callers decide separately whether to advance to the
/// next round or end the match.
fn finish_round(session: &mut Session, round_index: i32, out: &mut Outcome) {
    if let Some(round) = session.rounds.iter_mut().find(|r| r.index == round_index) {
        round.state = RoundState::Done;
    }
    session.bump_version();
    out.push(OutboundEvent::RoundEnded(RoundEndedPayload {
        session_id: session.id,
        round_index,
    }));
}

/// `submit` (WS, §4.G): phase must be `running`, caller must be a
/// participant, and the submission kind must match the session's activity
/// kind (checked by the per-kind handler via the untagged `SubmitPayload`).
pub fn submit(
    session: &mut Session,
    user_id: &str,
    payload: SubmitPayload,
    now_ms: u64,
) -> Result<Outcome, CoreError> {
    if session.phase != Phase::Running && session.phase != Phase::Voting {
        return Err(ErrorKind::SessionNotRunning.into());
    }
    if !session.is_participant(user_id) {
        return Err(ErrorKind::ParticipantNotInSession.into());
    }
    let mut out = (ops(session.kind).handle_submit)(session, user_id, payload, now_ms)?;
    if !out.events.is_empty() {
        session.last_activity_ms = now_ms;
        out.rearm_watchdog = true;
    }
    Ok(out)
}

/// `keystroke` (WS, typing_duel only): live per-character telemetry ahead of
/// the final `submit`. Unlike `submit`, always refreshes the watchdog, since
/// an active typist sending keystrokes without yet submitting is still
/// plainly present.
pub fn keystroke(
    session: &mut Session,
    user_id: &str,
    client_time_ms: u64,
    length: u32,
    paste: bool,
    now_ms: u64,
) -> Result<Outcome, CoreError> {
    if session.kind != ActivityKind::TypingDuel {
        return Err(ErrorKind::InvalidRequest.into());
    }
    if session.phase != Phase::Running {
        return Err(ErrorKind::SessionNotRunning.into());
    }
    if !session.is_participant(user_id) {
        return Err(ErrorKind::ParticipantNotInSession.into());
    }
    let mut out = typing::append_keystroke(session, user_id, client_time_ms, length, paste, now_ms)?;
    session.last_activity_ms = now_ms;
    out.rearm_watchdog = true;
    Ok(out)
}

/// `ping` (WS, always admitted regardless of phase): refreshes the caller's
/// clock-skew estimate and returns it so the coordinator can reply `pong`.
/// Never touches timers or the event stream.
pub fn ping(session: &mut Session, user_id: &str, client_time_ms: u64, now_ms: u64) -> f64 {
    update_clock_skew(session, user_id, client_time_ms, now_ms)
}

/// Round timer fired: no-op if the round it names is no longer the current
/// running round (already ended via early completion).
pub fn round_timer_elapsed(session: &mut Session, round_index: i32, now_ms: u64) -> Outcome {
    if session.status != SessionStatus::Running || session.round_index != round_index {
        return Outcome::new();
    }
    let done_already = session
        .current_round()
        .map(|r| r.state == RoundState::Done)
        .unwrap_or(true);
    if done_already {
        return Outcome::new();
    }
    (ops(session.kind).handle_round_timeout)(session, now_ms)
}

/// The rps/tictactoe between-round gap (`TimerCmd::ArmRoundGap`) fired:
/// build and start the next round now.
pub fn round_gap_elapsed(session: &mut Session, now_ms: u64) -> Outcome {
    if session.status != SessionStatus::Running {
        return Outcome::new();
    }
    let mut out = Outcome::new();
    advance_round(session, now_ms, &mut out);
    out
}

/// Inactivity watchdog fired (round index `ROUND_WATCHDOG`): ends the
/// session as an undecided draw unless it already ended some other way.
pub fn watchdog_elapsed(session: &mut Session, now_ms: u64) -> Outcome {
    if session.status != SessionStatus::Running {
        return Outcome::new();
    }
    let mut out = Outcome::new();
    end_session(session, now_ms, EndReason::InactivityDraw, None, score_snapshot(session), &mut out);
    out
}

/// `leave` (HTTP, §4.G common failure semantics).
pub fn leave(session: &mut Session, user_id: &str, now_ms: u64) -> Outcome {
    let mut out = Outcome::new();
    let Some(p) = session.participant_mut(user_id) else {
        return out;
    };
    p.joined = false;
    session.leave_reason = Some(format!("{user_id} left"));
    session.bump_version();
    out.push(OutboundEvent::Presence(PresencePayload {
        session_id: session.id,
        user_id: user_id.to_owned(),
        joined: false,
        ready: false,
    }));

    if session.status == SessionStatus::Ended {
        return out;
    }

    let remaining = session.joined_count();
    if session.status == SessionStatus::Running {
        if remaining == 1 {
            let winner = session
                .participants
                .iter()
                .find(|p| p.joined)
                .map(|p| p.user_id.clone());
            // Forfeit scoring matches the kind's normal match-end scale
            // rather than the mid-match tally: rps awards the 3-0 spread
            // (300/0) a completed forfeit would have earned (§8 scenario 3);
            // every other kind just keeps whatever's already on the board.
            let mut scores = score_snapshot(session);
            if let Some(w) = &winner {
                if session.kind == ActivityKind::Rps {
                    for p in &mut session.participants {
                        p.score = if p.joined { 300 } else { 0 };
                    }
                    scores = score_snapshot(session);
                } else {
                    scores.entry(w.clone()).or_insert(0);
                }
            }
            end_session(session, now_ms, EndReason::OpponentLeft, winner, scores, &mut out);
        } else if remaining == 0 {
            end_session(session, now_ms, EndReason::OpponentLeft, None, score_snapshot(session), &mut out);
        }
    } else if matches!(session.phase, Phase::Lobby | Phase::Countdown) && session.phase == Phase::Countdown {
        cancel_countdown(session, &mut out);
    }
    out
}
