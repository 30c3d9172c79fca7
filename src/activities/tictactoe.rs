//! Tic-Tac-Toe (spec.md §4.F.4): best-of-N rounds on a 9-cell board, X
//! starts, first to `win_target` round wins takes the match.

use std::collections::HashMap;

use super::{finish_round, Outcome, RoundOutcome, TimerCmd};
use crate::errors::{CoreError, ErrorKind};
use crate::model::{
    ActivityBody, EndReason, Mark, ParticipantRole, Round, RoundPayload, RoundState, Session,
    Submission, TicTacToeState, TicTacToeSubmission,
};
use crate::wire::SubmitPayload;

const ROUND_GAP_MS: u64 = 3_000;
/// No explicit per-round deadline is specified beyond the win condition;
/// bounds a round where a participant stops responding mid-game.
const ROUND_SAFETY_TIMEOUT_MS: u64 = 60_000;

const WIN_LINES: [[usize; 3]; 8] = [
    [0, 1, 2], [3, 4, 5], [6, 7, 8],
    [0, 3, 6], [1, 4, 7], [2, 5, 8],
    [0, 4, 8], [2, 4, 6],
];

#[must_use]
pub fn initial_body() -> TicTacToeState {
    TicTacToeState::default()
}

/// Marks are assigned once, in participant order, the first time a round is
/// built for a session that has none yet.
fn ensure_roles(session: &mut Session) {
    let ids: Vec<String> = session.participants.iter().map(|p| p.user_id.clone()).collect();
    for (i, id) in ids.iter().enumerate() {
        let mark = if i == 0 { Mark::X } else { Mark::O };
        if let Some(p) = session.participant_mut(id) {
            if p.role.is_none() {
                p.role = Some(ParticipantRole::TicTacToe(mark));
            }
        }
    }
}

fn mark_of(session: &Session, user_id: &str) -> Option<Mark> {
    match session.participant(user_id)?.role {
        Some(ParticipantRole::TicTacToe(m)) => Some(m),
        _ => None,
    }
}

fn win_target(session: &Session) -> u8 {
    match &session.body {
        ActivityBody::TicTacToe(s) => s.win_target,
        _ => 2,
    }
}

fn round_wins(session: &Session) -> HashMap<String, u8> {
    match &session.body {
        ActivityBody::TicTacToe(s) => s.round_wins.clone(),
        _ => HashMap::new(),
    }
}

pub fn build_round(session: &mut Session, now_ms: u64) -> RoundOutcome {
    ensure_roles(session);
    let target = win_target(session);
    let wins = round_wins(session);
    if wins.values().any(|w| *w >= target) {
        return conclude(session, &wins);
    }
    if let ActivityBody::TicTacToe(state) = &mut session.body {
        state.board = [None; 9];
        state.turn = Mark::X;
    }
    let next_index = session.rounds.len() as i32;
    RoundOutcome::Started(Round::new(next_index, RoundPayload::TicTacToe, now_ms, now_ms + ROUND_SAFETY_TIMEOUT_MS))
}

fn conclude(session: &Session, wins: &HashMap<String, u8>) -> RoundOutcome {
    let scores: HashMap<_, _> = session.participants.iter().map(|p| (p.user_id.clone(), p.score)).collect();
    let target = win_target(session);
    let winner = session.participants.iter().find(|p| *wins.get(&p.user_id).unwrap_or(&0) >= target).map(|p| p.user_id.clone());
    RoundOutcome::MatchOver {
        reason: if winner.is_some() { EndReason::Normal } else { EndReason::Tie },
        winner_user_id: winner,
        scores,
    }
}

fn winning_line(board: &[Option<Mark>; 9]) -> Option<Mark> {
    for line in WIN_LINES {
        let [a, b, c] = line;
        if let (Some(ma), Some(mb), Some(mc)) = (board[a], board[b], board[c]) {
            if ma == mb && mb == mc {
                return Some(ma);
            }
        }
    }
    None
}

pub fn handle_submit(
    session: &mut Session,
    user_id: &str,
    payload: SubmitPayload,
    now_ms: u64,
) -> Result<Outcome, CoreError> {
    let SubmitPayload::TicTacToe { cell } = payload else {
        return Err(ErrorKind::InvalidRequest.into());
    };
    if cell > 8 {
        return Err(CoreError::new(ErrorKind::InvalidRequest).with_details("cell out of range"));
    }
    let round_index = session.round_index;
    let Some(mark) = mark_of(session, user_id) else {
        return Err(ErrorKind::ParticipantNotInSession.into());
    };
    let current_turn = match &session.body {
        ActivityBody::TicTacToe(s) => s.turn,
        _ => return Err(ErrorKind::InvalidRequest.into()),
    };
    if mark != current_turn {
        // Not this participant's turn: treated as an invalid transition,
        // not a duplicate, since no submission for them exists yet.
        return Err(CoreError::new(ErrorKind::InvalidRequest).with_details("not your turn"));
    }
    let round_done = session.current_round().is_some_and(|r| r.state == RoundState::Done);
    if round_done {
        return Ok(Outcome::new());
    }
    let occupied = matches!(&session.body, ActivityBody::TicTacToe(s) if s.board[cell as usize].is_some());
    if occupied {
        return Ok(Outcome::new());
    }

    if let Some(round) = session.current_round_mut() {
        round.submissions.insert(user_id.to_owned(), Submission::TicTacToe(TicTacToeSubmission { cell }));
    }
    let mut out = Outcome::new();
    let board_after = if let ActivityBody::TicTacToe(state) = &mut session.body {
        state.board[cell as usize] = Some(mark);
        state.turn = mark.other();
        state.board
    } else {
        [None; 9]
    };

    let line_winner = winning_line(&board_after);
    let full = board_after.iter().all(Option::is_some);
    if line_winner.is_some() || full {
        resolve_round(session, round_index, line_winner, now_ms, &mut out);
    }
    Ok(out)
}

pub fn handle_round_timeout(session: &mut Session, now_ms: u64) -> Outcome {
    // A round cannot stall forever once started (every cell fills the
    // board eventually), but guard the safety timeout the same way.
    let round_index = session.round_index;
    let board = match &session.body {
        ActivityBody::TicTacToe(s) => s.board,
        _ => [None; 9],
    };
    let line_winner = winning_line(&board);
    let mut out = Outcome::new();
    resolve_round(session, round_index, line_winner, now_ms, &mut out);
    out
}

fn resolve_round(session: &mut Session, round_index: i32, line_winner: Option<Mark>, now_ms: u64, out: &mut Outcome) {
    finish_round(session, round_index, out);
    if let Some(mark) = line_winner {
        let winner_id = session.participants.iter().find(|p| mark_of(session, &p.user_id) == Some(mark)).map(|p| p.user_id.clone());
        if let Some(id) = winner_id {
            if let ActivityBody::TicTacToe(state) = &mut session.body {
                *state.round_wins.entry(id).or_insert(0) += 1;
            }
        }
    }

    let target = win_target(session);
    let wins = round_wins(session);
    if wins.values().any(|w| *w >= target) {
        match conclude(session, &wins) {
            RoundOutcome::MatchOver { winner_user_id, reason, scores } => {
                super::end_session(session, now_ms, reason, winner_user_id, scores, out);
            }
            RoundOutcome::Started(_) => unreachable!(),
        }
    } else {
        out.timer = TimerCmd::ArmRoundGap { delay_ms: ROUND_GAP_MS };
    }
}
