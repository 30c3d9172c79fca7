//! Rock-Paper-Scissors (spec.md §4.F.3): best-of-5, early-stop at 3 round
//! wins, spread-based final scoring.

use std::collections::HashMap;

use super::{finish_round, Outcome, RoundOutcome, TimerCmd};
use crate::errors::{CoreError, ErrorKind};
use crate::model::{EndReason, Round, RoundPayload, RoundState, RpsState, RpsSubmission, Session, Submission};
use crate::wire::SubmitPayload;

const MAX_ROUNDS: u32 = 5;
const WIN_TARGET: u8 = 3;
const ROUND_GAP_MS: u64 = 5_000;
/// No explicit per-round deadline is specified for rps beyond the win
/// condition; this bounds a stalled round so a non-responding participant
/// cannot hang the session forever.
const ROUND_SAFETY_TIMEOUT_MS: u64 = 30_000;

#[must_use]
pub fn initial_body() -> RpsState {
    RpsState::default()
}

fn rps_wins(session: &Session) -> HashMap<String, u8> {
    match &session.body {
        crate::model::ActivityBody::Rps(s) => s.round_wins.clone(),
        _ => HashMap::new(),
    }
}

pub fn build_round(session: &mut Session, now_ms: u64) -> RoundOutcome {
    let wins = rps_wins(session);
    if wins.values().any(|w| *w >= WIN_TARGET) || session.rounds.len() as u32 >= MAX_ROUNDS {
        return conclude(session, &wins);
    }
    let next_index = session.rounds.len() as i32;
    RoundOutcome::Started(Round::new(next_index, RoundPayload::Rps, now_ms, now_ms + ROUND_SAFETY_TIMEOUT_MS))
}

/// Spread-based scoring (spec.md §4.F.3 + §8 boundary behavior): a 3-0 win
/// scores 300, 3-1 scores 250, 3-2 scores 200, and an even split after 5
/// rounds with no one reaching 3 is a 150/150 tie. Generalizing the pattern
/// across those four given points: the winner scores `150 + 50 * spread`
/// and the loser scores 0; an equal win count scores 150 each.
fn conclude(session: &Session, wins: &HashMap<String, u8>) -> RoundOutcome {
    let mut ids: Vec<&String> = session.participants.iter().map(|p| &p.user_id).collect();
    ids.sort();
    let (a, b) = (ids.first().copied().cloned().unwrap_or_default(), ids.get(1).copied().cloned().unwrap_or_default());
    let wa = *wins.get(&a).unwrap_or(&0);
    let wb = *wins.get(&b).unwrap_or(&0);

    let mut scores = HashMap::new();
    let winner = match wa.cmp(&wb) {
        std::cmp::Ordering::Equal => {
            scores.insert(a, 150);
            scores.insert(b, 150);
            None
        }
        std::cmp::Ordering::Greater => {
            let spread = i64::from(wa - wb);
            scores.insert(a.clone(), 150 + 50 * spread);
            scores.insert(b, 0);
            Some(a)
        }
        std::cmp::Ordering::Less => {
            let spread = i64::from(wb - wa);
            scores.insert(b.clone(), 150 + 50 * spread);
            scores.insert(a, 0);
            Some(b)
        }
    };
    RoundOutcome::MatchOver {
        reason: if winner.is_some() { EndReason::Normal } else { EndReason::Tie },
        winner_user_id: winner,
        scores,
    }
}

pub fn handle_submit(
    session: &mut Session,
    user_id: &str,
    payload: SubmitPayload,
    now_ms: u64,
) -> Result<Outcome, CoreError> {
    let SubmitPayload::Rps { mv } = payload else {
        return Err(ErrorKind::InvalidRequest.into());
    };
    let round_index = session.round_index;
    let Some(round) = session.current_round_mut() else {
        return Err(ErrorKind::RoundNotStarted.into());
    };
    if round.state == RoundState::Done || round.submissions.contains_key(user_id) {
        return Ok(Outcome::new());
    }
    round.submissions.insert(user_id.to_owned(), Submission::Rps(RpsSubmission { mv }));

    let both_in = session.participants.iter().filter(|p| p.joined).all(|p| {
        session.current_round().is_some_and(|r| r.submissions.contains_key(&p.user_id))
    });
    let mut out = Outcome::new();
    if both_in {
        resolve_round(session, round_index, now_ms, &mut out);
    }
    Ok(out)
}

pub fn handle_round_timeout(session: &mut Session, now_ms: u64) -> Outcome {
    let round_index = session.round_index;
    let mut out = Outcome::new();
    resolve_round(session, round_index, now_ms, &mut out);
    out
}

fn resolve_round(session: &mut Session, round_index: i32, now_ms: u64, out: &mut Outcome) {
    let mut ids: Vec<String> = session.participants.iter().map(|p| p.user_id.clone()).collect();
    ids.sort();
    let moves: HashMap<String, crate::model::RpsMove> = {
        let Some(round) = session.current_round() else { return };
        ids.iter()
            .filter_map(|id| match round.submissions.get(id) {
                Some(Submission::Rps(s)) => Some((id.clone(), s.mv)),
                _ => None,
            })
            .collect()
    };
    finish_round(session, round_index, out);

    if let (Some(a), Some(b)) = (ids.first(), ids.get(1)) {
        if let (Some(&ma), Some(&mb)) = (moves.get(a), moves.get(b)) {
            let round_winner = if ma.beats(mb) {
                Some(a.clone())
            } else if mb.beats(ma) {
                Some(b.clone())
            } else {
                None
            };
            if let Some(winner) = round_winner {
                if let crate::model::ActivityBody::Rps(state) = &mut session.body {
                    *state.round_wins.entry(winner).or_insert(0) += 1;
                }
            }
        }
    }

    let wins = rps_wins(session);
    if wins.values().any(|w| *w >= WIN_TARGET) || session.rounds.len() as u32 >= MAX_ROUNDS {
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
