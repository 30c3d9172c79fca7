//! Trivia (spec.md §4.F.2): fixed number of rounds, pick-without-replacement
//! questions, median-response-time tie-break at the end.

use std::collections::HashMap;

use rand::seq::SliceRandom;

use super::{apply_score_delta, finish_round, Outcome, RoundOutcome};
use crate::errors::{CoreError, ErrorKind};
use crate::model::{
    ActivityBody, EndReason, Round, RoundPayload, RoundState, Session, Submission, TriviaState,
    TriviaSubmission,
};
use crate::wire::SubmitPayload;

const ROUNDS_TOTAL: u32 = 5;
const TIME_LIMIT_MS: u64 = 18_000;

struct Question {
    id: &'static str,
    options: &'static [&'static str],
    correct_index: usize,
}

/// Stand-in for the question/text bank the spec treats as an external
/// collaborator (§1 Non-goals).
const BANK: &[Question] = &[
    Question { id: "q1", options: &["Paris", "Rome", "Madrid", "Berlin"], correct_index: 0 },
    Question { id: "q2", options: &["7", "9", "11", "13"], correct_index: 1 },
    Question { id: "q3", options: &["Mercury", "Venus", "Mars", "Jupiter"], correct_index: 2 },
    Question { id: "q4", options: &["Shakespeare", "Dickens", "Austen", "Twain"], correct_index: 0 },
    Question { id: "q5", options: &["Oxygen", "Carbon", "Nitrogen", "Helium"], correct_index: 1 },
    Question { id: "q6", options: &["1945", "1939", "1918", "1963"], correct_index: 0 },
];

#[must_use]
pub fn initial_body() -> TriviaState {
    TriviaState {
        rounds_total: ROUNDS_TOTAL,
        time_limit_ms: TIME_LIMIT_MS,
        asked_question_ids: Vec::new(),
        response_times: HashMap::new(),
    }
}

fn trivia_state(session: &Session) -> Option<&TriviaState> {
    match &session.body {
        ActivityBody::Trivia(s) => Some(s),
        _ => None,
    }
}

fn trivia_state_mut(session: &mut Session) -> Option<&mut TriviaState> {
    match &mut session.body {
        ActivityBody::Trivia(s) => Some(s),
        _ => None,
    }
}

pub fn build_round(session: &mut Session, now_ms: u64) -> RoundOutcome {
    let Some(state) = trivia_state(session) else {
        return RoundOutcome::MatchOver {
            winner_user_id: None,
            reason: EndReason::Tie,
            scores: HashMap::new(),
        };
    };
    let next_index = session.rounds.len() as u32;
    if next_index >= state.rounds_total {
        return conclude(session);
    }
    let remaining: Vec<&Question> = BANK
        .iter()
        .filter(|q| !state.asked_question_ids.iter().any(|id| id == q.id))
        .collect();
    let Some(question) = remaining.choose(&mut rand::thread_rng()) else {
        return conclude(session);
    };
    let payload = RoundPayload::Trivia {
        question_id: question.id.to_owned(),
        options: question.options.iter().map(|s| (*s).to_owned()).collect(),
        correct_index: question.correct_index,
    };
    RoundOutcome::Started(Round::new(next_index as i32, payload, now_ms, now_ms + TIME_LIMIT_MS))
}

fn conclude(session: &Session) -> RoundOutcome {
    let scores: HashMap<_, _> = session.participants.iter().map(|p| (p.user_id.clone(), p.score)).collect();
    let top = session.participants.iter().map(|p| p.score).max().unwrap_or(0);
    let leaders: Vec<_> = session.participants.iter().filter(|p| p.score == top).collect();
    let winner = if leaders.len() == 1 {
        leaders.first().map(|p| p.user_id.clone())
    } else {
        let state = trivia_state(session);
        let medians: Vec<(String, u64)> = leaders
            .iter()
            .map(|p| (p.user_id.clone(), median_response_time(state, &p.user_id)))
            .collect();
        let best = medians.iter().map(|(_, m)| *m).min().unwrap_or(0);
        let on_best: Vec<_> = medians.iter().filter(|(_, m)| *m == best).collect();
        if on_best.len() == 1 {
            Some(on_best[0].0.clone())
        } else {
            None
        }
    };
    RoundOutcome::MatchOver {
        reason: if winner.is_some() { EndReason::Normal } else { EndReason::Tie },
        winner_user_id: winner,
        scores,
    }
}

fn median_response_time(state: Option<&TriviaState>, user_id: &str) -> u64 {
    let Some(state) = state else { return u64::MAX };
    let Some(times) = state.response_times.get(user_id) else {
        return u64::MAX;
    };
    if times.is_empty() {
        return u64::MAX;
    }
    let mut sorted = times.clone();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

pub fn handle_submit(
    session: &mut Session,
    user_id: &str,
    payload: SubmitPayload,
    now_ms: u64,
) -> Result<Outcome, CoreError> {
    let SubmitPayload::Trivia { choice_index } = payload else {
        return Err(ErrorKind::InvalidRequest.into());
    };
    let round_index = session.round_index;
    let Some(round) = session.current_round_mut() else {
        return Err(ErrorKind::RoundNotStarted.into());
    };
    if round.state == RoundState::Done || round.submissions.contains_key(user_id) {
        return Ok(Outcome::new());
    }
    let correct_index = match &round.payload {
        RoundPayload::Trivia { correct_index, .. } => *correct_index,
        _ => return Err(ErrorKind::InvalidRequest.into()),
    };
    let response_time_ms = now_ms.saturating_sub(round.start_ts_ms).min(TIME_LIMIT_MS);
    let correct = choice_index == correct_index;
    round.submissions.insert(
        user_id.to_owned(),
        Submission::Trivia(TriviaSubmission { choice_index, response_time_ms, correct }),
    );

    if let Some(state) = trivia_state_mut(session) {
        state.response_times.entry(user_id.to_owned()).or_default().push(response_time_ms);
    }

    let all_answered = session.participants.iter().filter(|p| p.joined).all(|p| {
        session.current_round().is_some_and(|r| r.submissions.contains_key(&p.user_id))
    });

    let mut out = Outcome::new();
    if correct {
        apply_score_delta(session, user_id, 1, &mut out);
    }
    if all_answered {
        advance_or_end(session, round_index, now_ms, &mut out);
    }
    Ok(out)
}

pub fn handle_round_timeout(session: &mut Session, now_ms: u64) -> Outcome {
    let round_index = session.round_index;
    let mut out = Outcome::new();
    advance_or_end(session, round_index, now_ms, &mut out);
    out
}

fn advance_or_end(session: &mut Session, round_index: i32, now_ms: u64, out: &mut Outcome) {
    finish_round(session, round_index, out);
    if let Some(state) = trivia_state(session) {
        if (session.rounds.len() as u32) < state.rounds_total {
            super::advance_round(session, now_ms, out);
            return;
        }
    }
    match conclude(session) {
        RoundOutcome::MatchOver { winner_user_id, reason, scores } => {
            super::end_session(session, now_ms, reason, winner_user_id, scores, out);
        }
        RoundOutcome::Started(_) => unreachable!("conclude() never starts a round"),
    }
}
