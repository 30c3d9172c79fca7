//! Collaborative Story Builder (spec.md §4.F.5): the one kind that does not
//! fit the round/timer model the other four share. There is no per-turn
//! deadline and no countdown between turns, so `build_round` /
//! `handle_round_timeout` below are unreachable stubs that exist only to
//! satisfy `KindOps`'s fn-pointer shape; the actual lifecycle runs through
//! [`begin_writing`] (called directly from `countdown_elapsed` for this
//! kind) and [`handle_submit`].

use std::collections::HashMap;

use rand::seq::SliceRandom;

use super::{Outcome, RoundOutcome};
use crate::errors::{CoreError, ErrorKind};
use crate::model::{
    ActivityBody, EndReason, Paragraph, ParticipantRole, Phase, Session, StoryRole, StoryState,
};
use crate::wire::{OutboundEvent, RoundEndedPayload, ScoreUpdatedPayload, SubmitPayload};

const PARAGRAPH_CAP: u32 = 3;
const MAX_VOTE: u8 = 10;

#[must_use]
pub fn initial_body() -> StoryState {
    StoryState::default()
}

fn story_state(session: &Session) -> Option<&StoryState> {
    match &session.body {
        ActivityBody::Story(s) => Some(s),
        _ => None,
    }
}

fn story_state_mut(session: &mut Session) -> Option<&mut StoryState> {
    match &mut session.body {
        ActivityBody::Story(s) => Some(s),
        _ => None,
    }
}

fn role_of(session: &Session, user_id: &str) -> Option<StoryRole> {
    match session.participant(user_id)?.role {
        Some(ParticipantRole::Story(r)) => Some(r),
        _ => None,
    }
}

/// One of three pools, chosen deterministically from the pair of roles
/// picked in the lobby; which prompts live in each pool is a content
/// concern the spec leaves external (§1 Non-goals), so a small in-crate
/// stand-in is used here, same as the other kinds' prompt/question banks.
fn prompt_pool_for(roles: (StoryRole, StoryRole)) -> (&'static str, &'static str) {
    match roles {
        (StoryRole::Boy, StoryRole::Boy) => ("same_boy", "Two old friends run into each other at a train station they both thought they'd left behind."),
        (StoryRole::Girl, StoryRole::Girl) => ("same_girl", "Two rivals are snowed in together at a mountain cabin with one working phone line."),
        _ => ("mixed", "A stranger knocks on the door during a blackout, claiming to know the house from before."),
    }
}

/// Countdown elapsed for a story session: pick the prompt pool, randomize
/// turn order, and transition straight to `running` with the writing phase
/// open. Never produces a timer command — story has none.
pub fn begin_writing(session: &mut Session, _now_ms: u64, out: &mut Outcome) {
    let roles = {
        let mut rs: Vec<StoryRole> = session.participants.iter().filter_map(|p| role_of(session, &p.user_id)).collect();
        rs.sort_by_key(|r| matches!(r, StoryRole::Girl));
        (rs.first().copied().unwrap_or(StoryRole::Boy), rs.get(1).copied().unwrap_or(StoryRole::Boy))
    };
    let (pool_name, prompt) = prompt_pool_for(roles);

    let mut order: Vec<String> = session.participants.iter().map(|p| p.user_id.clone()).collect();
    order.shuffle(&mut rand::thread_rng());

    if let Some(state) = story_state_mut(session) {
        state.prompt_pool = pool_name.to_owned();
        state.turn_order = order;
        state.paragraph_cap = PARAGRAPH_CAP;
        state.paragraphs.push(Paragraph {
            author: String::new(),
            index: 0,
            text: prompt.to_owned(),
        });
    }
    session.phase = Phase::Running;
    session.bump_version();
    out.push(OutboundEvent::RoundStarted(crate::wire::RoundStartedPayload {
        session_id: session.id,
        round_index: 0,
        deadline_ms: 0,
    }));
}

/// Unreachable: story sessions enter `running` through [`begin_writing`],
/// never through the generic `advance_round`/`build_round` path.
pub fn build_round(_session: &mut Session, _now_ms: u64) -> RoundOutcome {
    unreachable!("story sessions bypass the generic round lifecycle")
}

/// Unreachable: story has no per-turn or per-round deadline to time out.
pub fn handle_round_timeout(_session: &mut Session, _now_ms: u64) -> Outcome {
    unreachable!("story sessions have no round timer")
}

fn next_writer(session: &Session) -> Option<String> {
    let state = story_state(session)?;
    let written = state.paragraphs.len().saturating_sub(1) as u32; // index 0 is the seed prompt
    if written >= state.turn_order.len() as u32 * state.paragraph_cap {
        return None;
    }
    let turn = written as usize % state.turn_order.len();
    state.turn_order.get(turn).cloned()
}

pub fn handle_submit(
    session: &mut Session,
    user_id: &str,
    payload: SubmitPayload,
    now_ms: u64,
) -> Result<Outcome, CoreError> {
    match payload {
        SubmitPayload::StoryParagraph { paragraph } => submit_paragraph(session, user_id, paragraph),
        SubmitPayload::StoryVote { vote } => submit_vote(session, user_id, vote.paragraph_index, vote.score, now_ms),
        _ => Err(ErrorKind::InvalidRequest.into()),
    }
}

fn submit_paragraph(session: &mut Session, user_id: &str, paragraph: String) -> Result<Outcome, CoreError> {
    if session.phase != Phase::Running {
        return Err(ErrorKind::SessionNotRunning.into());
    }
    let Some(expected) = next_writer(session) else {
        // Cap already reached: silently ignored, same as any other
        // duplicate/late submission (common failure semantics, §4.F).
        return Ok(Outcome::new());
    };
    if expected != user_id {
        return Err(CoreError::new(ErrorKind::InvalidRequest).with_details("not your turn"));
    }

    let index = story_state(session).map_or(0, |s| s.paragraphs.len() as u32);
    let mut out = Outcome::new();
    if let Some(state) = story_state_mut(session) {
        state.paragraphs.push(Paragraph {
            author: user_id.to_owned(),
            index,
            text: paragraph,
        });
    }
    session.bump_version();
    out.push(OutboundEvent::RoundEnded(RoundEndedPayload {
        session_id: session.id,
        round_index: index as i32,
    }));

    if next_writer(session).is_none() {
        session.phase = Phase::Voting;
        session.bump_version();
    }
    Ok(out)
}

fn submit_vote(session: &mut Session, voter: &str, paragraph_index: u32, score: u8, now_ms: u64) -> Result<Outcome, CoreError> {
    if session.phase != Phase::Voting {
        return Err(ErrorKind::SessionNotRunning.into());
    }
    if score > MAX_VOTE {
        return Err(CoreError::new(ErrorKind::InvalidRequest).with_details("score out of range"));
    }
    let author = story_state(session).and_then(|s| s.paragraphs.iter().find(|p| p.index == paragraph_index).map(|p| p.author.clone()));
    let Some(author) = author else {
        return Err(CoreError::new(ErrorKind::InvalidRequest).with_details("unknown paragraph"));
    };
    if author.is_empty() {
        // The seed prompt (index 0) has no author and cannot be voted on.
        return Err(CoreError::new(ErrorKind::InvalidRequest).with_details("paragraph has no author"));
    }
    if author == voter {
        return Err(CoreError::new(ErrorKind::InvalidRequest).with_details("cannot vote on your own paragraph"));
    }

    let already_voted = story_state(session).is_some_and(|s| s.votes.get(voter).is_some_and(|v| v.contains_key(&paragraph_index)));
    if already_voted {
        return Ok(Outcome::new());
    }
    if let Some(state) = story_state_mut(session) {
        state.votes.entry(voter.to_owned()).or_default().insert(paragraph_index, score);
    }
    session.bump_version();

    let mut out = Outcome::new();
    if all_votes_in(session) {
        tally(session, now_ms, &mut out);
    }
    Ok(out)
}

/// Every non-author participant must have voted on every authored
/// paragraph (the seed prompt, index 0, is excluded).
fn all_votes_in(session: &Session) -> bool {
    let Some(state) = story_state(session) else { return false };
    let authored: Vec<&Paragraph> = state.paragraphs.iter().filter(|p| !p.author.is_empty()).collect();
    session.participants.iter().all(|voter| {
        authored
            .iter()
            .filter(|p| p.author != voter.user_id)
            .all(|p| state.votes.get(&voter.user_id).is_some_and(|v| v.contains_key(&p.index)))
    })
}

fn tally(session: &mut Session, now_ms: u64, out: &mut Outcome) {
    let Some(state) = story_state(session) else { return };
    let mut totals: HashMap<String, i64> = HashMap::new();
    for paragraph in state.paragraphs.iter().filter(|p| !p.author.is_empty()) {
        let sum: i64 = state
            .votes
            .values()
            .filter_map(|v| v.get(&paragraph.index))
            .map(|&s| i64::from(s))
            .sum();
        *totals.entry(paragraph.author.clone()).or_insert(0) += sum;
    }
    for p in &session.participants {
        totals.entry(p.user_id.clone()).or_insert(0);
    }

    let top = totals.values().copied().max().unwrap_or(0);
    let leaders: Vec<&String> = totals.iter().filter(|(_, &s)| s == top).map(|(id, _)| id).collect();
    let winner = if leaders.len() == 1 {
        leaders.first().map(|s| (*s).clone())
    } else {
        None
    };

    for (user_id, &score) in &totals {
        if let Some(p) = session.participant_mut(user_id) {
            let delta = score - p.score;
            p.score = score;
            out.push(OutboundEvent::ScoreUpdated(ScoreUpdatedPayload {
                session_id: session.id,
                user_id: user_id.clone(),
                delta,
                score,
            }));
        }
    }

    super::end_session(
        session,
        now_ms,
        if winner.is_some() { EndReason::Normal } else { EndReason::Tie },
        winner,
        totals,
        out,
    );
}
