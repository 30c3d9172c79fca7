//! Session Coordinator (spec.md §4.G): the single serialized writer per
//! session. Owns every shared component (Store, Scheduler, Rate Limiter,
//! Permit Registry, Socket Hub, Clock) and is the only thing allowed to turn
//! an activity machine's [`Outcome`](crate::activities::Outcome) into
//! concrete timer arms and socket publishes. Every public method here
//! acquires the target session's own `Mutex` (via `SessionStore`) and holds
//! it for the duration of one command, which is what makes "single
//! serialized writer per session" true without a global lock.
//!
//! Self-referential by construction: the Scheduler's fire callback needs to
//! call back into the very Coordinator that owns the Scheduler, which does
//! not exist yet at the point `Scheduler::new` is called. `Arc::new_cyclic`
//! closes that loop with a `Weak` that only gets upgraded once construction
//! has finished.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use clap::Parser;
use tracing::info;
use uuid::Uuid;

use crate::activities::{self, Outcome, TimerCmd};
use crate::clock::{self, Clock, Scheduler, SchedulerOptions};
use crate::errors::{CoreError, ErrorKind};
use crate::model::{ActivityBody, ActivityKind, Participant, Phase, Session, SessionStatus};
use crate::permits::{Consumption, PermitOptions, PermitRegistry};
use crate::rate_limit::{self, Admission, RateLimiter, RateLimitOptions};
use crate::socket_hub::SocketHub;
use crate::store::{SessionHandle, SessionStore, StatusFilter};
use crate::wire::{AuthContext, OutboundEvent, PongPayload, SessionIdPayload, SubmitPayload};

fn duration_from_secs_str(value: &str) -> Result<Duration, std::num::ParseIntError> {
    Ok(Duration::from_secs(value.parse()?))
}

/// Component options for session lifecycle bounds (spec.md §3, §8).
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
pub struct SessionOptions {
    /// Per-creator cap on concurrently pending (not yet running) sessions.
    #[clap(long, env, default_value = "3")]
    pub max_pending_per_creator: usize,
    /// How long an ended session is retained before the janitor deletes it,
    /// in seconds.
    #[clap(long, env, value_parser=duration_from_secs_str, default_value = "3600")]
    pub ended_retention: Duration,
    /// How long a session may sit in `pending` before the janitor deletes
    /// it, in seconds.
    #[clap(long, env, value_parser=duration_from_secs_str, default_value = "86400")]
    pub pending_retention: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_pending_per_creator: 3,
            ended_retention: Duration::from_secs(3600),
            pending_retention: Duration::from_secs(86_400),
        }
    }
}

/// The Coordinator's assembled configuration: the flattened union of every
/// component's own options (spec_full.md §A.3). `main.rs` builds one of
/// these from the top-level `clap::Parser` `Options` and passes it to
/// `Coordinator::new`; tests use `CoordinatorOptions::default()`.
#[derive(Clone, Debug, Default)]
pub struct CoordinatorOptions {
    pub scheduler: SchedulerOptions,
    pub rate_limit: RateLimitOptions,
    pub session: SessionOptions,
    pub permits: PermitOptions,
}

enum TimerFire {
    Countdown,
    Watchdog,
    RoundGap,
    RoundTimeout(i32),
}

pub struct Coordinator {
    store: SessionStore,
    scheduler: Scheduler,
    rate_limiter: RateLimiter,
    permits: PermitRegistry,
    sockets: SocketHub,
    clock: Clock,
    options: CoordinatorOptions,
}

impl Coordinator {
    #[must_use]
    pub fn new(options: CoordinatorOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            Self {
                store: SessionStore::default(),
                scheduler: Scheduler::new(move |key_id, round_index| {
                    let Some(this) = weak.upgrade() else {
                        return;
                    };
                    tokio::spawn(async move {
                        this.on_timer_fired(key_id, round_index).await;
                    });
                }),
                rate_limiter: RateLimiter::default(),
                permits: PermitRegistry::default(),
                sockets: SocketHub::default(),
                clock: Clock::default(),
                options,
            }
        })
    }

    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[must_use]
    pub fn sockets(&self) -> &SocketHub {
        &self.sockets
    }

    #[must_use]
    pub fn permits(&self) -> &PermitRegistry {
        &self.permits
    }

    #[must_use]
    pub fn permit_ttl(&self) -> Duration {
        self.options.permits.permit_ttl
    }

    // -------------------------------------------------------------
    // Timer dispatch (§4.A): the Scheduler's only caller-facing contract
    // is `on_elapsed(key, roundIndex)`; this is where that gets decoded
    // back into the right activity-machine entry point.
    // -------------------------------------------------------------

    async fn on_timer_fired(&self, key_id: Uuid, round_index: i32) {
        let (session_id, fire) = if round_index == clock::ROUND_WATCHDOG {
            (clock::watchdog_key(key_id), TimerFire::Watchdog)
        } else if round_index == clock::ROUND_COUNTDOWN {
            (key_id, TimerFire::Countdown)
        } else if round_index == clock::ROUND_GAP {
            (key_id, TimerFire::RoundGap)
        } else {
            (key_id, TimerFire::RoundTimeout(round_index))
        };

        let Some(handle) = self.store.load(session_id) else {
            return;
        };
        let mut session = handle.lock().await;
        let now_ms = self.clock.now_ms();
        let outcome = match fire {
            TimerFire::Watchdog => activities::watchdog_elapsed(&mut session, now_ms),
            TimerFire::Countdown => activities::countdown_elapsed(&mut session, now_ms),
            TimerFire::RoundGap => activities::round_gap_elapsed(&mut session, now_ms),
            TimerFire::RoundTimeout(idx) => activities::round_timer_elapsed(&mut session, idx, now_ms),
        };
        self.apply_outcome(&session, outcome);
    }

    /// Translates one [`Outcome`] into the concrete Scheduler/SocketHub
    /// calls it names, while the caller still holds the session's lock —
    /// so reading `session.round_index`/`session.id` here is safe without
    /// threading those values separately through `Outcome`.
    fn apply_outcome(&self, session: &Session, outcome: Outcome) {
        for event in &outcome.events {
            self.sockets.publish(session.id, event);
        }
        match outcome.timer {
            TimerCmd::None => {}
            TimerCmd::ArmCountdown { delay_ms } => {
                self.scheduler
                    .schedule(session.id, clock::ROUND_COUNTDOWN, Duration::from_millis(delay_ms));
            }
            TimerCmd::CancelCountdown => self.scheduler.cancel(session.id),
            TimerCmd::ArmRound { delay_ms } => {
                self.scheduler
                    .schedule(session.id, session.round_index, Duration::from_millis(delay_ms));
            }
            TimerCmd::ArmRoundGap { delay_ms } => {
                self.scheduler
                    .schedule(session.id, clock::ROUND_GAP, Duration::from_millis(delay_ms));
            }
            TimerCmd::CancelAll => self.scheduler.forget(session.id),
        }
        if outcome.rearm_watchdog {
            self.scheduler.schedule(
                clock::watchdog_key(session.id),
                clock::ROUND_WATCHDOG,
                self.options.scheduler.watchdog_timeout,
            );
        }
    }

    // -------------------------------------------------------------
    // External command surface (§4.G, §6.1)
    // -------------------------------------------------------------

    /// `create` (HTTP): the caller must be the named creator (or admin);
    /// participants must be exactly two unique ids; the creator's rate
    /// limit and pending-session cap must both be satisfied.
    pub async fn create_session(
        &self,
        activity_key: &str,
        creator_user_id: &str,
        participants: Vec<String>,
        caller: &AuthContext,
    ) -> Result<Uuid, CoreError> {
        if caller.user_id != creator_user_id && !caller.admin {
            return Err(ErrorKind::Forbidden.into());
        }
        let kind =
            crate::wire::activity_kind_required(activity_key).ok_or(ErrorKind::UnsupportedActivity)?;

        let mut unique = participants.clone();
        unique.sort_unstable();
        unique.dedup();
        if participants.len() != 2 || unique.len() != 2 {
            return Err(ErrorKind::InvalidParticipants.into());
        }

        if self
            .rate_limiter
            .check(
                &rate_limit::keys::session_create(creator_user_id),
                self.options.rate_limit.session_create_limit,
                self.options.rate_limit.session_create_window,
            )
            == Admission::Exceeded
        {
            return Err(ErrorKind::RateLimitExceeded.into());
        }
        let pending_for_creator = self
            .store
            .list(StatusFilter::Pending)
            .await
            .iter()
            .filter(|s| s.creator == creator_user_id)
            .count();
        if pending_for_creator >= self.options.session.max_pending_per_creator {
            return Err(ErrorKind::RateLimitExceeded.into());
        }

        let now_ms = self.clock.now_ms();
        let id = Uuid::new_v4();
        let session = Session {
            id,
            kind,
            status: SessionStatus::Pending,
            phase: Phase::Lobby,
            creator: creator_user_id.to_owned(),
            participants: participants.into_iter().map(Participant::new).collect(),
            round_index: 0,
            rounds: Vec::new(),
            body: initial_body(kind),
            created_at_ms: now_ms,
            ended_at_ms: None,
            leave_reason: None,
            version: 0,
            stats_recorded: false,
            winner_user_id: None,
            end_reason: None,
            clock_skew_ms: HashMap::new(),
            last_activity_ms: now_ms,
        };
        self.store.save(session);
        // `session.created` is not part of the websocket event vocabulary
        // (§6.2's closed type list) — there is no socket to publish it to
        // before a join has ever happened, so this is a log only.
        info!(session_id = %id, activity_key, "session.created");
        Ok(id)
    }

    #[must_use]
    pub async fn list_sessions(&self, filter: StatusFilter) -> Vec<Session> {
        self.store.list(filter).await
    }

    pub fn load(&self, session_id: Uuid) -> Result<SessionHandle, CoreError> {
        self.store.load(session_id).ok_or_else(|| ErrorKind::SessionNotFound.into())
    }

    /// `join` (HTTP): marks the caller joined and grants a one-time
    /// websocket-attach permit.
    pub async fn join(&self, session_id: Uuid, user_id: &str, caller: &AuthContext) -> Result<(), CoreError> {
        crate::auth::require_self_or_admin(caller, user_id)?;
        let handle = self.load(session_id)?;
        let mut session = handle.lock().await;
        if session.status == SessionStatus::Ended {
            return Err(ErrorKind::SessionStateMissing.into());
        }
        if !session.is_participant(user_id) {
            return Err(ErrorKind::ParticipantNotInSession.into());
        }
        let was_joined = session.participant(user_id).is_some_and(|p| p.joined);
        if let Some(p) = session.participant_mut(user_id) {
            p.joined = true;
        }
        session.bump_version();
        self.permits.grant(session_id, user_id, self.options.permits.permit_ttl);

        if !was_joined {
            let event = OutboundEvent::Presence(crate::wire::PresencePayload {
                session_id,
                user_id: user_id.to_owned(),
                joined: true,
                ready: session.participant(user_id).is_some_and(|p| p.ready),
            });
            self.sockets.publish(session_id, &event);
        }
        Ok(())
    }

    /// `leave` (HTTP).
    pub async fn leave(&self, session_id: Uuid, user_id: &str, caller: &AuthContext) -> Result<(), CoreError> {
        crate::auth::require_self_or_admin(caller, user_id)?;
        let handle = self.load(session_id)?;
        let mut session = handle.lock().await;
        let now_ms = self.clock.now_ms();
        let outcome = activities::leave(&mut session, user_id, now_ms);
        self.apply_outcome(&session, outcome);
        Ok(())
    }

    /// `ready(on/off)` (HTTP).
    pub async fn ready(
        &self,
        session_id: Uuid,
        user_id: &str,
        ready: bool,
        role: Option<String>,
        caller: &AuthContext,
    ) -> Result<(), CoreError> {
        crate::auth::require_self_or_admin(caller, user_id)?;
        let handle = self.load(session_id)?;
        let mut session = handle.lock().await;
        let outcome = activities::ready(&mut session, user_id, ready, role)?;
        self.apply_outcome(&session, outcome);
        Ok(())
    }

    /// `start` (HTTP): creator or admin forces countdown regardless of
    /// readiness.
    pub async fn force_start(&self, session_id: Uuid, caller: &AuthContext) -> Result<(), CoreError> {
        let handle = self.load(session_id)?;
        let mut session = handle.lock().await;
        let outcome = activities::force_start(&mut session, &caller.user_id, caller.admin)?;
        self.apply_outcome(&session, outcome);
        Ok(())
    }

    /// `submit` (WS): activity-specific admission, gated by the
    /// submission-class rate limit (typing/trivia only — see §4.B).
    pub async fn submit(
        &self,
        session_id: Uuid,
        user_id: &str,
        payload: SubmitPayload,
    ) -> Result<(), CoreError> {
        let handle = self.load(session_id)?;
        let mut session = handle.lock().await;

        let rate_key = match (&payload, session.kind) {
            (SubmitPayload::Typing { .. }, ActivityKind::TypingDuel) => Some((
                rate_limit::keys::submit(session_id, user_id),
                self.options.rate_limit.submit_limit,
                self.options.rate_limit.submit_window,
            )),
            (SubmitPayload::Trivia { .. }, ActivityKind::Trivia) => Some((
                rate_limit::keys::trivia_submit(session_id, user_id),
                self.options.rate_limit.trivia_submit_limit,
                self.options.rate_limit.trivia_submit_window,
            )),
            _ => None,
        };
        if let Some((key, limit, window)) = rate_key {
            if self.rate_limiter.check(&key, limit, window) == Admission::Exceeded {
                return Err(ErrorKind::RateLimitExceeded.into());
            }
        }

        let now_ms = self.clock.now_ms();
        let outcome = activities::submit(&mut session, user_id, payload, now_ms)?;
        self.apply_outcome(&session, outcome);
        Ok(())
    }

    /// `keystroke` (WS, typing only).
    pub async fn keystroke(
        &self,
        session_id: Uuid,
        user_id: &str,
        client_time_ms: u64,
        length: u32,
        paste: bool,
    ) -> Result<(), CoreError> {
        let handle = self.load(session_id)?;
        let mut session = handle.lock().await;
        let now_ms = self.clock.now_ms();
        let outcome = activities::keystroke(&mut session, user_id, client_time_ms, length, paste, now_ms)?;
        self.apply_outcome(&session, outcome);
        Ok(())
    }

    /// `ping` (WS, always admitted): refreshes skew and returns the pong
    /// payload directly, since ping never produces an `Outcome` (it never
    /// touches timers or the event stream).
    pub async fn ping(&self, session_id: Uuid, user_id: &str, client_time_ms: u64) -> Result<PongPayload, CoreError> {
        let handle = self.load(session_id)?;
        let mut session = handle.lock().await;
        if !session.is_participant(user_id) {
            return Err(ErrorKind::ParticipantNotInSession.into());
        }
        let now_ms = self.clock.now_ms();
        let skew_ms = activities::ping(&mut session, user_id, client_time_ms, now_ms);
        Ok(PongPayload {
            server_time_ms: now_ms,
            skew_ms,
        })
    }

    // -------------------------------------------------------------
    // Websocket attach (§6.2): not itself a §4.G command, but it is the
    // one place permit consumption, socket registration, and the initial
    // snapshot have to happen atomically under the session lock.
    // -------------------------------------------------------------

    /// Consumes a join permit and attaches a socket for `(session_id,
    /// user_id)`, sending the initial `session.snapshot` frame on success.
    /// `Err(Forbidden)` here is the signal for the caller to close with
    /// `4403 not_joined`.
    pub async fn attach_stream(
        &self,
        session_id: Uuid,
        user_id: &str,
    ) -> Result<(Uuid, tokio::sync::mpsc::Receiver<axum::extract::ws::Message>), CoreError> {
        let handle = self.load(session_id)?;
        if self.permits.consume(session_id, user_id) == Consumption::Absent
            && !self.sockets.user_has_socket(session_id, user_id)
        {
            return Err(ErrorKind::NotJoined.into());
        }
        let (socket_id, rx) = self.sockets.attach(session_id, user_id);
        let session = handle.lock().await;
        self.sockets
            .send_one(session_id, socket_id, &OutboundEvent::SessionSnapshot(Box::new(session.clone())));
        Ok((socket_id, rx))
    }

    pub fn detach_stream(&self, session_id: Uuid, socket_id: Uuid) {
        self.sockets.detach(session_id, socket_id);
    }

    // -------------------------------------------------------------
    // Janitor support (§2 Lifecycle): sweep sessions and permits past
    // their retention window. Called periodically from `main.rs`, never
    // from inside a command handler.
    // -------------------------------------------------------------

    /// Drops sessions ended more than an hour ago, or still pending 24h
    /// after creation, per the Lifecycle note in §3. Also clears their
    /// timer/socket bookkeeping so nothing leaks.
    pub async fn sweep_expired_sessions(&self, now_ms: u64) {
        let ended_retention_ms = self.options.session.ended_retention.as_millis() as u64;
        let pending_retention_ms = self.options.session.pending_retention.as_millis() as u64;

        let expired: Vec<Uuid> = self
            .store
            .list(StatusFilter::All)
            .await
            .into_iter()
            .filter(|s| {
                let ended_expired = s
                    .ended_at_ms
                    .is_some_and(|ended| now_ms.saturating_sub(ended) > ended_retention_ms);
                let pending_expired =
                    s.status == SessionStatus::Pending && now_ms.saturating_sub(s.created_at_ms) > pending_retention_ms;
                ended_expired || pending_expired
            })
            .map(|s| s.id)
            .collect();

        for id in expired {
            self.scheduler.forget(id);
            self.sockets.forget_session(id);
            self.store.delete(id);
        }
        self.permits.sweep_expired();
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.store.len()
    }
}

fn initial_body(kind: ActivityKind) -> ActivityBody {
    match kind {
        ActivityKind::TypingDuel => ActivityBody::Typing(activities::typing::initial_body()),
        ActivityKind::Trivia => ActivityBody::Trivia(activities::trivia::initial_body()),
        ActivityKind::Rps => ActivityBody::Rps(activities::rps::initial_body()),
        ActivityKind::TicTacToe => ActivityBody::TicTacToe(activities::tictactoe::initial_body()),
        ActivityKind::Story => ActivityBody::Story(activities::story::initial_body()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin_ctx(user_id: &str) -> AuthContext {
        AuthContext {
            user_id: user_id.to_owned(),
            admin: false,
        }
    }

    #[tokio::test]
    async fn create_rejects_wrong_participant_count() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        let caller = admin_ctx("alice");
        let err = coordinator
            .create_session("typing_duel", "alice", vec!["alice".into()], &caller)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParticipants);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_participants() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        let caller = admin_ctx("alice");
        let err = coordinator
            .create_session("typing_duel", "alice", vec!["alice".into(), "alice".into()], &caller)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParticipants);
    }

    #[tokio::test]
    async fn create_rejects_unsupported_activity() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        let caller = admin_ctx("alice");
        let err = coordinator
            .create_session("chess", "alice", vec!["alice".into(), "bob".into()], &caller)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedActivity);
    }

    #[tokio::test]
    async fn fourth_pending_session_hits_cap() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        let caller = admin_ctx("alice");
        for _ in 0..3 {
            coordinator
                .create_session("typing_duel", "alice", vec!["alice".into(), "bob".into()], &caller)
                .await
                .unwrap();
        }
        let err = coordinator
            .create_session("typing_duel", "alice", vec!["alice".into(), "bob".into()], &caller)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimitExceeded);
    }

    #[tokio::test]
    async fn join_grants_permit_consumed_on_attach() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        let caller = admin_ctx("alice");
        let id = coordinator
            .create_session("typing_duel", "alice", vec!["alice".into(), "bob".into()], &caller)
            .await
            .unwrap();
        coordinator.join(id, "alice", &caller).await.unwrap();
        let (_socket_id, _rx) = coordinator.attach_stream(id, "alice").await.unwrap();
    }

    #[tokio::test]
    async fn attach_without_join_is_not_joined() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        let caller = admin_ctx("alice");
        let id = coordinator
            .create_session("typing_duel", "alice", vec!["alice".into(), "bob".into()], &caller)
            .await
            .unwrap();
        let err = coordinator.attach_stream(id, "bob").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotJoined);
    }

    #[tokio::test]
    async fn ready_both_sides_enters_countdown() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        let caller = admin_ctx("alice");
        let id = coordinator
            .create_session("typing_duel", "alice", vec!["alice".into(), "bob".into()], &caller)
            .await
            .unwrap();
        coordinator.join(id, "alice", &caller).await.unwrap();
        coordinator.join(id, "bob", &admin_ctx("bob")).await.unwrap();
        coordinator.ready(id, "alice", true, None, &caller).await.unwrap();
        coordinator.ready(id, "bob", true, None, &admin_ctx("bob")).await.unwrap();

        let handle = coordinator.load(id).unwrap();
        let session = handle.lock().await;
        assert_eq!(session.phase, Phase::Countdown);
    }
}
