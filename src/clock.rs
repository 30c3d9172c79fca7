//! Clock & Scheduler (spec.md §4.A).
//!
//! `Clock::now_ms` is a monotonic millisecond counter anchored at process
//! start. `Scheduler` arms one-shot timers keyed by `(session_id,
//! round_index)`; re-arming for a session cancels whatever was previously
//! pending for that session, and a handle's `cancel()` after the timer has
//! already fired is a no-op.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use clap::Parser;
use dashmap::DashMap;
use tokio::time::Instant as TokioInstant;
use uuid::Uuid;

/// Round index reserved for the lobby countdown timer.
pub const ROUND_COUNTDOWN: i32 = -1;
/// Round index reserved for the inactivity watchdog.
pub const ROUND_WATCHDOG: i32 = -2;
/// Round index reserved for the gap between rounds (rps/tic-tac-toe).
pub const ROUND_GAP: i32 = -3;

fn duration_from_secs_str(value: &str) -> Result<Duration, std::num::ParseIntError> {
    Ok(Duration::from_secs(value.parse()?))
}

/// Component options for the Scheduler (spec.md §4.A). The per-kind
/// countdown durations are fixed by spec and live in `activities::mod`;
/// only the one wall-clock deadline the Scheduler itself is configured
/// with — the inactivity watchdog — is exposed here.
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
pub struct SchedulerOptions {
    /// Inactivity watchdog timeout, in seconds.
    #[clap(long, env, value_parser=duration_from_secs_str, default_value = "120")]
    pub watchdog_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Clone)]
pub struct Clock {
    origin: TokioInstant,
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            origin: TokioInstant::now(),
        }
    }
}

impl Clock {
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

type ElapsedCallback = Arc<dyn Fn(Uuid, i32) + Send + Sync>;

/// Tracks, per session, the generation of the most recently armed timer.
/// A fired or cancelled timer compares its own generation against this
/// value; a mismatch means it has been superseded or cancelled.
#[derive(Default)]
struct SessionGeneration {
    current: AtomicU64,
}

pub struct Scheduler {
    generations: DashMap<Uuid, Arc<SessionGeneration>>,
    on_elapsed: ElapsedCallback,
}

/// A handle to a pending timer. Dropping it does not cancel the timer;
/// call `cancel()` explicitly.
pub struct TimerHandle {
    generation_cell: Arc<SessionGeneration>,
    my_generation: u64,
}

impl TimerHandle {
    /// Cancels the timer if it is still the most recently armed one for its
    /// session. A no-op if it already fired or was already superseded.
    pub fn cancel(&self) {
        let _ = self.generation_cell.current.compare_exchange(
            self.my_generation,
            self.my_generation.wrapping_add(1),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

impl Scheduler {
    /// Builds a scheduler that invokes `on_elapsed(session_id, round_index)`
    /// exactly once per successful fire. The callback must not block; the
    /// scheduler runs it on its own spawned task, never under any lock it
    /// holds, so the callback is free to reacquire the session's own lock.
    pub fn new(on_elapsed: impl Fn(Uuid, i32) + Send + Sync + 'static) -> Self {
        Self {
            generations: DashMap::new(),
            on_elapsed: Arc::new(on_elapsed),
        }
    }

    /// Arms a one-shot timer for `(session_id, round_index)` to fire after
    /// `delay`. Any timer previously armed for `session_id` (regardless of
    /// round index) is superseded and will not fire.
    pub fn schedule(&self, session_id: Uuid, round_index: i32, delay: Duration) -> TimerHandle {
        let cell = self
            .generations
            .entry(session_id)
            .or_insert_with(|| Arc::new(SessionGeneration::default()))
            .clone();
        let my_generation = cell.current.fetch_add(1, Ordering::SeqCst) + 1;

        let on_elapsed = self.on_elapsed.clone();
        let cell_for_task = cell.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if cell_for_task.current.load(Ordering::SeqCst) == my_generation {
                on_elapsed(session_id, round_index);
            }
        });

        TimerHandle {
            generation_cell: cell,
            my_generation,
        }
    }

    /// Cancels whatever timer is currently pending under `key`, without
    /// arming a replacement. Used for `TimerCmd::CancelCountdown`/`CancelAll`,
    /// where the coordinator wants a key's slot cleared but has nothing new
    /// to schedule in its place.
    pub fn cancel(&self, key: Uuid) {
        if let Some(cell) = self.generations.get(&key) {
            cell.current.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drops all bookkeeping for a session once it is no longer live.
    pub fn forget(&self, session_id: Uuid) {
        self.generations.remove(&session_id);
        self.generations.remove(&watchdog_key(session_id));
    }
}

/// The inactivity watchdog (round index `ROUND_WATCHDOG`) must keep ticking
/// independently of round/countdown timers racing on the same session, but
/// `Scheduler` only tracks one pending fire per key. Deriving a second,
/// stable key per session gives the watchdog its own slot without teaching
/// `Scheduler` about two timer classes.
#[must_use]
pub fn watchdog_key(session_id: Uuid) -> Uuid {
    let mut bytes = *session_id.as_bytes();
    for b in &mut bytes {
        *b ^= 0xA5;
    }
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<(Uuid, i32)>>>, Scheduler) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        let scheduler = Scheduler::new(move |id, round| {
            fired_clone.lock().unwrap().push((id, round));
        });
        (fired, scheduler)
    }

    #[tokio::test]
    async fn fires_after_delay() {
        let (fired, scheduler) = recorder();
        let session = Uuid::new_v4();
        scheduler.schedule(session, ROUND_COUNTDOWN, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.lock().unwrap().as_slice(), &[(session, ROUND_COUNTDOWN)]);
    }

    #[tokio::test]
    async fn cancel_before_fire_suppresses_callback() {
        let (fired, scheduler) = recorder();
        let session = Uuid::new_v4();
        let handle = scheduler.schedule(session, 0, Duration::from_millis(30));
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rescheduling_cancels_prior_timer() {
        let (fired, scheduler) = recorder();
        let session = Uuid::new_v4();
        scheduler.schedule(session, 0, Duration::from_millis(10));
        // Immediately supersede before the first has a chance to fire.
        scheduler.schedule(session, 1, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.lock().unwrap().as_slice(), &[(session, 1)]);
    }

    #[tokio::test]
    async fn scheduler_cancel_suppresses_pending_fire() {
        let (fired, scheduler) = recorder();
        let session = Uuid::new_v4();
        scheduler.schedule(session, 0, Duration::from_millis(30));
        scheduler.cancel(session);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_after_fire_is_noop() {
        let (fired, scheduler) = recorder();
        let session = Uuid::new_v4();
        let handle = scheduler.schedule(session, 0, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(40)).await;
        handle.cancel();
        assert_eq!(fired.lock().unwrap().len(), 1);
    }
}
