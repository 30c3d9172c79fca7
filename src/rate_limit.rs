//! Rate Limiter (spec.md §4.B): a sliding-window admission check shared
//! across sessions. Keys are opaque strings; the core uses
//! `submit:<sessionId>:<userId>`, `qt_submit:<sessionId>:<userId>`, and
//! `session.create:<userId>` (see `rate_limit::keys`).

use std::collections::VecDeque;
use std::time::Duration;

use clap::Parser;
use dashmap::DashMap;
use tokio::time::Instant;

fn duration_from_secs_str(value: &str) -> Result<Duration, std::num::ParseIntError> {
    Ok(Duration::from_secs(value.parse()?))
}

/// Component options for the Rate Limiter (spec.md §4.B). The window
/// shapes are fixed by spec; these exist so tests (and, if ever needed,
/// an operator) can tune them without touching call sites.
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
pub struct RateLimitOptions {
    #[clap(long, env, default_value = "5")]
    pub submit_limit: usize,
    #[clap(long, env, value_parser=duration_from_secs_str, default_value = "2")]
    pub submit_window: Duration,
    #[clap(long, env, default_value = "1")]
    pub trivia_submit_limit: usize,
    #[clap(long, env, value_parser=duration_from_secs_str, default_value = "5")]
    pub trivia_submit_window: Duration,
    #[clap(long, env, default_value = "20")]
    pub session_create_limit: usize,
    #[clap(long, env, value_parser=duration_from_secs_str, default_value = "60")]
    pub session_create_window: Duration,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            submit_limit: 5,
            submit_window: Duration::from_secs(2),
            trivia_submit_limit: 1,
            trivia_submit_window: Duration::from_secs(5),
            session_create_limit: 20,
            session_create_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ok,
    Exceeded,
}

impl Admission {
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Sliding-window rate limiter: at most `limit` admitted events with
/// timestamps in the last `window` for a given key.
#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> Admission {
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_owned()).or_default();
        while matches!(entry.front(), Some(t) if now.duration_since(*t) > window) {
            entry.pop_front();
        }
        if entry.len() >= limit {
            return Admission::Exceeded;
        }
        entry.push_back(now);
        Admission::Ok
    }
}

/// Canonical rate-limit key builders, keeping the literal key shapes in one
/// place rather than scattered string formats across call sites.
pub mod keys {
    use uuid::Uuid;

    pub fn submit(session_id: Uuid, user_id: &str) -> String {
        format!("submit:{session_id}:{user_id}")
    }

    pub fn trivia_submit(session_id: Uuid, user_id: &str) -> String {
        format!("qt_submit:{session_id}:{user_id}")
    }

    pub fn session_create(user_id: &str) -> String {
        format!("session.create:{user_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::default();
        let window = Duration::from_millis(2000);
        for _ in 0..5 {
            assert!(limiter.check("k", 5, window).is_ok());
        }
        assert_eq!(limiter.check("k", 5, window), Admission::Exceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_forward() {
        let limiter = RateLimiter::default();
        let window = Duration::from_millis(1000);
        assert!(limiter.check("k", 1, window).is_ok());
        assert_eq!(limiter.check("k", 1, window), Admission::Exceeded);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.check("k", 1, window).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::default();
        let window = Duration::from_millis(1000);
        assert!(limiter.check("a", 1, window).is_ok());
        assert!(limiter.check("b", 1, window).is_ok());
    }
}
