//! Permit Registry (spec.md §4.E): short-lived, single-use tokens proving an
//! HTTP join preceded a websocket attach. `grant` records one, `consume`
//! atomically removes it; permits left unconsumed expire silently.

use std::time::Duration;

use clap::Parser;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

fn duration_from_secs_str(value: &str) -> Result<Duration, std::num::ParseIntError> {
    Ok(Duration::from_secs(value.parse()?))
}

/// Component options for the Permit Registry (spec.md §4.E).
#[derive(Clone, Debug, PartialEq, Eq, Parser)]
pub struct PermitOptions {
    /// How long a granted join permit stays consumable before it silently
    /// expires, in seconds.
    #[clap(long, env, value_parser=duration_from_secs_str, default_value = "60")]
    pub permit_ttl: Duration,
}

impl Default for PermitOptions {
    fn default() -> Self {
        Self {
            permit_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PermitKey {
    session_id: Uuid,
    user_id: u64,
}

fn hash_user_id(user_id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumption {
    Granted,
    Absent,
}

#[derive(Default)]
pub struct PermitRegistry {
    permits: DashMap<PermitKey, Instant>,
}

impl PermitRegistry {
    pub fn grant(&self, session_id: Uuid, user_id: &str, ttl: Duration) {
        let key = PermitKey {
            session_id,
            user_id: hash_user_id(user_id),
        };
        self.permits.insert(key, Instant::now() + ttl);
    }

    /// Atomically removes the permit for `(session_id, user_id)` if present
    /// and not yet expired.
    pub fn consume(&self, session_id: Uuid, user_id: &str) -> Consumption {
        let key = PermitKey {
            session_id,
            user_id: hash_user_id(user_id),
        };
        match self.permits.remove(&key) {
            Some((_, expires_at)) if expires_at > Instant::now() => Consumption::Granted,
            _ => Consumption::Absent,
        }
    }

    /// Drops expired-but-unconsumed permits. Called periodically by the
    /// janitor; correctness does not depend on this running, since `consume`
    /// already treats an expired entry as absent.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.permits.retain(|_, expires_at| *expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn consume_requires_prior_grant() {
        let registry = PermitRegistry::default();
        let session = Uuid::new_v4();
        assert_eq!(registry.consume(session, "u1"), Consumption::Absent);

        registry.grant(session, "u1", Duration::from_secs(60));
        assert_eq!(registry.consume(session, "u1"), Consumption::Granted);
        // single-use: a second consume fails.
        assert_eq!(registry.consume(session, "u1"), Consumption::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn permits_expire_silently() {
        let registry = PermitRegistry::default();
        let session = Uuid::new_v4();
        registry.grant(session, "u1", Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.consume(session, "u1"), Consumption::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_entries() {
        let registry = PermitRegistry::default();
        let session = Uuid::new_v4();
        registry.grant(session, "u1", Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        registry.sweep_expired();
        assert!(registry.permits.is_empty());
    }
}
