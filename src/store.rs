//! Session Store (spec.md §4.C).
//!
//! The store itself holds no write discipline beyond handing out the one
//! `Arc<Mutex<Session>>` per session id — the mutex *is* the per-session
//! exclusive-writer lock the Coordinator (§4.G) acquires before any
//! mutation, so "the store is not itself a lock" and "the coordinator is
//! the only legal writer" collapse into the same guarantee: nobody can
//! reach a `Session` except through its mutex.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{Session, SessionStatus};

pub type SessionHandle = Arc<Mutex<Session>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Pending,
    Running,
    Ended,
    All,
}

impl StatusFilter {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "ended" => Some(Self::Ended),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn matches(self, status: SessionStatus) -> bool {
        match self {
            Self::All => true,
            Self::Pending => status == SessionStatus::Pending,
            Self::Running => status == SessionStatus::Running,
            Self::Ended => status == SessionStatus::Ended,
        }
    }
}

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<Uuid, SessionHandle>,
}

impl SessionStore {
    pub fn save(&self, session: Session) -> SessionHandle {
        let id = session.id;
        let handle = Arc::new(Mutex::new(session));
        self.sessions.insert(id, handle.clone());
        handle
    }

    #[must_use]
    pub fn load(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.clone())
    }

    pub fn delete(&self, id: Uuid) {
        self.sessions.remove(&id);
    }

    /// Snapshots every session's `(id, status, created_at_ms, ended_at_ms)`
    /// matching `filter`. Takes a brief lock per session to read it.
    pub async fn list(&self, filter: StatusFilter) -> Vec<Session> {
        let handles: Vec<SessionHandle> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let session = handle.lock().await;
            if filter.matches(session.status) {
                out.push(session.clone());
            }
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
