//! Socket Hub (spec.md §4.D): the registry of live sockets per session.
//!
//! Each attached socket is represented by a bounded outbound queue; the
//! actual websocket write loop lives in the connection task (see
//! `api::ws`), which drains the queue and writes to the real socket.
//! `publish` is synchronous and non-blocking: it enqueues to every attached
//! socket's queue in call order, dropping (and detaching) any socket whose
//! queue is full or closed, so one slow reader can never stall the
//! coordinator or its session-mates (§5 backpressure).

use axum::extract::ws::Message;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Bound on a single socket's outbound queue. Exceeding it drops the socket
/// rather than blocking the publisher.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

struct Socket {
    user_id: String,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
pub struct SocketHub {
    sessions: DashMap<Uuid, DashMap<Uuid, Socket>>,
}

impl SocketHub {
    /// Registers a new socket for `session_id` and returns its id plus the
    /// receiving half the connection task should drain and write out.
    pub fn attach(&self, session_id: Uuid, user_id: &str) -> (Uuid, mpsc::Receiver<Message>) {
        let socket_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        self.sessions
            .entry(session_id)
            .or_default()
            .insert(socket_id, Socket {
                user_id: user_id.to_owned(),
                tx,
            });
        (socket_id, rx)
    }

    pub fn detach(&self, session_id: Uuid, socket_id: Uuid) {
        if let Some(sockets) = self.sessions.get(&session_id) {
            sockets.remove(&socket_id);
        }
    }

    /// True if `user_id` still has at least one attached socket in the
    /// session (used by the coordinator to distinguish a clean detach from
    /// the participant's last socket closing).
    pub fn user_has_socket(&self, session_id: Uuid, user_id: &str) -> bool {
        self.sessions
            .get(&session_id)
            .map(|sockets| sockets.iter().any(|s| s.user_id == user_id))
            .unwrap_or(false)
    }

    /// Serializes `event` once and writes it to every socket attached to
    /// `session_id`, in attachment-iteration order. A full or closed queue
    /// detaches that socket; other recipients are unaffected.
    pub fn publish(&self, session_id: Uuid, event: &impl Serialize) {
        let Ok(text) = serde_json::to_string(event) else {
            debug!(%session_id, "failed to serialize event for publish");
            return;
        };
        let message = Message::Text(text);

        let Some(sockets) = self.sessions.get(&session_id) else {
            return;
        };
        let mut dead = Vec::new();
        for entry in sockets.iter() {
            if entry.tx.try_send(message.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        drop(sockets);
        if !dead.is_empty() {
            if let Some(sockets) = self.sessions.get(&session_id) {
                for id in dead {
                    sockets.remove(&id);
                }
            }
        }
    }

    /// Sends `event` to a single socket (used for the initial
    /// `session.snapshot`). Silently drops on a full or closed queue.
    pub fn send_one(&self, session_id: Uuid, socket_id: Uuid, event: &impl Serialize) {
        let Ok(text) = serde_json::to_string(event) else {
            return;
        };
        if let Some(sockets) = self.sessions.get(&session_id) {
            if let Some(socket) = sockets.get(&socket_id) {
                let _ = socket.tx.try_send(Message::Text(text));
            }
        }
    }

    pub fn forget_session(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_delivers_in_order() {
        let hub = SocketHub::default();
        let session = Uuid::new_v4();
        let (_id, mut rx) = hub.attach(session, "alice");

        hub.publish(session, &json!({"type": "a"}));
        hub.publish(session, &json!({"type": "b"}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, Message::Text(t) if t.contains("\"a\"")));
        assert!(matches!(second, Message::Text(t) if t.contains("\"b\"")));
    }

    #[tokio::test]
    async fn detach_stops_delivery() {
        let hub = SocketHub::default();
        let session = Uuid::new_v4();
        let (id, mut rx) = hub.attach(session, "alice");
        hub.detach(session, id);
        hub.publish(session, &json!({"type": "a"}));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_detaches_socket_without_affecting_others() {
        let hub = SocketHub::default();
        let session = Uuid::new_v4();
        let (_slow_id, _slow_rx_kept_unread) = hub.attach(session, "slow");
        let (_fast_id, mut fast_rx) = hub.attach(session, "fast");

        for i in 0..OUTBOUND_QUEUE_CAPACITY + 5 {
            hub.publish(session, &json!({ "n": i }));
        }

        // The fast reader drains as it goes, so it should have received
        // everything published after it started reading at least once.
        assert!(fast_rx.try_recv().is_ok());
        assert!(hub.sessions.get(&session).unwrap().len() <= 2);
    }
}
