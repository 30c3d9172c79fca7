#![cfg(test)]

mod common;

use common::harness::{bearer_token, Harness};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[tokio::test]
async fn healthz_responds_ok_without_auth() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();
    let response = client.get(format!("{}/healthz", harness.base_url)).send().await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn create_session_requires_bearer_token() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/activities/session", harness.base_url))
        .json(&json!({
            "activityKey": "typing_duel",
            "creatorUserId": "alice",
            "participants": ["alice", "bob"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn create_join_and_fetch_round_trip() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/activities/session", harness.base_url))
        .bearer_auth(bearer_token("alice"))
        .json(&json!({
            "activityKey": "typing_duel",
            "creatorUserId": "alice",
            "participants": ["alice", "bob"],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = created["sessionId"].as_str().unwrap().to_owned();

    let join: Value = client
        .post(format!("{}/activities/session/{session_id}/join", harness.base_url))
        .bearer_auth(bearer_token("alice"))
        .json(&json!({ "userId": "alice" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(join["ok"], true);
    assert!(join["permitTtlSeconds"].as_u64().unwrap() > 0);

    let fetched: Value = client
        .get(format!("{}/activities/session/{session_id}", harness.base_url))
        .bearer_auth(bearer_token("alice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["status"], "pending");
    assert_eq!(fetched["participants"][0]["userId"], "alice");
    assert_eq!(fetched["participants"][0]["joined"], true);
}

#[tokio::test]
async fn list_sessions_reports_pending_count() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/activities/session", harness.base_url))
        .bearer_auth(bearer_token("alice"))
        .json(&json!({
            "activityKey": "trivia",
            "creatorUserId": "alice",
            "participants": ["alice", "bob"],
        }))
        .send()
        .await
        .unwrap();

    let list: Value = client
        .get(format!("{}/activities/sessions?status=pending", harness.base_url))
        .bearer_auth(bearer_token("alice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["counts"]["pending"], 1);
    assert_eq!(list["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn websocket_stream_without_join_closes_not_joined() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();
    let created: Value = client
        .post(format!("{}/activities/session", harness.base_url))
        .bearer_auth(bearer_token("alice"))
        .json(&json!({
            "activityKey": "rps",
            "creatorUserId": "alice",
            "participants": ["alice", "bob"],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = created["sessionId"].as_str().unwrap().to_owned();

    let url = format!(
        "{}/activities/session/{session_id}/stream?token={}",
        harness.ws_base,
        bearer_token("bob"),
    );
    let (mut socket, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    let frame = socket.next().await;
    match frame {
        Some(Ok(WsMessage::Close(Some(close)))) => {
            assert_eq!(u16::from(close.code), 4403);
        }
        other => panic!("expected a 4403 close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn websocket_stream_after_join_sends_snapshot() {
    let harness = Harness::start().await;
    let client = reqwest::Client::new();
    let created: Value = client
        .post(format!("{}/activities/session", harness.base_url))
        .bearer_auth(bearer_token("alice"))
        .json(&json!({
            "activityKey": "rps",
            "creatorUserId": "alice",
            "participants": ["alice", "bob"],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = created["sessionId"].as_str().unwrap().to_owned();

    client
        .post(format!("{}/activities/session/{session_id}/join", harness.base_url))
        .bearer_auth(bearer_token("alice"))
        .json(&json!({ "userId": "alice" }))
        .send()
        .await
        .unwrap();

    let url = format!(
        "{}/activities/session/{session_id}/stream?token={}",
        harness.ws_base,
        bearer_token("alice"),
    );
    let (mut socket, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    let frame = socket.next().await.unwrap().unwrap();
    let WsMessage::Text(text) = frame else {
        panic!("expected a text frame");
    };
    let parsed: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["type"], "session.snapshot");
    assert_eq!(parsed["payload"]["id"], session_id);

    socket.close(None).await.unwrap();
}
