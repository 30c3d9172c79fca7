//! HTTP surface (spec.md §6.1). Every handler extracts `AuthContext` via the
//! `FromRequestParts` impl in `auth.rs`, delegates to `Coordinator`, and lets
//! `CoreError`'s own `IntoResponse` impl (errors.rs) carry the mapped status
//! code and `{error, details}` body back out.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::coordinator::Coordinator;
use crate::errors::{CoreError, ErrorKind};
use crate::model::{Session, SessionStatus};
use crate::store::StatusFilter;
use crate::wire::{
    CreateSessionRequest, CreateSessionResponse, JoinRequest, JoinResponse, LeaveRequest,
    ListSessionsResponse, OkResponse, ReadyRequest, SessionCounts, SessionSummary,
};

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn create_session(
    State(coordinator): State<Arc<Coordinator>>,
    auth: AuthContext,
    Json(body): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), CoreError> {
    let session_id = coordinator
        .create_session(&body.activity_key, &body.creator_user_id, body.participants, &auth)
        .await?;
    Ok((StatusCode::CREATED, Json(CreateSessionResponse { session_id })))
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn list_sessions(
    State(coordinator): State<Arc<Coordinator>>,
    _auth: AuthContext,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<ListSessionsResponse>, CoreError> {
    let filter = match query.status.as_deref() {
        None => StatusFilter::All,
        Some(raw) => StatusFilter::parse(raw).ok_or(ErrorKind::InvalidRequest)?,
    };
    let sessions = coordinator.list_sessions(filter).await;
    let mut counts = SessionCounts::default();
    for session in &sessions {
        match session.status {
            SessionStatus::Pending => counts.pending += 1,
            SessionStatus::Running => counts.running += 1,
            SessionStatus::Ended => counts.ended += 1,
        }
    }
    let sessions = sessions.iter().map(SessionSummary::from).collect();
    Ok(Json(ListSessionsResponse { sessions, counts }))
}

pub async fn get_session(
    State(coordinator): State<Arc<Coordinator>>,
    _auth: AuthContext,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Session>, CoreError> {
    let handle = coordinator.load(session_id)?;
    let session = handle.lock().await;
    Ok(Json(session.clone()))
}

pub async fn join_session(
    State(coordinator): State<Arc<Coordinator>>,
    auth: AuthContext,
    Path(session_id): Path<Uuid>,
    Json(body): Json<JoinRequest>,
) -> Result<(StatusCode, Json<JoinResponse>), CoreError> {
    coordinator.join(session_id, &body.user_id, &auth).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(JoinResponse {
            ok: true,
            permit_ttl_seconds: coordinator.permit_ttl().as_secs(),
        }),
    ))
}

pub async fn leave_session(
    State(coordinator): State<Arc<Coordinator>>,
    auth: AuthContext,
    Path(session_id): Path<Uuid>,
    Json(body): Json<LeaveRequest>,
) -> Result<(StatusCode, Json<OkResponse>), CoreError> {
    coordinator.leave(session_id, &body.user_id, &auth).await?;
    Ok((StatusCode::ACCEPTED, Json(OkResponse { ok: true })))
}

pub async fn ready_session(
    State(coordinator): State<Arc<Coordinator>>,
    auth: AuthContext,
    Path(session_id): Path<Uuid>,
    Json(body): Json<ReadyRequest>,
) -> Result<(StatusCode, Json<OkResponse>), CoreError> {
    let ready = body.ready.unwrap_or(true);
    coordinator
        .ready(session_id, &body.user_id, ready, body.role, &auth)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(OkResponse { ok: true })))
}

pub async fn start_session(
    State(coordinator): State<Arc<Coordinator>>,
    auth: AuthContext,
    Path(session_id): Path<Uuid>,
) -> Result<(StatusCode, Json<OkResponse>), CoreError> {
    coordinator.force_start(session_id, &auth).await?;
    Ok((StatusCode::ACCEPTED, Json(OkResponse { ok: true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorOptions;

    fn ctx(user_id: &str) -> AuthContext {
        AuthContext {
            user_id: user_id.to_owned(),
            admin: false,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips_session_id() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        let req = CreateSessionRequest {
            activity_key: "typing_duel".into(),
            creator_user_id: "alice".into(),
            participants: vec!["alice".into(), "bob".into()],
            config: None,
        };
        let (status, Json(created)) =
            create_session(State(coordinator.clone()), ctx("alice"), Json(req)).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let Json(session) =
            get_session(State(coordinator), ctx("alice"), Path(created.session_id)).await.unwrap();
        assert_eq!(session.id, created.session_id);
        assert_eq!(session.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn list_sessions_counts_by_status() {
        let coordinator = Coordinator::new(CoordinatorOptions::default());
        coordinator
            .create_session("typing_duel", "alice", vec!["alice".into(), "bob".into()], &ctx("alice"))
            .await
            .unwrap();

        let Json(list) = list_sessions(
            State(coordinator),
            ctx("alice"),
            Query(ListSessionsQuery { status: None }),
        )
        .await
        .unwrap();
        assert_eq!(list.counts.pending, 1);
        assert_eq!(list.sessions.len(), 1);
    }
}
