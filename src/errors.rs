//! Error taxonomy (spec.md §7): a single set of named failure kinds shared by
//! the HTTP surface and the websocket `error` frame, each carrying its own
//! mapped HTTP status and wire code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid request")]
    InvalidRequest,
    #[error("invalid participants")]
    InvalidParticipants,
    #[error("unsupported activity")]
    UnsupportedActivity,
    #[error("session not found")]
    SessionNotFound,
    #[error("session state missing")]
    SessionStateMissing,
    #[error("session not in lobby")]
    SessionNotInLobby,
    #[error("session not running")]
    SessionNotRunning,
    #[error("round not started")]
    RoundNotStarted,
    #[error("round not found")]
    RoundNotFound,
    #[error("participant not in session")]
    ParticipantNotInSession,
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("not joined")]
    NotJoined,
    #[error("internal error")]
    InternalError,
}

impl ErrorKind {
    /// The stable wire code, e.g. `session_not_found`.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidParticipants => "invalid_participants",
            Self::UnsupportedActivity => "unsupported_activity",
            Self::SessionNotFound => "session_not_found",
            Self::SessionStateMissing => "session_state_missing",
            Self::SessionNotInLobby => "session_not_in_lobby",
            Self::SessionNotRunning => "session_not_running",
            Self::RoundNotStarted => "round_not_started",
            Self::RoundNotFound => "round_not_found",
            Self::ParticipantNotInSession => "participant_not_in_session",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::NotJoined => "not_joined",
            Self::InternalError => "internal_error",
        }
    }

    #[must_use]
    pub const fn http_status(self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::ParticipantNotInSession | Self::NotJoined => {
                StatusCode::FORBIDDEN
            }
            Self::InvalidRequest | Self::InvalidParticipants | Self::UnsupportedActivity => {
                StatusCode::BAD_REQUEST
            }
            Self::SessionNotFound | Self::RoundNotFound => StatusCode::NOT_FOUND,
            Self::SessionStateMissing => StatusCode::GONE,
            Self::SessionNotInLobby | Self::SessionNotRunning | Self::RoundNotStarted => {
                StatusCode::CONFLICT
            }
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The error type returned by every fallible command handler. Carries an
/// optional human-readable detail string, never exposed as the sole source
/// of truth for client branching (clients branch on `kind.code()`).
#[derive(Debug, Clone, Error)]
#[error("{kind}{}", details.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct CoreError {
    pub kind: ErrorKind,
    pub details: Option<String>,
}

impl CoreError {
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl From<ErrorKind> for CoreError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.kind.code(),
            "details": self.details,
        }));
        (self.kind.http_status(), body).into_response()
    }
}

/// Mirrors `CoreError` as a websocket `error` frame payload (§6.2).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorFrame {
    pub code: &'static str,
    pub details: Option<String>,
}

impl From<CoreError> for ErrorFrame {
    fn from(err: CoreError) -> Self {
        Self {
            code: err.kind.code(),
            details: err.details,
        }
    }
}

impl From<ErrorKind> for ErrorFrame {
    fn from(kind: ErrorKind) -> Self {
        CoreError::new(kind).into()
    }
}
