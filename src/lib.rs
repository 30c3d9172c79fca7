//! Session Coordination Core for a realtime multiplayer "activities"
//! service (spec.md §1): short-lived two-player game sessions driven over
//! HTTP and a per-session websocket stream.
//!
//! `coordinator::Coordinator` is the single entry point every command
//! passes through; `activities` holds the five game variants it drives;
//! `api` wires both onto an `axum::Router`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use eyre::Result as EyreResult;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::auth::{AuthOptions, AuthSecret};
use crate::clock::SchedulerOptions;
use crate::coordinator::{Coordinator, CoordinatorOptions, SessionOptions};
use crate::permits::PermitOptions;
use crate::rate_limit::RateLimitOptions;

pub mod activities;
pub mod api;
pub mod auth;
pub mod clock;
pub mod coordinator;
pub mod errors;
pub mod model;
pub mod permits;
pub mod rate_limit;
pub mod socket_hub;
pub mod store;
pub mod wire;

#[cfg(feature = "sqlite-storage")]
pub mod storage;

#[cfg(test)]
pub mod test_util;

fn duration_from_secs_str(value: &str) -> Result<Duration, std::num::ParseIntError> {
    Ok(Duration::from_secs(value.parse()?))
}

/// Top-level configuration, composed via `#[clap(flatten)]` of every
/// component's own options (spec_full.md §A.3).
#[derive(Clone, Debug, Parser)]
pub struct Options {
    /// Socket address the HTTP/websocket listener binds to.
    #[clap(long, env, default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    #[clap(flatten)]
    pub scheduler: SchedulerOptions,

    #[clap(flatten)]
    pub rate_limit: RateLimitOptions,

    #[clap(flatten)]
    pub session: SessionOptions,

    #[clap(flatten)]
    pub permits: PermitOptions,

    #[clap(flatten)]
    pub auth: AuthOptions,

    /// How often the background janitor sweeps expired sessions, in seconds.
    #[clap(long, env, value_parser=duration_from_secs_str, default_value = "60")]
    pub janitor_interval: Duration,

    #[cfg(feature = "sqlite-storage")]
    #[clap(flatten)]
    pub storage: storage::Options,
}

/// The state every handler in `api` extracts from via `State<T>`, where
/// `T: FromRef<AppState>`. `AuthContext`'s `FromRequestParts` impl
/// (auth.rs) is what requires this to be a typed-state struct rather than
/// a bag of `Extension`s.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub auth_secret: AuthSecret,
}

#[allow(clippy::missing_errors_doc)]
pub async fn async_main(options: Options) -> EyreResult<()> {
    let bind = options.bind;
    let (app, _coordinator) = build_app(options).await?;
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Listening on http://{bind}");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(await_shutdown())
        .await?;
    Ok(())
}

/// Builds the router and its backing `Coordinator`, and spawns the
/// background janitor (and, under `sqlite-storage`, the snapshot loop).
/// Split out from `async_main` so integration tests can drive the router
/// directly without binding a real socket.
#[allow(clippy::missing_errors_doc)]
pub async fn build_app(options: Options) -> EyreResult<(Router, Arc<Coordinator>)> {
    let coordinator = Coordinator::new(CoordinatorOptions {
        scheduler: options.scheduler.clone(),
        rate_limit: options.rate_limit.clone(),
        session: options.session.clone(),
        permits: options.permits.clone(),
    });

    let janitor_coordinator = coordinator.clone();
    let janitor_interval = options.janitor_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(janitor_interval);
        loop {
            ticker.tick().await;
            let now_ms = janitor_coordinator.clock().now_ms();
            janitor_coordinator.sweep_expired_sessions(now_ms).await;
        }
    });

    #[cfg(feature = "sqlite-storage")]
    {
        let storage = crate::storage::storage_client(&options.storage).await?;
        let snapshot_coordinator = coordinator.clone();
        tokio::spawn(crate::storage::snapshot_loop(snapshot_coordinator, storage, janitor_interval));
    }

    let state = AppState {
        coordinator: coordinator.clone(),
        auth_secret: AuthSecret(options.auth.shared_secret.clone()),
    };

    let app = Router::new()
        .route("/healthz", get(api::http::healthz))
        .route("/activities/session", post(api::http::create_session))
        .route("/activities/sessions", get(api::http::list_sessions))
        .route("/activities/session/:id", get(api::http::get_session))
        .route("/activities/session/:id/join", post(api::http::join_session))
        .route("/activities/session/:id/leave", post(api::http::leave_session))
        .route("/activities/session/:id/ready", post(api::http::ready_session))
        .route("/activities/session/:id/start", post(api::http::start_session))
        .route("/activities/session/:id/stream", get(api::ws::stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    Ok((app, coordinator))
}

#[cfg(unix)]
async fn await_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        () = ctrl_c => {},
        _ = terminate.recv() => {},
    }
    info!("shutdown signal received");
}

#[cfg(not(unix))]
async fn await_shutdown() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_options() -> Options {
        Options {
            bind: "127.0.0.1:0".parse().unwrap(),
            scheduler: SchedulerOptions::default(),
            rate_limit: RateLimitOptions::default(),
            session: SessionOptions::default(),
            permits: PermitOptions::default(),
            auth: AuthOptions {
                shared_secret: "test-secret".into(),
            },
            janitor_interval: Duration::from_secs(60),
            #[cfg(feature = "sqlite-storage")]
            storage: storage::Options::default(),
        }
    }

    #[tokio::test]
    async fn healthz_is_reachable_without_auth() {
        let (app, _coordinator) = build_app(test_options()).await.unwrap();
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_session_without_auth_is_unauthorized() {
        let (app, _coordinator) = build_app(test_options()).await.unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/activities/session")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"activityKey":"typing_duel","creatorUserId":"alice","participants":["alice","bob"]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
