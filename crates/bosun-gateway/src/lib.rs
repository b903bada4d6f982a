// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The HTTP gateway: request ids, auth, size/timeout/CORS enforcement,
//! per-route rate limiting, SSE framing, and no business logic.  Handlers
//! delegate to the stores, the OAuth manager, and the agent orchestrator.

mod error;
mod middleware;
mod ratelimit;
mod routes;
mod state;

pub use error::{ApiError, ErrorCode, Origin};
pub use ratelimit::RateLimiterService;
pub use state::AppState;

use std::sync::Arc;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;

/// Assemble the full application router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/chat", post(routes::chat::chat))
        .route("/api/v1/chat/stream", get(routes::chat::chat_stream))
        .route("/api/v1/device", post(routes::chat::create_device_session))
        .layer(from_fn_with_state(state.clone(), middleware::require_api_key))
        .layer(from_fn_with_state(state.clone(), ratelimit::rate_limit))
        .layer(from_fn_with_state(state.clone(), middleware::body_size_limit))
        .layer(from_fn_with_state(state.clone(), middleware::request_timeout));

    let oauth = Router::new()
        .route("/oauth/connect/{provider}", get(routes::oauth::connect))
        .route("/oauth/{provider}/callback", get(routes::oauth::callback));

    let health = Router::new()
        .route("/healthz", get(routes::health::liveness))
        .route("/healthz/oauth", get(routes::health::oauth_health))
        .route("/healthz/mcp", get(routes::health::mcp_health));

    let cors = middleware::cors_layer(&state.settings);

    Router::new()
        .merge(api)
        .merge(oauth)
        .merge(health)
        .layer(from_fn(middleware::security_headers))
        .layer(cors)
        .layer(from_fn(middleware::request_id))
        .with_state(state)
}

/// Serve until the token cancels (ctrl-c at the binary level).
pub async fn serve(state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = state.settings.listen_addr.clone();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "gateway listening");
    // ConnectInfo feeds the rate limiter's IP fallback identifier.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;
    Ok(())
}

/// Spawn the gateway's own background maintenance: rate-limit bucket sweep
/// plus periodic cleanup of expired cache rows, sessions, share tokens, and
/// oauth states.
pub fn spawn_maintenance(state: AppState, cancel: CancellationToken) {
    let limiter = Arc::clone(&state.rate_limiter);
    let sweep_cancel = cancel.clone();
    tokio::spawn(async move { limiter.run_sweep(sweep_cancel).await });

    tokio::spawn(async move {
        let interval = std::time::Duration::from_secs(3600);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let _ = state.cache.cleanup_expired(1000).await;
            if let Err(e) = state.sessions.cleanup_expired().await {
                tracing::error!(error = %e, "session cleanup failed");
            }
            if let Err(e) = state.threads.cleanup_expired_tokens().await {
                tracing::error!(error = %e, "share token cleanup failed");
            }
            if let Err(e) = state.oauth.cleanup_expired_states().await {
                tracing::error!(error = %e, "oauth state cleanup failed");
            }
        }
        tracing::info!("maintenance loop stopped");
    });
}
