// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Cross-cutting middleware: request ids, response-time header, API-key
//! authentication, body-size limiting on actual bytes, whole-request
//! timeouts (streaming exempt), security headers, CORS.

use std::time::Instant;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::Instrument;
use uuid::Uuid;

use bosun_config::Settings;

use crate::error::{ApiError, ErrorCode};
use crate::state::AppState;

/// Per-request id, honoured from the inbound `X-Request-ID` when present.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Assign the request id, attach it to a tracing span covering the whole
/// request, and echo it (plus the response time) on the way out.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let rid = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(rid.clone()));
    let span = tracing::info_span!("request", request_id = %rid);
    let started = Instant::now();
    let mut resp = next.run(request).instrument(span).await;

    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&rid) {
        headers.insert("x-request-id", v);
    }
    let elapsed_ms = started.elapsed().as_millis();
    if let Ok(v) = HeaderValue::from_str(&format!("{elapsed_ms}ms")) {
        headers.insert("x-response-time", v);
    }
    resp
}

/// Constant-time API-key check for protected routes.  Accepts either
/// `Authorization: Bearer <key>` or `X-API-Key: <key>`.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let rid = request_id_of(&request);
    let provided = bearer_or_api_key(request.headers());
    match provided {
        Some(key) if verify_key(&key, &state.settings.api_key) => next.run(request).await,
        _ => {
            tracing::warn!("api key missing or wrong");
            ApiError::new(ErrorCode::Auth, "invalid or missing API key", rid).into_response()
        }
    }
}

fn bearer_or_api_key(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
}

/// Compare hashes, not strings: constant-time regardless of length skew.
fn verify_key(provided: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let a: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
    let b: [u8; 32] = Sha256::digest(expected.as_bytes()).into();
    bool::from(a.ct_eq(&b))
}

/// Enforce the body cap by counting actual bytes received; a missing or
/// lying `Content-Length` makes no difference.  The buffered body is put
/// back so extractors downstream see a normal request.
pub async fn body_size_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() == Method::GET || request.method() == Method::HEAD {
        return next.run(request).await;
    }
    let rid = request_id_of(&request);
    let limit = state.settings.max_body_bytes;

    let (parts, body) = request.into_parts();
    match to_bytes(body, limit).await {
        Ok(bytes) => {
            let request = Request::from_parts(parts, Body::from(bytes));
            next.run(request).await
        }
        Err(_) => {
            tracing::warn!(limit_bytes = limit, "request body over size cap");
            ApiError::new(
                ErrorCode::Payload,
                format!("request body exceeds {limit} bytes"),
                rid,
            )
            .retry_after(0)
            .into_response()
        }
    }
}

/// Whole-request timeout for non-streaming routes.  Streaming paths are
/// exempt: an SSE response legitimately outlives any fixed budget.
pub async fn request_timeout(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if is_streaming_request(request.uri().path(), request.uri().query()) {
        return next.run(request).await;
    }
    let rid = request_id_of(&request);
    let budget = std::time::Duration::from_secs(state.settings.request_timeout_s);
    match tokio::time::timeout(budget, next.run(request)).await {
        Ok(resp) => resp,
        Err(_) => {
            tracing::warn!(budget_s = budget.as_secs(), "request timed out");
            ApiError::new(ErrorCode::Timeout, "request timed out", rid).into_response()
        }
    }
}

pub(crate) fn is_streaming_request(path: &str, query: Option<&str>) -> bool {
    if path.ends_with("/chat/stream") {
        return true;
    }
    query
        .map(|q| q.split('&').any(|p| p == "stream=true" || p == "stream=1"))
        .unwrap_or(false)
}

/// Path-aware security headers.  API responses additionally get
/// `Cache-Control: no-store`; the OAuth callback page relaxes CSP enough
/// for its inline styling.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let mut resp = next.run(request).await;
    let h = resp.headers_mut();
    h.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    h.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    h.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    h.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    h.insert(
        "permissions-policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );
    let csp = if path.starts_with("/oauth/") {
        "default-src 'self'; style-src 'unsafe-inline'; img-src 'self' data:"
    } else {
        "default-src 'none'; frame-ancestors 'none'; base-uri 'none'"
    };
    h.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(csp),
    );
    if path.starts_with("/api/") {
        h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    }
    resp
}

/// CORS from the configured origin allow-list; credentials allowed.
pub fn cors_layer(settings: &Settings) -> tower_http::cors::CorsLayer {
    use tower_http::cors::CorsLayer;
    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter(|o| o.as_str() != "*")
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("x-request-id"),
        ])
        .allow_credentials(true)
}

pub(crate) fn request_id_of(request: &Request) -> String {
    request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_verification_is_exact() {
        assert!(verify_key("k".repeat(40).as_str(), "k".repeat(40).as_str()));
        assert!(!verify_key("wrong", "k".repeat(40).as_str()));
        assert!(!verify_key("", "expected"));
        assert!(!verify_key("anything", ""));
    }

    #[test]
    fn streaming_detection() {
        assert!(is_streaming_request("/api/v1/chat/stream", None));
        assert!(is_streaming_request("/api/v1/chat", Some("stream=true")));
        assert!(is_streaming_request("/api/v1/chat", Some("a=b&stream=1")));
        assert!(!is_streaming_request("/api/v1/chat", Some("stream=false")));
        assert!(!is_streaming_request("/api/v1/chat", None));
    }

    #[test]
    fn bearer_and_api_key_headers_are_accepted() {
        let mut h = axum::http::HeaderMap::new();
        h.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_or_api_key(&h).as_deref(), Some("abc"));

        let mut h = axum::http::HeaderMap::new();
        h.insert("x-api-key", "xyz".parse().unwrap());
        assert_eq!(bearer_or_api_key(&h).as_deref(), Some("xyz"));

        assert!(bearer_or_api_key(&axum::http::HeaderMap::new()).is_none());
    }
}
