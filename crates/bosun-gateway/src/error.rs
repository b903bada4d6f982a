// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The one error envelope every handler speaks:
//! `{error, message, origin, requestId, details?}`.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

use bosun_core::ErrorKind;
use bosun_store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    Unprocessable,
    Auth,
    Forbidden,
    NotFound,
    Gone,
    Payload,
    Rate,
    Timeout,
    Internal,
    OauthAccessDenied,
    OauthExchangeFail,
    OauthConfigError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "APP-400-VALIDATION",
            Self::Unprocessable => "APP-422",
            Self::Auth => "APP-401-AUTH",
            Self::Forbidden => "APP-403-FORBIDDEN",
            Self::NotFound => "APP-404-NOT-FOUND",
            Self::Gone => "APP-410-GONE",
            Self::Payload => "APP-413-PAYLOAD",
            Self::Rate => "APP-429-RATE",
            Self::Timeout => "APP-504-TIMEOUT",
            Self::Internal => "APP-500-INTERNAL",
            Self::OauthAccessDenied => "OAUTH-ACCESS-DENIED",
            Self::OauthExchangeFail => "OAUTH-EXCHANGE-FAIL",
            Self::OauthConfigError => "OAUTH-CONFIG-ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation | Self::OauthAccessDenied | Self::OauthExchangeFail => {
                StatusCode::BAD_REQUEST
            }
            Self::Unprocessable => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Gone => StatusCode::GONE,
            Self::Payload => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Rate => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal | Self::OauthConfigError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    App,
    Oauth,
    Mcp,
    Anthropic,
}

#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub origin: Origin,
    pub request_id: String,
    pub details: Option<Value>,
    pub retry_after_s: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            origin: Origin::App,
            request_id: request_id.into(),
            details: None,
            retry_after_s: None,
        }
    }

    pub fn origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_s = Some(seconds);
        self
    }

    /// Map a repository error onto the envelope.
    pub fn from_store(e: StoreError, request_id: &str) -> Self {
        match e {
            StoreError::NotFound(what) => Self::new(ErrorCode::NotFound, what, request_id),
            StoreError::Gone(what) => Self::new(ErrorCode::Gone, what, request_id),
            StoreError::Forbidden(what) => Self::new(ErrorCode::Forbidden, what, request_id),
            StoreError::WorkspaceMismatch { .. } => Self::new(
                ErrorCode::Forbidden,
                "workspace mismatch between thread and session",
                request_id,
            ),
            StoreError::Db(e) => {
                tracing::error!(error = %e, request_id, "database error");
                Self::new(ErrorCode::Internal, "internal error", request_id)
            }
        }
    }

    /// The origin bucket for an agent runtime error kind.
    pub fn origin_for_kind(kind: ErrorKind) -> Origin {
        match kind {
            ErrorKind::ModelProvider => Origin::Anthropic,
            ErrorKind::McpUnavailable | ErrorKind::ToolExec => Origin::Mcp,
            ErrorKind::Unexpected => Origin::App,
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    error: &'static str,
    message: &'a str,
    origin: Origin,
    #[serde(rename = "requestId")]
    request_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(Envelope {
            error: self.code.as_str(),
            message: &self.message,
            origin: self.origin,
            request_id: &self.request_id,
            details: self.details.as_ref(),
        });
        let mut resp = (self.code.status(), body).into_response();
        if let Some(secs) = self.retry_after_s {
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                resp.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        resp
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_statuses() {
        assert_eq!(ErrorCode::Validation.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::Gone.status(), StatusCode::GONE);
        assert_eq!(ErrorCode::Payload.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ErrorCode::Rate.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorCode::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ErrorCode::OauthConfigError.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn envelope_serialises_with_request_id() {
        let err = ApiError::new(ErrorCode::Gone, "share token expired", "req-abc");
        let body = serde_json::to_value(Envelope {
            error: err.code.as_str(),
            message: &err.message,
            origin: err.origin,
            request_id: &err.request_id,
            details: err.details.as_ref(),
        })
        .unwrap();
        assert_eq!(body["error"], "APP-410-GONE");
        assert_eq!(body["requestId"], "req-abc");
        assert_eq!(body["origin"], "app");
        assert!(body.get("details").is_none());
    }

    #[test]
    fn store_errors_map_onto_envelope() {
        let e = ApiError::from_store(StoreError::Gone("share token expired".into()), "r1");
        assert_eq!(e.code, ErrorCode::Gone);
        assert!(e.message.contains("expired"));

        let e = ApiError::from_store(
            StoreError::WorkspaceMismatch {
                thread_id: uuid::Uuid::new_v4(),
                thread_workspace: Some("W1".into()),
                caller_workspace: Some("W2".into()),
            },
            "r1",
        );
        assert_eq!(e.code, ErrorCode::Forbidden);
        assert!(e.message.contains("workspace mismatch"));
    }

    #[test]
    fn runtime_kinds_map_to_origins() {
        assert_eq!(
            ApiError::origin_for_kind(ErrorKind::ModelProvider),
            Origin::Anthropic
        );
        assert_eq!(
            ApiError::origin_for_kind(ErrorKind::McpUnavailable),
            Origin::Mcp
        );
        assert_eq!(ApiError::origin_for_kind(ErrorKind::Unexpected), Origin::App);
    }
}
