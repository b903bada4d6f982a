// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! OAuth flow endpoints: `/oauth/connect/{provider}` starts the
//! authorisation-code dance with a fresh CSRF state, and
//! `/oauth/{provider}/callback` finishes it.

use axum::{
    extract::{Path, Query, State},
    response::{Html, IntoResponse, Redirect, Response},
    Extension,
};
use serde::Deserialize;
use uuid::Uuid;

use bosun_oauth::OAuthError;

use crate::error::{ApiError, ErrorCode, Origin};
use crate::middleware::RequestId;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ConnectQuery {
    /// Where to send the user after a successful connect.
    return_to: Option<String>,
    /// Flow-session binding carried through the round trip.
    flow_session: Option<String>,
}

pub async fn connect(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Extension(rid): Extension<RequestId>,
    Query(q): Query<ConnectQuery>,
) -> Result<Response, ApiError> {
    if provider != state.oauth.provider_name() {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown provider {provider}"),
            &rid.0,
        ));
    }

    let user_id = default_user(&state);
    let (_state_token, auth_url) = state
        .oauth
        .begin(user_id, q.flow_session.as_deref(), q.return_to.as_deref())
        .await
        .map_err(|e| map_oauth_error(e, &rid.0))?;

    Ok(Redirect::temporary(&auth_url).into_response())
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    /// Set by the provider when the user declined the consent screen.
    error: Option<String>,
    flow_session: Option<String>,
}

pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Extension(rid): Extension<RequestId>,
    Query(q): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    if provider != state.oauth.provider_name() {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown provider {provider}"),
            &rid.0,
        ));
    }

    if let Some(err) = &q.error {
        tracing::warn!(provider = %provider, error = %err, "authorisation denied at provider");
        return Err(
            ApiError::new(ErrorCode::OauthAccessDenied, "access denied by user", &rid.0)
                .origin(Origin::Oauth),
        );
    }

    let (code, csrf_state) = match (&q.code, &q.state) {
        (Some(code), Some(state)) => (code, state),
        _ => {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "callback requires code and state",
                &rid.0,
            ));
        }
    };

    let connection = state
        .oauth
        .complete(code, csrf_state, q.flow_session.as_deref(), default_user(&state))
        .await
        .map_err(|e| map_oauth_error(e, &rid.0))?;

    let workspace = connection
        .workspace_name
        .as_deref()
        .unwrap_or(&connection.workspace_id);
    Ok(Html(success_page(&provider, workspace)).into_response())
}

fn default_user(state: &AppState) -> Option<Uuid> {
    state
        .settings
        .default_user_id
        .as_deref()
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn map_oauth_error(e: OAuthError, rid: &str) -> ApiError {
    match e {
        OAuthError::AccessDenied => {
            ApiError::new(ErrorCode::OauthAccessDenied, "access denied by user", rid)
                .origin(Origin::Oauth)
        }
        OAuthError::StateValidation(msg) | OAuthError::Exchange(msg) => {
            ApiError::new(ErrorCode::OauthExchangeFail, msg, rid).origin(Origin::Oauth)
        }
        OAuthError::Config(msg) => {
            ApiError::new(ErrorCode::OauthConfigError, msg, rid).origin(Origin::Oauth)
        }
        OAuthError::Store(e) => ApiError::from_store(e, rid),
        other => {
            tracing::error!(error = %other, "oauth flow failed");
            ApiError::new(ErrorCode::Internal, "oauth flow failed", rid).origin(Origin::Oauth)
        }
    }
}

fn success_page(provider: &str, workspace: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Connected</title>
<style>
  body {{ font-family: system-ui, sans-serif; max-width: 32rem; margin: 4rem auto; }}
  .ok {{ color: #1a7f37; }}
</style>
</head>
<body>
  <h1 class="ok">Connected</h1>
  <p>Your {provider} workspace <strong>{workspace}</strong> is now linked.
     You can close this window and return to your chat.</p>
</body>
</html>"#
    )
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_errors_map_to_spec_codes() {
        let e = map_oauth_error(OAuthError::AccessDenied, "r");
        assert_eq!(e.code, ErrorCode::OauthAccessDenied);

        let e = map_oauth_error(OAuthError::StateValidation("used".into()), "r");
        assert_eq!(e.code, ErrorCode::OauthExchangeFail);
        assert_eq!(e.origin, Origin::Oauth);

        let e = map_oauth_error(OAuthError::Config("no client id".into()), "r");
        assert_eq!(e.code, ErrorCode::OauthConfigError);
    }

    #[test]
    fn success_page_mentions_workspace() {
        let html = success_page("notion", "Acme Docs");
        assert!(html.contains("Acme Docs"));
        assert!(html.contains("notion"));
    }
}
