// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The chat endpoints.
//!
//! One shared preparation path authenticates the device session, resolves
//! the thread, persists the user message idempotently, loads history with
//! the new message explicitly excluded, and builds the agent request.  The
//! sync handler then awaits the outcome; the SSE handlers stream events and
//! finish with a composed `done` event carrying the response metadata.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use bosun_core::{
    AgentError, AgentEvent, AgentRequest, CacheMode, CallContext, ChatOutcome,
};
use bosun_model::Message;
use bosun_store::{NewMessage, Thread, ThreadMessage, UsageUpdate};

use crate::error::{ApiError, ErrorCode};
use crate::middleware::RequestId;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    pub session: Option<String>,
    pub thread_id: Option<String>,
    pub thread_token: Option<String>,
    pub client_message_id: Option<String>,
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub force_retry: bool,
    #[serde(default)]
    pub return_share_token: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    #[serde(default)]
    pub stream: Option<String>,
}

/// POST `/api/v1/chat` — synchronous unless `?stream=true`.
pub async fn chat(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Query(q): Query<ChatQuery>,
    payload: Result<Json<ChatBody>, axum::extract::rejection::JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = payload.map_err(|e| {
        ApiError::new(
            ErrorCode::Validation,
            format!("invalid JSON body: {}", e.body_text()),
            &rid.0,
        )
    })?;
    let prepared = prepare(&state, &rid.0, body).await?;
    let streaming = matches!(q.stream.as_deref(), Some("true") | Some("1"));
    if streaming {
        Ok(run_streaming(state, prepared).into_response())
    } else {
        run_sync(state, prepared).await.map(IntoResponse::into_response)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub prompt: String,
    pub session: Option<String>,
    pub thread_id: Option<String>,
    pub thread_token: Option<String>,
    pub client_message_id: Option<String>,
    #[serde(default)]
    pub force_refresh: bool,
}

/// GET `/api/v1/chat/stream?prompt=...` — SSE variant for clients that
/// cannot POST before opening an event stream.  `Last-Event-ID` reconnects
/// are accepted best-effort (the agent run is not replayed).
pub async fn chat_stream(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    headers: axum::http::HeaderMap,
    Query(q): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    if let Some(last) = headers.get("last-event-id").and_then(|v| v.to_str().ok()) {
        tracing::debug!(last_event_id = last, "sse reconnect");
    }
    let body = ChatBody {
        messages: vec![IncomingMessage {
            role: "user".into(),
            content: q.prompt,
        }],
        session: q.session,
        thread_id: q.thread_id,
        thread_token: q.thread_token,
        client_message_id: q.client_message_id,
        force_refresh: q.force_refresh,
        force_retry: false,
        return_share_token: false,
    };
    let prepared = prepare(&state, &rid.0, body).await?;
    Ok(run_streaming(state, prepared).into_response())
}

// ── Device sessions (MVP management surface) ─────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBody {
    pub email: Option<String>,
    pub workspace_id: Option<String>,
}

/// POST `/api/v1/device` — mint a device session.  The raw token appears in
/// this response and nowhere else, ever.
pub async fn create_device_session(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    Json(body): Json<DeviceBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = match (&body.email, default_user(&state)) {
        (Some(email), _) => state
            .connections
            .ensure_user(email)
            .await
            .map_err(|e| ApiError::from_store(e, &rid.0))?,
        (None, Some(user_id)) => user_id,
        (None, None) => {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "email required (no default user configured)",
                &rid.0,
            ));
        }
    };
    let token = state
        .sessions
        .create(user_id, body.workspace_id.as_deref())
        .await
        .map_err(|e| ApiError::from_store(e, &rid.0))?;
    Ok(Json(json!({
        "deviceToken": token.as_str(),
        "userId": user_id,
        "workspaceId": body.workspace_id,
    })))
}

// ── Shared preparation ───────────────────────────────────────────────────────

struct Prepared {
    rid: String,
    request_uuid: Uuid,
    user_id: Uuid,
    session_id: Option<Uuid>,
    thread: Thread,
    user_msg: ThreadMessage,
    agent_req: AgentRequest,
    return_share_token: bool,
}

async fn prepare(state: &AppState, rid: &str, body: ChatBody) -> Result<Prepared, ApiError> {
    // Shape validation first; nothing touches the database until the
    // request is well-formed.
    if body.messages.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "messages must not be empty",
            rid,
        ));
    }
    for m in &body.messages {
        if !matches!(m.role.as_str(), "user" | "assistant" | "system") {
            return Err(ApiError::new(
                ErrorCode::Unprocessable,
                format!("unsupported message role {:?}", m.role),
                rid,
            ));
        }
    }
    let last = body.messages.last().expect("non-empty");
    if last.role != "user" {
        return Err(ApiError::new(
            ErrorCode::Unprocessable,
            "last message must have role \"user\"",
            rid,
        ));
    }
    if last.content.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message content must not be empty",
            rid,
        ));
    }
    let thread_id = body
        .thread_id
        .as_deref()
        .map(Uuid::parse_str)
        .transpose()
        .map_err(|_| ApiError::new(ErrorCode::Validation, "threadId is not a UUID", rid))?;

    // Bind to a device session, or fall back to the configured MVP user.
    let (user_id, workspace_id, session_id) = match &body.session {
        Some(raw) => {
            let ctx = state
                .sessions
                .validate(raw)
                .await
                .map_err(|e| ApiError::from_store(e, rid))?
                .ok_or_else(|| {
                    ApiError::new(ErrorCode::Auth, "invalid or expired device session", rid)
                })?;
            (ctx.user_id, ctx.workspace_id, Some(ctx.session_id))
        }
        None => match default_user(state) {
            Some(user_id) => (user_id, None, None),
            None => {
                return Err(ApiError::new(
                    ErrorCode::Auth,
                    "a device session is required",
                    rid,
                ));
            }
        },
    };

    let thread = state
        .threads
        .find_or_create(
            thread_id,
            body.thread_token.as_deref(),
            Some(user_id),
            workspace_id.as_deref(),
        )
        .await
        .map_err(|e| ApiError::from_store(e, rid))?;

    let request_uuid = uuid_for_request(rid);
    let (user_msg, _created) = state
        .threads
        .add_message(NewMessage {
            thread_id: thread.id,
            request_id: Some(request_uuid),
            role: "user".into(),
            content: json!({ "text": last.content }),
            client_message_id: body.client_message_id.clone(),
            in_reply_to: None,
            status: "complete".into(),
            tool_calls: None,
            tokens_input: None,
            tokens_output: None,
            force_retry: body.force_retry,
        })
        .await
        .map_err(|e| ApiError::from_store(e, rid))?;

    // History excludes the message we just wrote: the new turn is passed
    // separately and must never be doubled in the prompt.
    let history = state
        .threads
        .messages(thread.id, 100, Some(user_msg.id))
        .await
        .map_err(|e| ApiError::from_store(e, rid))?
        .into_iter()
        .filter_map(to_model_message)
        .collect();

    let context = CallContext {
        request_id: request_uuid,
        thread_id: thread.id,
        user_message_id: user_msg.id,
        user_id: Some(user_id),
        workspace_id: workspace_id.clone(),
        cache_mode: if body.force_refresh {
            CacheMode::Refresh
        } else {
            CacheMode::Prefer
        },
        call_index: 0,
        force_retry: body.force_retry,
    };

    let agent_req = AgentRequest {
        context,
        history,
        user_message: last.content.clone(),
        max_tool_calls: state.settings.max_tool_calls,
        timeout: Duration::from_secs(state.settings.agent_timeout_s),
    };

    Ok(Prepared {
        rid: rid.to_string(),
        request_uuid,
        user_id,
        session_id,
        thread,
        user_msg,
        agent_req,
        return_share_token: body.return_share_token,
    })
}

// ── Sync path ────────────────────────────────────────────────────────────────

async fn run_sync(state: AppState, prepared: Prepared) -> Result<Json<serde_json::Value>, ApiError> {
    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    // Sync callers do not consume events; drain so the loop never blocks.
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let outcome = state
        .orchestrator
        .run(prepared.agent_req.clone(), tx, CancellationToken::new())
        .await;
    drain.abort();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            finish_failed(&state, &prepared).await;
            return Err(agent_error_to_api(e, &prepared.rid));
        }
    };

    let (warning, share_token) = finish_success(&state, &prepared, &outcome).await;
    let (cache_hit, ttl_remaining) = cache_meta(&outcome);

    let mut meta = json!({
        "requestId": prepared.rid,
        "cacheHit": cache_hit,
        "tokens": {
            "input": outcome.usage.input_tokens,
            "output": outcome.usage.output_tokens,
        },
    });
    if let Some(ttl) = ttl_remaining {
        meta["cacheTtlRemaining"] = json!(ttl);
    }
    if let Some(level) = &warning {
        meta["warning"] = json!(level);
    }

    let mut resp = json!({
        "reply": outcome.reply,
        "threadId": prepared.thread.id,
        "meta": meta,
    });
    if let Some(token) = share_token {
        resp["shareToken"] = json!(token);
    }
    Ok(Json(resp))
}

// ── Streaming path ───────────────────────────────────────────────────────────

fn run_streaming(
    state: AppState,
    prepared: Prepared,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (out_tx, out_rx) = mpsc::channel::<Event>(256);
    let cancel = CancellationToken::new();

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let orchestrator = Arc::clone(&state.orchestrator);
        let agent_req = prepared.agent_req.clone();
        let run_cancel = task_cancel.clone();
        let run =
            tokio::spawn(async move { orchestrator.run(agent_req, tx, run_cancel).await });

        let rid = prepared.rid.clone();
        let mut event_id: u64 = 0;
        while let Some(ev) = rx.recv().await {
            let Some(sse_event) = shape_event(ev, &rid, &mut event_id) else {
                continue;
            };
            if out_tx.send(sse_event).await.is_err() {
                // Client went away: cancel the run so in-flight tool calls
                // stop instead of burning budget for nobody.
                tracing::info!(request_id = %rid, "sse client disconnected; cancelling run");
                task_cancel.cancel();
                break;
            }
        }

        match run.await {
            Ok(Ok(outcome)) => {
                let (warning, share_token) = finish_success(&state, &prepared, &outcome).await;
                let (cache_hit, ttl_remaining) = cache_meta(&outcome);
                let mut data = json!({
                    "request_id": rid,
                    "threadId": prepared.thread.id,
                    "reply": outcome.reply,
                    "meta": {
                        "requestId": rid,
                        "cacheHit": cache_hit,
                        "tokens": {
                            "input": outcome.usage.input_tokens,
                            "output": outcome.usage.output_tokens,
                        },
                    },
                });
                if let Some(ttl) = ttl_remaining {
                    data["meta"]["cacheTtlRemaining"] = json!(ttl);
                }
                if let Some(level) = warning {
                    data["meta"]["warning"] = json!(level);
                }
                if let Some(token) = share_token {
                    data["shareToken"] = json!(token);
                }
                event_id += 1;
                let done = Event::default()
                    .event("done")
                    .id(event_id.to_string())
                    .data(data.to_string());
                let _ = out_tx.send(done).await;
            }
            Ok(Err(AgentError::Cancelled)) => {
                // Disconnected client; nothing to report to.
            }
            Ok(Err(e)) => {
                // The orchestrator already emitted an `error` event; record
                // the failure for metering.
                tracing::warn!(request_id = %prepared.rid, error = %e, "agent run failed");
                finish_failed(&state, &prepared).await;
            }
            Err(e) => {
                tracing::error!(request_id = %prepared.rid, error = %e, "agent task panicked");
            }
        }
    });

    let stream = ReceiverStream::new(out_rx).map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// Translate an agent event into its SSE frame.  Usage updates and the
/// orchestrator's bare `Done` are skipped — the composed `done` event with
/// metadata replaces the latter.
fn shape_event(ev: AgentEvent, rid: &str, event_id: &mut u64) -> Option<Event> {
    let (kind, data) = match ev {
        AgentEvent::Token(text) => ("token", json!({ "text": text, "request_id": rid })),
        AgentEvent::ToolCallStarted { name } => (
            "tool_call",
            json!({ "name": name, "status": "started", "request_id": rid }),
        ),
        AgentEvent::ToolCallFinished {
            name,
            cache_hit,
            is_error,
        } => (
            "tool_call",
            json!({
                "name": name,
                "status": if is_error { "failed" } else { "finished" },
                "cacheHit": cache_hit,
                "request_id": rid,
            }),
        ),
        AgentEvent::Warning { level, message } => (
            "warning",
            json!({ "level": level, "message": message, "request_id": rid }),
        ),
        AgentEvent::Error { kind, message } => (
            "error",
            json!({ "error": kind.as_str(), "message": message, "request_id": rid }),
        ),
        AgentEvent::UsageUpdate(_) | AgentEvent::Done => return None,
    };
    *event_id += 1;
    Some(
        Event::default()
            .event(kind)
            .id(event_id.to_string())
            .data(data.to_string()),
    )
}

// ── Post-run persistence and metering ────────────────────────────────────────

/// Persist the assistant message, meter usage, update the session counters,
/// and evaluate the budget.  Returns `(warning_level, share_token)`.
async fn finish_success(
    state: &AppState,
    prepared: &Prepared,
    outcome: &ChatOutcome,
) -> (Option<String>, Option<String>) {
    if let Err(e) = state
        .threads
        .add_message(NewMessage {
            thread_id: prepared.thread.id,
            request_id: Some(prepared.request_uuid),
            role: "assistant".into(),
            content: json!({ "text": outcome.reply }),
            client_message_id: None,
            in_reply_to: Some(prepared.user_msg.id),
            status: "complete".into(),
            tool_calls: serde_json::to_value(&outcome.tool_calls).ok(),
            tokens_input: Some(outcome.usage.input_tokens as i32),
            tokens_output: Some(outcome.usage.output_tokens as i32),
            force_retry: false,
        })
        .await
    {
        tracing::error!(error = %e, "failed to persist assistant message");
    }

    let (cache_hit, _) = cache_meta(outcome);
    state
        .meter
        .track(UsageUpdate {
            request_id: prepared.request_uuid,
            user_id: prepared.user_id,
            workspace_id: prepared.thread.workspace_id.clone(),
            device_session_id: prepared.session_id,
            thread_id: Some(prepared.thread.id),
            input_tokens: outcome.usage.input_tokens as i64,
            output_tokens: outcome.usage.output_tokens as i64,
            model_name: Some(outcome.model.clone()),
            provider: Some("anthropic".into()),
            cache_hit,
            tool_calls_count: outcome.tool_calls.len() as i32,
            status: "ok".into(),
        })
        .await;

    if let Some(session_id) = prepared.session_id {
        if let Err(e) = state
            .sessions
            .meter(
                session_id,
                outcome.usage.input_tokens as i64,
                outcome.usage.output_tokens as i64,
            )
            .await
        {
            tracing::error!(error = %e, "failed to meter device session");
        }
    }

    let warning = match state
        .meter
        .check_budget(
            prepared.user_id,
            prepared.thread.workspace_id.as_deref(),
        )
        .await
    {
        Ok(status) if status.over_threshold => Some(status.level.as_str().to_string()),
        Ok(_) => None,
        Err(e) => {
            tracing::error!(error = %e, "budget check failed");
            None
        }
    };

    let share_token = if prepared.return_share_token {
        match state
            .threads
            .generate_share_token(prepared.thread.id, state.settings.share_token_ttl_hours)
            .await
        {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::error!(error = %e, "share token generation failed");
                None
            }
        }
    } else {
        None
    };

    (warning, share_token)
}

async fn finish_failed(state: &AppState, prepared: &Prepared) {
    state
        .meter
        .track(UsageUpdate {
            request_id: prepared.request_uuid,
            user_id: prepared.user_id,
            workspace_id: prepared.thread.workspace_id.clone(),
            device_session_id: prepared.session_id,
            thread_id: Some(prepared.thread.id),
            input_tokens: 0,
            output_tokens: 0,
            model_name: None,
            provider: Some("anthropic".into()),
            cache_hit: false,
            tool_calls_count: 0,
            status: "error".into(),
        })
        .await;
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// The response-level cache verdict: hit iff every tool call in the run was
/// served from cache (and there was at least one).  The remaining TTL is
/// the tightest one among the hits.
fn cache_meta(outcome: &ChatOutcome) -> (bool, Option<i64>) {
    if outcome.tool_calls.is_empty() {
        return (false, None);
    }
    let all_hits = outcome.tool_calls.iter().all(|t| t.cache_hit);
    if !all_hits {
        return (false, None);
    }
    let ttl = outcome
        .tool_calls
        .iter()
        .filter_map(|t| t.cache_ttl_remaining_s)
        .min();
    (true, ttl)
}

fn agent_error_to_api(e: AgentError, rid: &str) -> ApiError {
    match e {
        AgentError::Timeout { seconds } => ApiError::new(
            ErrorCode::Timeout,
            format!("agent run timed out after {seconds}s"),
            rid,
        ),
        AgentError::Cancelled => ApiError::new(ErrorCode::Internal, "request cancelled", rid),
        AgentError::Runtime { kind, message } => ApiError::new(ErrorCode::Internal, message, rid)
            .origin(ApiError::origin_for_kind(kind))
            .details(json!({ "kind": kind.as_str() })),
    }
}

/// Stable UUID for a request-id string, so a retried request with the same
/// `X-Request-ID` maps onto the same usage row and idempotency digests.
fn uuid_for_request(rid: &str) -> Uuid {
    let digest = Sha256::digest(rid.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

fn to_model_message(m: ThreadMessage) -> Option<Message> {
    let text = m
        .content
        .get("text")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| m.content.to_string());
    match m.role.as_str() {
        "user" => Some(Message::user(text)),
        "assistant" => Some(Message::assistant(text)),
        // Tool and system rows are bookkeeping; the prompt is rebuilt from
        // the user/assistant turns plus the current system message.
        _ => None,
    }
}

fn default_user(state: &AppState) -> Option<Uuid> {
    state
        .settings
        .default_user_id
        .as_deref()
        .and_then(|s| Uuid::parse_str(s).ok())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_core::{ToolCallRecord, Usage};

    fn outcome(records: Vec<ToolCallRecord>) -> ChatOutcome {
        ChatOutcome {
            reply: "r".into(),
            tool_calls: records,
            usage: Usage::default(),
            duration_ms: 1,
            model: "m".into(),
        }
    }

    fn record(cache_hit: bool, ttl: Option<i64>) -> ToolCallRecord {
        ToolCallRecord {
            name: "t".into(),
            cache_hit,
            cache_ttl_remaining_s: ttl,
            is_error: false,
            duration_ms: 1,
        }
    }

    #[test]
    fn request_uuid_is_deterministic() {
        assert_eq!(uuid_for_request("req-abc"), uuid_for_request("req-abc"));
        assert_ne!(uuid_for_request("req-abc"), uuid_for_request("req-abd"));
    }

    #[test]
    fn cache_meta_requires_all_hits() {
        assert_eq!(cache_meta(&outcome(vec![])), (false, None));
        assert_eq!(
            cache_meta(&outcome(vec![record(true, Some(295))])),
            (true, Some(295))
        );
        assert_eq!(
            cache_meta(&outcome(vec![record(true, Some(295)), record(false, None)])),
            (false, None)
        );
        // Tightest TTL wins.
        assert_eq!(
            cache_meta(&outcome(vec![
                record(true, Some(295)),
                record(true, Some(120))
            ])),
            (true, Some(120))
        );
    }

    #[test]
    fn model_message_conversion_keeps_user_and_assistant() {
        let mk = |role: &str| ThreadMessage {
            id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            request_id: None,
            role: role.into(),
            content: json!({"text": "hello"}),
            client_message_id: None,
            in_reply_to: None,
            status: "complete".into(),
            tool_calls: None,
            tokens_input: None,
            tokens_output: None,
            created_at: chrono::Utc::now(),
        };
        assert!(to_model_message(mk("user")).is_some());
        assert!(to_model_message(mk("assistant")).is_some());
        assert!(to_model_message(mk("tool")).is_none());
        assert!(to_model_message(mk("system")).is_none());
    }

    #[test]
    fn sse_events_carry_request_id_and_increasing_ids() {
        let mut id = 0;
        let ev = shape_event(AgentEvent::Token("hi".into()), "req-abc", &mut id).unwrap();
        assert_eq!(id, 1);
        // Event internals are opaque; the counter advancing and Some() back
        // are the contract here.
        let _ = ev;
        let none = shape_event(AgentEvent::Done, "req-abc", &mut id);
        assert!(none.is_none());
        assert_eq!(id, 1, "skipped events must not consume ids");
    }
}
