// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Liveness and subsystem health endpoints.

use axum::{extract::State, Extension, Json};
use serde_json::json;

use crate::error::{ApiError, ErrorCode};
use crate::middleware::RequestId;
use crate::state::AppState;

pub async fn liveness() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// OAuth subsystem health: connection counters, scheduler statistics, and
/// the alert snapshot.  Connections flagged `needs_reauth` show up here so
/// operators can prompt users to reconnect.
pub async fn oauth_health(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let counters = state
        .connections
        .health_counters()
        .await
        .map_err(|e| ApiError::from_store(e, &rid.0))?;
    let scheduler = state
        .scheduler_stats
        .lock()
        .map(|s| serde_json::to_value(&*s).unwrap_or_default())
        .map_err(|_| ApiError::new(ErrorCode::Internal, "scheduler stats poisoned", &rid.0))?;
    Ok(Json(json!({
        "status": "ok",
        "connections": counters,
        "scheduler": scheduler,
        "alerts": state.alerts.snapshot(),
    })))
}

/// MCP router health summary plus cache statistics.
pub async fn mcp_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let summary = state.router.health_summary().await;
    Json(json!({
        "mcp": summary,
        "tool_cache": state.router.cache_stats(),
    }))
}
