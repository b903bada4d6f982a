// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The per-call context threaded from the HTTP layer through the agent loop
//! into every tool invocation, and the dispatcher seam the loop calls
//! through.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Cache strategy for tool calls within one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Serve from cache when fresh, fill on miss.
    #[default]
    Prefer,
    /// Skip the read, execute, overwrite the entry (`forceRefresh`).
    Refresh,
    /// No cache read, no cache write, no journal short-circuit.
    Bypass,
}

/// Everything a tool invocation needs to know about the request it belongs
/// to.  Carried by value: `call_index` differs per invocation.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: Uuid,
    pub thread_id: Uuid,
    /// The persisted user message this agent run answers; part of the
    /// idempotency digest so a retried request replays the same journal.
    pub user_message_id: Uuid,
    pub user_id: Option<Uuid>,
    pub workspace_id: Option<String>,
    pub cache_mode: CacheMode,
    /// Position of this call within the request (strictly increasing).
    pub call_index: u32,
    /// Re-execute journaled calls even when a success row exists.
    pub force_retry: bool,
}

impl CallContext {
    pub fn with_index(&self, call_index: u32) -> Self {
        Self {
            call_index,
            ..self.clone()
        }
    }
}

/// Tool-level failure, classified for the error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Authorisation failure from a tool server (may be retried once by the
    /// interceptor before it surfaces here).
    #[error("tool authorisation failed: {0}")]
    Auth(String),
    /// The server is unreachable or unhealthy (`MCP_UNAVAILABLE`).
    #[error("tool server unavailable: {0}")]
    Unavailable(String),
    /// The tool ran and failed (`TOOL_EXEC_ERROR`).
    #[error("tool execution failed: {0}")]
    Exec(String),
}

/// A dispatched call's result plus the cache verdict for response metadata.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub value: Value,
    pub cache_hit: bool,
    pub cache_ttl_remaining_s: Option<i64>,
}

/// One entry of the toolset offered to the model.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// The seam between the agent loop and tool execution.
///
/// The production implementation is the MCP router with the caching/
/// journaling interceptor in front; tests use scripted dispatchers.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Toolset available to this user right now (healthy global servers
    /// plus the user's own provider client when connected).
    async fn toolset(&self, user_id: Option<Uuid>) -> Vec<ToolSpec>;

    /// Execute one tool call through cache, journal, and transport.
    async fn dispatch(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: &Value,
    ) -> Result<DispatchOutcome, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_index_only_changes_the_index() {
        let ctx = CallContext {
            request_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            user_message_id: Uuid::new_v4(),
            user_id: None,
            workspace_id: Some("ws".into()),
            cache_mode: CacheMode::Prefer,
            call_index: 0,
            force_retry: false,
        };
        let next = ctx.with_index(3);
        assert_eq!(next.call_index, 3);
        assert_eq!(next.request_id, ctx.request_id);
        assert_eq!(next.workspace_id, ctx.workspace_id);
    }

    #[test]
    fn cache_mode_defaults_to_prefer() {
        assert_eq!(CacheMode::default(), CacheMode::Prefer);
    }
}
