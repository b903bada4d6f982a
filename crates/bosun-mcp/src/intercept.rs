// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The tool-call interceptor: every invocation passes through here.
//!
//! In order: cacheability lookup, key/tag derivation, cache read,
//! single-flight fill, journal begin, invocation (with exactly one retry
//! after an authorisation failure on a user-scoped provider), cache write,
//! journal finalise, and write-path invalidation for mutating tools.
//!
//! Cache and journal failures never fail the call; they degrade to logged
//! bypasses.  Only the tool invocation itself can fail the caller.

use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use bosun_cache::{
    canonical::canonical_json, derive_tags, idempotency_key, make_cache_key, CacheScope,
    CacheStore,
};
use bosun_config::Settings;
use bosun_core::{CacheMode, CallContext, DispatchOutcome, ToolError};
use bosun_store::{ThreadStore, ToolCallLog};

use crate::client::{is_error_result, InvokeError};
use crate::pool::UserClientPool;
use crate::router::ServerHandle;

/// How a call reaches its server: the router's shared client, or the
/// calling user's own authenticated client.
pub(crate) enum Invoker {
    Global(Arc<ServerHandle>),
    User {
        pool: Arc<UserClientPool>,
        user_id: Uuid,
    },
}

pub struct ToolInterceptor {
    cache: CacheStore,
    threads: ThreadStore,
    settings: Arc<Settings>,
}

impl ToolInterceptor {
    pub fn new(cache: CacheStore, threads: ThreadStore, settings: Arc<Settings>) -> Self {
        Self {
            cache,
            threads,
            settings,
        }
    }

    pub fn cache_stats(&self) -> bosun_cache::CacheStats {
        self.cache.stats()
    }

    pub(crate) async fn call(
        &self,
        ctx: &CallContext,
        invoker: Invoker,
        server: &str,
        tool: &str,
        args: &Value,
    ) -> Result<DispatchOutcome, ToolError> {
        let journal_name = format!("{server}.{tool}");
        let ttl = self.settings.cacheable_ttl(server, tool);
        let caching = ttl.is_some() && ctx.cache_mode != CacheMode::Bypass;

        let scope = match &invoker {
            Invoker::User { user_id, .. } => CacheScope::User {
                user_id: *user_id,
                workspace_id: ctx.workspace_id.clone(),
            },
            Invoker::Global(_) => CacheScope::Global,
        };
        let cache_key = caching.then(|| make_cache_key(server, tool, args, &scope, "v1", None));
        let tags = derive_tags(server, args);

        // Cache read (prefer mode only; refresh skips straight to execute).
        if ctx.cache_mode == CacheMode::Prefer {
            if let Some(key) = &cache_key {
                if let Some((value, meta)) = self.cache.get(key, None, true).await {
                    info!(
                        tool = %journal_name,
                        age_s = meta.age_s,
                        ttl_remaining_s = meta.ttl_remaining_s,
                        stale = meta.stale,
                        "tool cache hit"
                    );
                    self.journal_cache_hit(ctx, &journal_name, args, &value).await;
                    return Ok(DispatchOutcome {
                        value,
                        cache_hit: true,
                        cache_ttl_remaining_s: Some(meta.ttl_remaining_s),
                    });
                }
            }
        }

        // Journal begin.  An existing success row means this exact call
        // already ran in a previous attempt of this request; results are
        // not stored in the journal, so the call re-executes against the
        // same row (the cache usually answers it anyway).
        let idem = idempotency_key(
            ctx.request_id,
            ctx.thread_id,
            ctx.user_message_id,
            &journal_name,
            args,
            ctx.call_index,
        );
        let log = self.journal_begin(ctx, &idem, &journal_name, args).await;
        if let Some(row) = &log {
            if row.status == "success" && !ctx.force_retry {
                info!(
                    tool = %journal_name,
                    key_prefix = &idem[..16],
                    "journaled call replayed; re-executing against existing row"
                );
            }
        }

        // Execute, with single-flight when this is a prefer-mode fill.
        let executed = if caching && ctx.cache_mode == CacheMode::Prefer {
            let key = cache_key.as_deref().expect("caching implies key");
            let ttl = ttl.expect("caching implies ttl");
            self.cache
                .with_fill_lock(key, || async {
                    let value = self
                        .invoke_with_auth_retry(&invoker, tool, args)
                        .await
                        .map_err(anyhow::Error::from)?;
                    // Auth/transport failures never reach here (they are
                    // errors); tool-level error results are returned but
                    // must not be cached.
                    if !is_error_result(&value) {
                        self.cache.set(key, &value, ttl, &tags).await;
                    }
                    Ok(value)
                })
                .await
        } else {
            let result = self.invoke_with_auth_retry(&invoker, tool, args).await;
            match result {
                Ok(value) => {
                    if caching && !is_error_result(&value) {
                        let key = cache_key.as_deref().expect("caching implies key");
                        self.cache.set(key, &value, ttl.unwrap_or(0), &tags).await;
                    }
                    Ok((value, false))
                }
                Err(e) => Err(anyhow::Error::from(e)),
            }
        };

        match executed {
            Ok((value, was_cached)) => {
                let digest = result_digest(&value);
                self.journal_finish(&log, "success", Some(&digest), None).await;

                // Write-path invalidation: a successful mutation retires
                // every cached read of the touched entities.
                if is_mutating_tool(tool) && !is_error_result(&value) {
                    let count = self.cache.invalidate_by_tags(&tags).await;
                    if count > 0 {
                        info!(tool = %journal_name, count, "cache invalidated after mutation");
                    }
                }

                Ok(DispatchOutcome {
                    value,
                    cache_hit: was_cached,
                    cache_ttl_remaining_s: None,
                })
            }
            Err(e) => {
                self.journal_finish(&log, "failed", None, Some(&e.to_string())).await;
                Err(map_invoke_error(e))
            }
        }
    }

    /// Invoke, retrying exactly once after an authorisation failure on a
    /// user-scoped provider: refresh the user's tokens, evict the pooled
    /// client, rebuild, and try again.
    async fn invoke_with_auth_retry(
        &self,
        invoker: &Invoker,
        tool: &str,
        args: &Value,
    ) -> Result<Value, InvokeError> {
        match self.invoke(invoker, tool, args).await {
            Err(InvokeError::Auth(msg)) => {
                let Invoker::User { pool, user_id } = invoker else {
                    return Err(InvokeError::Auth(msg));
                };
                warn!(
                    user_id = %user_id,
                    tool,
                    error = %msg,
                    "authorisation failure; refreshing tokens and retrying once"
                );
                pool.refresh_and_evict(*user_id)
                    .await
                    .map_err(|e| InvokeError::Auth(format!("token refresh failed: {e}")))?;
                self.invoke(invoker, tool, args).await
            }
            other => other,
        }
    }

    async fn invoke(
        &self,
        invoker: &Invoker,
        tool: &str,
        args: &Value,
    ) -> Result<Value, InvokeError> {
        match invoker {
            Invoker::Global(handle) => handle.client.call_tool(tool, args).await,
            Invoker::User { pool, user_id } => {
                let client = pool
                    .get(*user_id)
                    .await
                    .map_err(|e| InvokeError::Transport(e.to_string()))?
                    .ok_or_else(|| {
                        InvokeError::Auth("no active provider connection".to_string())
                    })?;
                client.call_tool(tool, args).await
            }
        }
    }

    // ── Journal plumbing (best-effort; never fails the call) ─────────────

    async fn journal_begin(
        &self,
        ctx: &CallContext,
        idem: &str,
        tool_name: &str,
        args: &Value,
    ) -> Option<ToolCallLog> {
        match self
            .threads
            .log_tool_call(
                ctx.request_id,
                ctx.thread_id,
                None,
                ctx.call_index as i32,
                idem,
                tool_name,
                args,
            )
            .await
        {
            Ok((row, _existing)) => Some(row),
            Err(e) => {
                tracing::error!(tool = tool_name, error = %e, "tool-call journaling bypassed");
                None
            }
        }
    }

    async fn journal_finish(
        &self,
        log: &Option<ToolCallLog>,
        status: &str,
        digest: Option<&str>,
        error: Option<&str>,
    ) {
        let Some(row) = log else { return };
        if let Err(e) = self
            .threads
            .update_tool_call_status(row.id, status, digest, error)
            .await
        {
            tracing::error!(log_id = %row.id, error = %e, "tool-call journal update bypassed");
        }
    }

    /// A cache hit still gets a journal entry so the request's call record
    /// is complete; the digest is that of the served value.
    async fn journal_cache_hit(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: &Value,
        value: &Value,
    ) {
        let idem = idempotency_key(
            ctx.request_id,
            ctx.thread_id,
            ctx.user_message_id,
            tool_name,
            args,
            ctx.call_index,
        );
        let log = self.journal_begin(ctx, &idem, tool_name, args).await;
        if let Some(row) = &log {
            if row.status == "pending" {
                self.journal_finish(&log, "success", Some(&result_digest(value)), None)
                    .await;
            }
        }
    }
}

/// Digest of a tool result as stored in the journal.
fn result_digest(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value).as_bytes()))
}

fn map_invoke_error(e: anyhow::Error) -> ToolError {
    match e.downcast::<InvokeError>() {
        Ok(InvokeError::Auth(m)) => ToolError::Auth(m),
        Ok(InvokeError::Transport(m)) => ToolError::Unavailable(m),
        Ok(InvokeError::Exec(m)) => ToolError::Exec(m),
        Err(other) => ToolError::Exec(other.to_string()),
    }
}

/// Write-path classification: tools whose semantics mutate provider state.
/// These never appear in the cacheable table, and a success invalidates the
/// tags derived from their arguments.
pub fn is_mutating_tool(tool: &str) -> bool {
    const MARKERS: &[&str] = &[
        "create", "update", "delete", "patch", "append", "archive", "move", "write", "insert",
        "trash",
    ];
    let lower = tool.to_ascii_lowercase();
    MARKERS.iter().any(|m| lower.contains(m))
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mutating_tool_detection() {
        assert!(is_mutating_tool("API-patch-page"));
        assert!(is_mutating_tool("create_issue"));
        assert!(is_mutating_tool("API-delete-a-block"));
        assert!(is_mutating_tool("update_file"));
        assert!(!is_mutating_tool("API-post-search"));
        assert!(!is_mutating_tool("get_file_contents"));
        assert!(!is_mutating_tool("list_issues"));
    }

    #[test]
    fn result_digest_is_canonical() {
        let a = json!({"b": 1, "a": "x"});
        let b = json!({"a": "x", "b": 1});
        assert_eq!(result_digest(&a), result_digest(&b));
        assert_ne!(result_digest(&a), result_digest(&json!({"a": "y", "b": 1})));
    }

    #[test]
    fn invoke_error_mapping() {
        let auth = map_invoke_error(anyhow::Error::from(InvokeError::Auth("401".into())));
        assert!(matches!(auth, ToolError::Auth(_)));
        let transport =
            map_invoke_error(anyhow::Error::from(InvokeError::Transport("down".into())));
        assert!(matches!(transport, ToolError::Unavailable(_)));
        let exec = map_invoke_error(anyhow::Error::from(InvokeError::Exec("bad".into())));
        assert!(matches!(exec, ToolError::Exec(_)));
        let plain = map_invoke_error(anyhow::anyhow!("other"));
        assert!(matches!(plain, ToolError::Exec(_)));
    }
}
