// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The MCP router: owns the global tool-server connections, the discovered
//! tool catalogues, and per-server health.
//!
//! Tool names are prefixed with `"{server}_"` so catalogues from different
//! servers cannot collide in the model's toolset.  The wire call uses the
//! server's original name; the prefix exists only on our side.
//!
//! The `servers` map is built once at startup and read-only afterwards;
//! `tool_cache` and `health` are written by discovery and the health tasks
//! and snapshot-read by request handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bosun_config::{McpServerConfig, Settings};
use bosun_core::{CallContext, DispatchOutcome, ToolDispatcher, ToolError, ToolSpec};

use crate::client::ToolClient;
use crate::intercept::{Invoker, ToolInterceptor};
use crate::pool::UserClientPool;

/// Normalised tool definition across all servers.
#[derive(Debug, Clone)]
pub struct ToolDef {
    pub server: String,
    /// Prefixed name offered to the model.
    pub name: String,
    /// The server-side name used on the wire.
    pub original_name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerHealth {
    pub status: HealthStatus,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub latency_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub error: Option<String>,
}

impl ServerHealth {
    fn healthy(latency_ms: Option<f64>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_ping: Some(Utc::now()),
            last_success: Some(Utc::now()),
            latency_ms,
            consecutive_failures: 0,
            error: None,
        }
    }

    fn unhealthy(error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            last_ping: Some(Utc::now()),
            last_success: None,
            latency_ms: None,
            consecutive_failures: 1,
            error: Some(error),
        }
    }
}

pub(crate) struct ServerHandle {
    pub config: McpServerConfig,
    pub client: ToolClient,
}

struct ToolCacheEntry {
    tools: Vec<ToolDef>,
    fetched_at: Instant,
}

pub struct McpRouter {
    servers: HashMap<String, Arc<ServerHandle>>,
    tool_cache: RwLock<HashMap<String, ToolCacheEntry>>,
    health: RwLock<HashMap<String, ServerHealth>>,
    pool: Option<Arc<UserClientPool>>,
    interceptor: ToolInterceptor,
    settings: Arc<Settings>,
}

impl McpRouter {
    /// Connect every enabled configured server and run initial discovery.
    /// A server that fails its handshake is registered unhealthy and left
    /// out of toolsets until an operator restart.
    pub async fn connect(
        settings: Arc<Settings>,
        interceptor: ToolInterceptor,
        pool: Option<Arc<UserClientPool>>,
    ) -> Arc<Self> {
        let timeout = Duration::from_millis(settings.mcp_timeout_ms);
        let mut servers = HashMap::new();
        let mut health = HashMap::new();

        for config in settings.mcp_servers.iter().filter(|c| c.enabled) {
            match ToolClient::connect(config.transport, &config.url, None, timeout).await {
                Ok(client) => {
                    info!(
                        server = %config.name,
                        url = %config.url,
                        transport = ?config.transport,
                        "connected to mcp server"
                    );
                    servers.insert(
                        config.name.clone(),
                        Arc::new(ServerHandle {
                            config: config.clone(),
                            client,
                        }),
                    );
                    health.insert(config.name.clone(), ServerHealth::healthy(None));
                }
                Err(e) => {
                    tracing::error!(
                        server = %config.name,
                        url = %config.url,
                        error = %e,
                        "failed to connect to mcp server"
                    );
                    health.insert(config.name.clone(), ServerHealth::unhealthy(e.to_string()));
                }
            }
        }

        let router = Arc::new(Self {
            servers,
            tool_cache: RwLock::new(HashMap::new()),
            health: RwLock::new(health),
            pool,
            interceptor,
            settings,
        });
        router.discover_all(true).await;
        router
    }

    /// Tool catalogue for one server, cached with the configured TTL.
    pub async fn tools(&self, server: &str, force: bool) -> Vec<ToolDef> {
        let ttl = Duration::from_secs(self.settings.mcp_tool_cache_ttl_s);
        if !force {
            let cache = self.tool_cache.read().await;
            if let Some(entry) = cache.get(server) {
                if entry.fetched_at.elapsed() < ttl {
                    debug!(server, "tool catalogue served from cache");
                    return entry.tools.clone();
                }
            }
        }

        let Some(handle) = self.servers.get(server) else {
            warn!(server, "no connection for tool discovery");
            return Vec::new();
        };
        match handle.client.list_tools().await {
            Ok(tools) => {
                let defs = normalize_tools(server, &handle.config.tool_prefix, tools);
                info!(server, tool_count = defs.len(), "tool catalogue discovered");
                self.tool_cache.write().await.insert(
                    server.to_string(),
                    ToolCacheEntry {
                        tools: defs.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                defs
            }
            Err(e) => {
                tracing::error!(server, error = %e, "tool discovery failed");
                Vec::new()
            }
        }
    }

    pub async fn discover_all(&self, force: bool) {
        for server in self.servers.keys() {
            let _ = self.tools(server, force).await;
        }
    }

    /// Direct call surface; identical path to the agent loop (through the
    /// interceptor), so cache and journal semantics hold everywhere.
    pub async fn call(
        &self,
        ctx: &CallContext,
        server: &str,
        tool: &str,
        args: &Value,
    ) -> Result<DispatchOutcome, ToolError> {
        let invoker = self.invoker_for(ctx, server).await?;
        self.interceptor.call(ctx, invoker, server, tool, args).await
    }

    async fn invoker_for(&self, ctx: &CallContext, server: &str) -> Result<Invoker, ToolError> {
        if let Some(handle) = self.servers.get(server) {
            let healthy = self
                .health
                .read()
                .await
                .get(server)
                .map(|h| h.status == HealthStatus::Healthy)
                .unwrap_or(false);
            if !healthy {
                return Err(ToolError::Unavailable(format!("server {server} is unhealthy")));
            }
            return Ok(Invoker::Global(Arc::clone(handle)));
        }
        if let (Some(pool), Some(user_id)) = (&self.pool, ctx.user_id) {
            if server == pool.provider_name() && self.settings.notion.hosted_mcp_enabled {
                return Ok(Invoker::User {
                    pool: Arc::clone(pool),
                    user_id,
                });
            }
        }
        Err(ToolError::Unavailable(format!("unknown server {server}")))
    }

    /// Resolve a prefixed toolset name back to `(server, original_name)`.
    async fn resolve(&self, name: &str) -> Option<(String, String)> {
        let cache = self.tool_cache.read().await;
        for (server, entry) in cache.iter() {
            if let Some(def) = entry.tools.iter().find(|t| t.name == name) {
                return Some((server.clone(), def.original_name.clone()));
            }
        }
        drop(cache);

        // Per-user provider tools carry the provider prefix.
        if let Some(pool) = &self.pool {
            let prefix = format!("{}_", pool.provider_name());
            if let Some(original) = name.strip_prefix(&prefix) {
                return Some((pool.provider_name().to_string(), original.to_string()));
            }
        }
        None
    }

    // ── Health monitoring ────────────────────────────────────────────────

    /// One background task per connected server; each waits
    /// `interval + jitter` then pings via the (cache-backed) tool list.
    pub fn spawn_health_monitors(self: &Arc<Self>, cancel: CancellationToken) {
        for server in self.servers.keys().cloned() {
            let router = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let jitter = rand::thread_rng().gen_range(0..5u64);
                    let wait =
                        Duration::from_secs(router.settings.mcp_health_interval_s + jitter);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    router.check_server_health(&server).await;
                }
                debug!(server = %server, "health monitor stopped");
            });
        }
    }

    async fn check_server_health(&self, server: &str) {
        let Some(handle) = self.servers.get(server) else {
            return;
        };
        let started = Instant::now();
        let result = handle.client.list_tools().await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut health = self.health.write().await;
        let entry = health
            .entry(server.to_string())
            .or_insert_with(|| ServerHealth::unhealthy("never checked".into()));
        entry.last_ping = Some(Utc::now());
        match result {
            Ok(_) => {
                entry.status = HealthStatus::Healthy;
                entry.last_success = Some(Utc::now());
                entry.latency_ms = Some(latency_ms);
                entry.consecutive_failures = 0;
                entry.error = None;
                debug!(server, latency_ms = latency_ms as u64, "health check ok");
            }
            Err(e) => {
                entry.status = HealthStatus::Unhealthy;
                entry.consecutive_failures += 1;
                entry.error = Some(e.to_string());
                warn!(
                    server,
                    consecutive_failures = entry.consecutive_failures,
                    error = %e,
                    "health check failed"
                );
            }
        }
    }

    /// Aggregate health: `healthy` when every server is, `degraded` when
    /// some are, `unhealthy` when none are.
    pub async fn health_summary(&self) -> Value {
        let health = self.health.read().await;
        let total = health.len();
        let healthy = health
            .values()
            .filter(|h| h.status == HealthStatus::Healthy)
            .count();
        let latencies: Vec<f64> = health
            .values()
            .filter(|h| h.status == HealthStatus::Healthy)
            .filter_map(|h| h.latency_ms)
            .collect();
        let avg_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        let overall = if total == 0 || healthy == total {
            "healthy"
        } else if healthy > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let servers: HashMap<&String, &ServerHealth> = health.iter().collect();
        json!({
            "status": overall,
            "healthy_servers": healthy,
            "total_servers": total,
            "average_latency_ms": (avg_latency * 10.0).round() / 10.0,
            "servers": serde_json::to_value(servers).unwrap_or(Value::Null),
        })
    }

    pub fn cache_stats(&self) -> bosun_cache::CacheStats {
        self.interceptor.cache_stats()
    }
}

#[async_trait]
impl ToolDispatcher for McpRouter {
    async fn toolset(&self, user_id: Option<Uuid>) -> Vec<ToolSpec> {
        let mut specs = Vec::new();

        // Snapshot health first; discovery below must not hold the guard.
        let healthy_servers: Vec<String> = {
            let health = self.health.read().await;
            self.servers
                .keys()
                .filter(|name| {
                    let ok = health
                        .get(*name)
                        .map(|h| h.status == HealthStatus::Healthy)
                        .unwrap_or(false);
                    if !ok {
                        debug!(server = %name, "skipping unhealthy server in toolset");
                    }
                    ok
                })
                .cloned()
                .collect()
        };
        for name in healthy_servers {
            for def in self.tools(&name, false).await {
                specs.push(ToolSpec {
                    name: def.name,
                    description: def.description,
                    input_schema: def.input_schema,
                });
            }
        }

        // The user's own provider client, when connected and enabled.
        if let (Some(pool), Some(user_id)) = (&self.pool, user_id) {
            if self.settings.notion.hosted_mcp_enabled {
                match pool.get(user_id).await {
                    Ok(Some(client)) => match client.list_tools().await {
                        Ok(tools) => {
                            let prefix = format!("{}_", pool.provider_name());
                            for t in tools {
                                specs.push(ToolSpec {
                                    name: format!("{prefix}{}", t.name),
                                    description: t.description.clone().into_owned(),
                                    input_schema: Value::Object((*t.input_schema).clone()),
                                });
                            }
                        }
                        Err(e) => {
                            warn!(user_id = %user_id, error = %e, "user toolset discovery failed")
                        }
                    },
                    Ok(None) => {}
                    Err(e) => warn!(user_id = %user_id, error = %e, "user client unavailable"),
                }
            }
        }

        specs
    }

    async fn dispatch(
        &self,
        ctx: &CallContext,
        tool_name: &str,
        args: &Value,
    ) -> Result<DispatchOutcome, ToolError> {
        let (server, original) = self
            .resolve(tool_name)
            .await
            .ok_or_else(|| ToolError::Exec(format!("unknown tool {tool_name}")))?;
        self.call(ctx, &server, &original, args).await
    }
}

fn normalize_tools(
    server: &str,
    prefix: &str,
    tools: Vec<rmcp::model::Tool>,
) -> Vec<ToolDef> {
    tools
        .into_iter()
        .map(|t| {
            let original = t.name.to_string();
            ToolDef {
                server: server.to_string(),
                name: format!("{prefix}{original}"),
                original_name: original,
                description: t.description.clone().into_owned(),
                input_schema: Value::Object((*t.input_schema).clone()),
            }
        })
        .collect()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_overall_classification() {
        // Empty set counts as healthy (nothing is broken).
        let mk = |status| ServerHealth {
            status,
            last_ping: None,
            last_success: None,
            latency_ms: Some(12.0),
            consecutive_failures: 0,
            error: None,
        };
        let all = vec![mk(HealthStatus::Healthy), mk(HealthStatus::Healthy)];
        let healthy = all
            .iter()
            .filter(|h| h.status == HealthStatus::Healthy)
            .count();
        assert_eq!(healthy, all.len());

        let some = vec![mk(HealthStatus::Healthy), mk(HealthStatus::Unhealthy)];
        let healthy = some
            .iter()
            .filter(|h| h.status == HealthStatus::Healthy)
            .count();
        assert!(healthy > 0 && healthy < some.len());
    }

    #[test]
    fn tool_normalisation_prefixes_names() {
        // Construct the descriptor from its MCP wire form.
        let tool: rmcp::model::Tool = serde_json::from_value(json!({
            "name": "get_current_time",
            "description": "Returns the current time",
            "inputSchema": { "type": "object" }
        }))
        .expect("valid tool descriptor");
        let defs = normalize_tools("time", "time_", vec![tool]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "time_get_current_time");
        assert_eq!(defs[0].original_name, "get_current_time");
        assert_eq!(defs[0].server, "time");
        assert_eq!(defs[0].description, "Returns the current time");
        assert_eq!(defs[0].input_schema["type"], "object");
    }
}
