// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Configuration schema for the bosun runtime.
//!
//! Everything is driven by environment variables (the service is deployed as
//! a container; there is no config file). `loader::load` reads and validates
//! the full set; the structs here are plain data.

use std::collections::HashMap;

use serde::Serialize;

/// Deployment environment.  Several validation rules only apply in
/// [`AppEnv::Production`] (API key length, CORS wildcard ban, required
/// `DATABASE_URL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    Development,
    Staging,
    Production,
}

impl AppEnv {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "staging" => Some(Self::Staging),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// One remote MCP server the router connects to at startup.
#[derive(Debug, Clone, Serialize)]
pub struct McpServerConfig {
    pub name: String,
    pub url: String,
    /// `streamable_http` (default) or `sse`.
    pub transport: McpTransport,
    /// Prefix prepended to tool names to avoid cross-server collisions.
    /// Defaults to `"{name}_"`.
    pub tool_prefix: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    StreamableHttp,
    Sse,
}

/// OAuth/refresh tunables (`OAUTH_*` environment variables).
#[derive(Debug, Clone, Serialize)]
pub struct OAuthSettings {
    pub refresh_window_minutes: i64,
    pub refresh_jitter_seconds: i64,
    pub refresh_max_retries: u32,
    pub max_failure_count: i32,
    pub background_refresh_enabled: bool,
    /// Tolerance applied when comparing token expiries against `now`.
    pub clock_skew_seconds: i64,
}

impl Default for OAuthSettings {
    fn default() -> Self {
        Self {
            refresh_window_minutes: 5,
            refresh_jitter_seconds: 60,
            refresh_max_retries: 3,
            max_failure_count: 5,
            background_refresh_enabled: true,
            clock_skew_seconds: 30,
        }
    }
}

/// Notion OAuth application credentials.
#[derive(Debug, Clone, Serialize)]
pub struct NotionSettings {
    pub client_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
    pub redirect_uri: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    /// Hosted MCP endpoint authenticated with per-user bearer tokens.
    pub mcp_url: String,
    /// Feature flag: attach the per-user hosted Notion client to toolsets.
    pub hosted_mcp_enabled: bool,
}

impl Default for NotionSettings {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            auth_url: "https://api.notion.com/v1/oauth/authorize".into(),
            token_url: "https://api.notion.com/v1/oauth/token".into(),
            mcp_url: "https://mcp.notion.com/mcp".into(),
            hosted_mcp_enabled: true,
        }
    }
}

/// Per-route rate-limit policy.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RatePolicy {
    pub requests_per_minute: u32,
    pub burst_capacity: u32,
    pub enabled: bool,
}

impl Default for RatePolicy {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_capacity: 10,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSettings {
    pub default_policy: RatePolicy,
    /// Route path → policy.  Seeded with the built-in table, then merged
    /// with the `RATE_LIMIT_ROUTE_OVERRIDES` JSON object.
    pub route_policies: HashMap<String, RatePolicy>,
    pub max_buckets: usize,
    pub cleanup_interval_s: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let mut route_policies = HashMap::new();
        // Chat is expensive; streams are connection-creation only.
        route_policies.insert(
            "/api/v1/chat".to_string(),
            RatePolicy {
                requests_per_minute: 30,
                burst_capacity: 5,
                enabled: true,
            },
        );
        route_policies.insert(
            "/api/v1/chat/stream".to_string(),
            RatePolicy {
                requests_per_minute: 6,
                burst_capacity: 2,
                enabled: true,
            },
        );
        route_policies.insert(
            "/healthz".to_string(),
            RatePolicy {
                requests_per_minute: u32::MAX,
                burst_capacity: u32::MAX,
                enabled: false,
            },
        );
        Self {
            default_policy: RatePolicy::default(),
            route_policies,
            max_buckets: 10_000,
            cleanup_interval_s: 300,
        }
    }
}

/// Cache TTL defaults and the static cacheability allowlist.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSettings {
    pub ttl_default_s: u64,
    /// `(server, tool) → ttl_s`.  Only idempotent reads belong here; the
    /// interceptor treats any absent pair as non-cacheable.  (Skipped in
    /// serialised output: JSON has no tuple keys.)
    #[serde(skip_serializing)]
    pub cacheable_tools: HashMap<(String, String), u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        let mut t = HashMap::new();
        let mut add = |server: &str, tool: &str, ttl: u64| {
            t.insert((server.to_string(), tool.to_string()), ttl);
        };
        // Notion: pages and schemas change slowly, search is more dynamic.
        add("notion", "API-retrieve-a-page", 900);
        add("notion", "API-post-search", 300);
        add("notion", "API-retrieve-a-database", 900);
        add("notion", "API-post-database-query", 300);
        add("notion", "API-retrieve-a-comment", 300);
        // GitHub: code rarely changes, listings do.
        add("github", "get_issue", 600);
        add("github", "search_repositories", 300);
        add("github", "get_file_contents", 1800);
        add("github", "list_issues", 300);
        add("github", "get_pull_request", 600);
        // Deliberately excluded: time.* (must be fresh) and all mutations.
        Self {
            ttl_default_s: 3600,
            cacheable_tools: t,
        }
    }
}

/// Anthropic model driver settings.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSettings {
    #[serde(skip_serializing)]
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub request_timeout_s: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            anthropic_api_key: None,
            anthropic_base_url: "https://api.anthropic.com".into(),
            model: "claude-3-5-sonnet-latest".into(),
            max_output_tokens: 4096,
            request_timeout_s: 120,
        }
    }
}

/// The full runtime configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub app_env: AppEnv,
    pub listen_addr: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub cors_origins: Vec<String>,

    #[serde(skip_serializing)]
    pub database_url: Option<String>,
    pub database_pool_size: u32,
    pub database_pool_timeout_s: u64,

    #[serde(skip_serializing)]
    pub fernet_key: String,
    #[serde(skip_serializing)]
    pub fernet_retired_keys: Vec<String>,

    pub notion: NotionSettings,
    pub oauth: OAuthSettings,
    pub model: ModelSettings,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,

    pub mcp_servers: Vec<McpServerConfig>,
    pub mcp_timeout_ms: u64,
    pub mcp_tool_cache_ttl_s: u64,
    pub mcp_health_interval_s: u64,

    /// Request body cap for JSON routes, enforced on actual bytes received.
    pub max_body_bytes: usize,
    /// Whole-request timeout for non-streaming routes.
    pub request_timeout_s: u64,
    /// Wall-clock bound for one agent run.
    pub agent_timeout_s: u64,
    /// Tool invocations allowed per request.
    pub max_tool_calls: u32,

    pub share_token_ttl_hours: i64,
    /// MVP fallback owner for threads created without an authenticated user.
    pub default_user_id: Option<String>,
}

impl Settings {
    /// TTL for a `(server, tool)` pair, or `None` when the tool must not be
    /// cached.
    pub fn cacheable_ttl(&self, server: &str, tool: &str) -> Option<u64> {
        self.cache
            .cacheable_tools
            .get(&(server.to_string(), tool.to_string()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_env_parses_aliases() {
        assert_eq!(AppEnv::parse("dev"), Some(AppEnv::Development));
        assert_eq!(AppEnv::parse("PRODUCTION"), Some(AppEnv::Production));
        assert_eq!(AppEnv::parse("qa"), None);
    }

    #[test]
    fn default_cacheable_table_excludes_time_tools() {
        let cache = CacheSettings::default();
        assert!(cache
            .cacheable_tools
            .get(&("time".into(), "get_current_time".into()))
            .is_none());
        assert_eq!(
            cache
                .cacheable_tools
                .get(&("notion".into(), "API-post-search".into())),
            Some(&300)
        );
    }

    #[test]
    fn default_route_policies_cover_chat_and_stream() {
        let rl = RateLimitSettings::default();
        assert_eq!(rl.route_policies["/api/v1/chat"].requests_per_minute, 30);
        assert_eq!(rl.route_policies["/api/v1/chat/stream"].burst_capacity, 2);
        assert!(!rl.route_policies["/healthz"].enabled);
    }

    #[test]
    fn secrets_do_not_serialize() {
        let s = serde_json::to_string(&ModelSettings {
            anthropic_api_key: Some("sk-ant-secret".into()),
            ..ModelSettings::default()
        })
        .unwrap();
        assert!(!s.contains("sk-ant-secret"));
    }
}
