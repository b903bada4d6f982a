// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Environment loader and validation.
//!
//! All variables are read up front, every problem is collected, and the
//! caller gets a single error listing everything that must be fixed.  This
//! avoids the fix-one-rerun-find-the-next loop during deployment.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::schema::{
    AppEnv, McpServerConfig, McpTransport, RatePolicy, Settings,
};

/// Load settings from the process environment.
pub fn load() -> Result<Settings> {
    let vars: HashMap<String, String> = std::env::vars().collect();
    load_from(&vars)
}

/// Load settings from an explicit variable map (tests construct these).
pub fn load_from(vars: &HashMap<String, String>) -> Result<Settings> {
    let mut errors: Vec<String> = Vec::new();
    let get = |k: &str| vars.get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let app_env = match get("APP_ENV") {
        Some(v) => AppEnv::parse(&v).unwrap_or_else(|| {
            errors.push(format!("APP_ENV: unknown environment {v:?}"));
            AppEnv::Development
        }),
        None => AppEnv::Development,
    };

    let api_key = get("API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        errors.push("API_KEY is required".into());
    } else if app_env.is_production() && api_key.len() < 32 {
        errors.push("API_KEY must be at least 32 characters in production".into());
    }

    let fernet_key = get("FERNET_KEY").unwrap_or_default();
    if fernet_key.is_empty() {
        errors.push("FERNET_KEY is required (32 bytes, url-safe base64)".into());
    }
    let fernet_retired_keys: Vec<String> = get("FERNET_KEYS")
        .map(|v| {
            v.split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let database_url = get("DATABASE_URL");
    if database_url.is_none() && app_env.is_production() {
        errors.push("DATABASE_URL is required in production".into());
    }

    let cors_origins = parse_origins(get("CORS_ORIGINS").as_deref().unwrap_or(""));
    if app_env.is_production() && cors_origins.iter().any(|o| o == "*") {
        errors.push("CORS wildcard (*) not allowed in production".into());
    }

    let mut settings = Settings {
        app_env,
        listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".into()),
        api_key,
        cors_origins,
        database_url,
        database_pool_size: parse_num(&get, "DATABASE_POOL_SIZE", 10, &mut errors),
        database_pool_timeout_s: parse_num(&get, "DATABASE_POOL_TIMEOUT", 30, &mut errors),
        fernet_key,
        fernet_retired_keys,
        notion: Default::default(),
        oauth: Default::default(),
        model: Default::default(),
        cache: Default::default(),
        rate_limit: Default::default(),
        mcp_servers: Vec::new(),
        mcp_timeout_ms: parse_num(&get, "MCP_TIMEOUT_MS", 30_000, &mut errors),
        mcp_tool_cache_ttl_s: parse_num(&get, "MCP_TOOL_CACHE_TTL_SECONDS", 600, &mut errors),
        mcp_health_interval_s: parse_num(&get, "MCP_HEALTH_INTERVAL_SECONDS", 30, &mut errors),
        max_body_bytes: parse_num(&get, "MAX_BODY_BYTES", 5 * 1024 * 1024, &mut errors),
        request_timeout_s: parse_num(&get, "REQUEST_TIMEOUT_SECONDS", 60, &mut errors),
        agent_timeout_s: parse_num(&get, "AGENT_TIMEOUT_SECONDS", 120, &mut errors),
        max_tool_calls: parse_num(&get, "MAX_TOOL_CALLS", 15, &mut errors),
        share_token_ttl_hours: parse_num(&get, "SHARE_TOKEN_TTL_HOURS", 72, &mut errors),
        default_user_id: get("DEFAULT_USER_ID"),
    };

    if !(1_000..=120_000).contains(&settings.mcp_timeout_ms) {
        errors.push("MCP_TIMEOUT_MS must be between 1000 and 120000".into());
    }

    // Notion OAuth application.
    settings.notion.client_id = get("NOTION_CLIENT_ID");
    settings.notion.client_secret = get("NOTION_CLIENT_SECRET");
    settings.notion.redirect_uri = get("NOTION_REDIRECT_URI");
    if let Some(v) = get("NOTION_AUTH_URL") {
        settings.notion.auth_url = v;
    }
    if let Some(v) = get("NOTION_TOKEN_URL") {
        settings.notion.token_url = v;
    }
    if let Some(v) = get("NOTION_MCP_URL") {
        settings.notion.mcp_url = v;
    }
    if let Some(v) = get("FEATURE_NOTION_HOSTED_MCP") {
        settings.notion.hosted_mcp_enabled = parse_bool(&v, "FEATURE_NOTION_HOSTED_MCP", &mut errors);
    }
    if let Some(uri) = &settings.notion.redirect_uri {
        if url::Url::parse(uri).is_err() {
            errors.push(format!("NOTION_REDIRECT_URI is not a valid URL: {uri:?}"));
        }
    }

    // OAuth refresh tunables.
    settings.oauth.refresh_window_minutes =
        parse_num(&get, "OAUTH_REFRESH_WINDOW_MINUTES", 5, &mut errors);
    settings.oauth.refresh_jitter_seconds =
        parse_num(&get, "OAUTH_REFRESH_JITTER_SECONDS", 60, &mut errors);
    settings.oauth.refresh_max_retries =
        parse_num(&get, "OAUTH_REFRESH_MAX_RETRIES", 3, &mut errors);
    settings.oauth.max_failure_count =
        parse_num(&get, "OAUTH_MAX_FAILURE_COUNT", 5, &mut errors);
    settings.oauth.clock_skew_seconds =
        parse_num(&get, "OAUTH_CLOCK_SKEW_SECONDS", 30, &mut errors);
    if let Some(v) = get("OAUTH_BACKGROUND_REFRESH_ENABLED") {
        settings.oauth.background_refresh_enabled =
            parse_bool(&v, "OAUTH_BACKGROUND_REFRESH_ENABLED", &mut errors);
    }

    // Model driver.
    settings.model.anthropic_api_key = get("ANTHROPIC_API_KEY");
    if let Some(v) = get("ANTHROPIC_BASE_URL") {
        settings.model.anthropic_base_url = v;
    }
    if let Some(v) = get("ANTHROPIC_MODEL") {
        settings.model.model = v;
    }
    settings.model.max_output_tokens =
        parse_num(&get, "ANTHROPIC_MAX_OUTPUT_TOKENS", 4096, &mut errors);
    settings.model.request_timeout_s =
        parse_num(&get, "ANTHROPIC_TIMEOUT_SECONDS", 120, &mut errors);

    // Cache TTL default + allowlist extensions ("server:tool" → ttl seconds).
    settings.cache.ttl_default_s = parse_num(&get, "CACHE_TTL_DEFAULT", 3600, &mut errors);
    if let Some(raw) = get("CACHEABLE_TOOLS") {
        match serde_json::from_str::<HashMap<String, u64>>(&raw) {
            Ok(extra) => {
                for (k, ttl) in extra {
                    match k.split_once(':') {
                        Some((server, tool)) => {
                            settings
                                .cache
                                .cacheable_tools
                                .insert((server.to_string(), tool.to_string()), ttl);
                        }
                        None => errors.push(format!(
                            "CACHEABLE_TOOLS: key {k:?} must be \"server:tool\""
                        )),
                    }
                }
            }
            Err(e) => errors.push(format!("CACHEABLE_TOOLS: invalid JSON: {e}")),
        }
    }

    // Rate limiting.
    settings.rate_limit.default_policy.requests_per_minute =
        parse_num(&get, "RATE_LIMIT_RPM", 60, &mut errors);
    settings.rate_limit.default_policy.burst_capacity =
        parse_num(&get, "RATE_LIMIT_BURST", 10, &mut errors);
    if let Some(raw) = get("RATE_LIMIT_ROUTE_OVERRIDES") {
        match serde_json::from_str::<HashMap<String, RouteOverride>>(&raw) {
            Ok(overrides) => {
                for (route, o) in overrides {
                    settings.rate_limit.route_policies.insert(
                        route,
                        RatePolicy {
                            requests_per_minute: o.requests_per_minute.unwrap_or(60),
                            burst_capacity: o.burst_capacity.unwrap_or(10),
                            enabled: o.enabled.unwrap_or(true),
                        },
                    );
                }
            }
            Err(e) => errors.push(format!("RATE_LIMIT_ROUTE_OVERRIDES: invalid JSON: {e}")),
        }
    }

    // Global MCP servers, e.g.
    // MCP_SERVERS='[{"name":"time","url":"https://mcp-time.example.com/mcp"}]'
    if let Some(raw) = get("MCP_SERVERS") {
        match serde_json::from_str::<Vec<McpServerEntry>>(&raw) {
            Ok(entries) => {
                for e in entries {
                    let transport = match e.transport.as_deref() {
                        None | Some("streamable_http") => McpTransport::StreamableHttp,
                        Some("sse") => McpTransport::Sse,
                        Some(other) => {
                            errors.push(format!(
                                "MCP_SERVERS: server {:?} has unknown transport {other:?}",
                                e.name
                            ));
                            McpTransport::StreamableHttp
                        }
                    };
                    let tool_prefix = e.tool_prefix.unwrap_or_else(|| format!("{}_", e.name));
                    settings.mcp_servers.push(McpServerConfig {
                        name: e.name,
                        url: e.url,
                        transport,
                        tool_prefix,
                        enabled: e.enabled.unwrap_or(true),
                    });
                }
            }
            Err(e) => errors.push(format!("MCP_SERVERS: invalid JSON: {e}")),
        }
    }

    if errors.is_empty() {
        Ok(settings)
    } else {
        Err(anyhow!("configuration invalid:\n  - {}", errors.join("\n  - ")))
    }
}

#[derive(serde::Deserialize)]
struct RouteOverride {
    requests_per_minute: Option<u32>,
    burst_capacity: Option<u32>,
    enabled: Option<bool>,
}

#[derive(serde::Deserialize)]
struct McpServerEntry {
    name: String,
    url: String,
    transport: Option<String>,
    tool_prefix: Option<String>,
    enabled: Option<bool>,
}

/// CORS origins accept either a JSON array or a comma-separated list.
fn parse_origins(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if raw.starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(raw) {
            return list
                .into_iter()
                .map(|o| o.trim_end_matches('/').to_string())
                .collect();
        }
    }
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/').to_string())
        .filter(|o| !o.is_empty())
        .collect()
}

fn parse_num<T, F>(get: &F, key: &str, default: T, errors: &mut Vec<String>) -> T
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => default,
        Some(v) => v.parse().unwrap_or_else(|_| {
            errors.push(format!("{key}: cannot parse {v:?}"));
            default
        }),
    }
}

fn parse_bool(v: &str, key: &str, errors: &mut Vec<String>) -> bool {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            errors.push(format!("{key}: cannot parse {v:?} as bool"));
            false
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("API_KEY".into(), "k".repeat(40));
        m.insert("FERNET_KEY".into(), "A".repeat(43));
        m
    }

    #[test]
    fn minimal_dev_config_loads() {
        let s = load_from(&base_vars()).unwrap();
        assert_eq!(s.app_env, AppEnv::Development);
        assert_eq!(s.listen_addr, "0.0.0.0:8080");
        assert_eq!(s.max_body_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let mut v = base_vars();
        v.remove("API_KEY");
        let err = load_from(&v).unwrap_err().to_string();
        assert!(err.contains("API_KEY"), "{err}");
    }

    #[test]
    fn production_requires_long_api_key_and_database() {
        let mut v = base_vars();
        v.insert("APP_ENV".into(), "production".into());
        v.insert("API_KEY".into(), "short".into());
        let err = load_from(&v).unwrap_err().to_string();
        assert!(err.contains("32 characters"), "{err}");
        assert!(err.contains("DATABASE_URL"), "{err}");
    }

    #[test]
    fn cors_wildcard_rejected_in_production_only() {
        let mut v = base_vars();
        v.insert("CORS_ORIGINS".into(), "*".into());
        assert!(load_from(&v).is_ok());

        v.insert("APP_ENV".into(), "production".into());
        v.insert("DATABASE_URL".into(), "postgres://localhost/bosun".into());
        let err = load_from(&v).unwrap_err().to_string();
        assert!(err.contains("wildcard"), "{err}");
    }

    #[test]
    fn cors_accepts_json_array_and_csv() {
        assert_eq!(
            parse_origins(r#"["https://a.example","https://b.example/"]"#),
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(
            parse_origins("https://a.example, https://b.example"),
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn retired_fernet_keys_split_on_commas() {
        let mut v = base_vars();
        v.insert("FERNET_KEYS".into(), "old1, old2,,old3".into());
        let s = load_from(&v).unwrap();
        assert_eq!(s.fernet_retired_keys, vec!["old1", "old2", "old3"]);
    }

    #[test]
    fn route_overrides_merge_over_defaults() {
        let mut v = base_vars();
        v.insert(
            "RATE_LIMIT_ROUTE_OVERRIDES".into(),
            r#"{"/api/v1/chat":{"requests_per_minute":10,"burst_capacity":3}}"#.into(),
        );
        let s = load_from(&v).unwrap();
        let p = &s.rate_limit.route_policies["/api/v1/chat"];
        assert_eq!(p.requests_per_minute, 10);
        assert_eq!(p.burst_capacity, 3);
        // Untouched defaults survive the merge.
        assert_eq!(
            s.rate_limit.route_policies["/api/v1/chat/stream"].requests_per_minute,
            6
        );
    }

    #[test]
    fn cacheable_tools_env_extends_allowlist() {
        let mut v = base_vars();
        v.insert(
            "CACHEABLE_TOOLS".into(),
            r#"{"atlassian:get_issue": 120}"#.into(),
        );
        let s = load_from(&v).unwrap();
        assert_eq!(s.cacheable_ttl("atlassian", "get_issue"), Some(120));
        assert_eq!(s.cacheable_ttl("notion", "API-retrieve-a-page"), Some(900));
    }

    #[test]
    fn mcp_servers_parse_with_default_prefix_and_transport() {
        let mut v = base_vars();
        v.insert(
            "MCP_SERVERS".into(),
            r#"[{"name":"time","url":"https://mcp-time.example.com/mcp"},
                {"name":"events","url":"https://mcp-events.example.com/sse","transport":"sse"}]"#
                .into(),
        );
        let s = load_from(&v).unwrap();
        assert_eq!(s.mcp_servers.len(), 2);
        assert_eq!(s.mcp_servers[0].tool_prefix, "time_");
        assert_eq!(s.mcp_servers[0].transport, McpTransport::StreamableHttp);
        assert_eq!(s.mcp_servers[1].transport, McpTransport::Sse);
    }

    #[test]
    fn bad_mcp_timeout_is_rejected() {
        let mut v = base_vars();
        v.insert("MCP_TIMEOUT_MS".into(), "500".into());
        let err = load_from(&v).unwrap_err().to_string();
        assert!(err.contains("MCP_TIMEOUT_MS"), "{err}");
    }
}
