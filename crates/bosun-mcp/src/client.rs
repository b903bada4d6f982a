// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! One connection to a remote MCP tool server.
//!
//! The two supported transports (streamable HTTP and SSE) are variants of
//! this single type; callers only see `list_tools` / `call_tool` / `close`.
//! The underlying protocol session is driven by rmcp; bearer credentials
//! ride as a default `Authorization` header on the reqwest client.

use std::time::Duration;

use anyhow::Context as _;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use rmcp::{
    model::{CallToolRequestParam, ClientCapabilities, ClientInfo, Implementation, Tool as McpTool},
    service::{DynService, RunningService},
    transport::{
        sse_client::SseClientConfig,
        streamable_http_client::StreamableHttpClientTransportConfig,
        SseClientTransport, StreamableHttpClientTransport,
    },
    RoleClient, ServiceExt,
};
use serde_json::Value;

use bosun_config::McpTransport;

/// Failure classes for a tool invocation, used by the interceptor to decide
/// on retry and caching.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The server rejected our credentials (401/403).
    #[error("unauthorized: {0}")]
    Auth(String),
    /// The server is unreachable or the session died.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The call reached the server and failed there.
    #[error("execution failure: {0}")]
    Exec(String),
}

pub struct ToolClient {
    running: RunningService<RoleClient, Box<dyn DynService<RoleClient>>>,
}

impl ToolClient {
    /// Open a connection and complete the MCP handshake.
    pub async fn connect(
        transport: McpTransport,
        url: &str,
        bearer_token: Option<&str>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client_info = ClientInfo {
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "bosun".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Implementation::default()
            },
        };

        let http = http_client(bearer_token, timeout)?;
        let running = match transport {
            McpTransport::StreamableHttp => {
                let transport = StreamableHttpClientTransport::with_client(
                    http,
                    StreamableHttpClientTransportConfig::with_uri(url.to_string()),
                );
                client_info
                    .into_dyn()
                    .serve(transport)
                    .await
                    .with_context(|| format!("mcp handshake (streamable http) with {url}"))?
            }
            McpTransport::Sse => {
                let transport = SseClientTransport::start_with_client(
                    http,
                    SseClientConfig {
                        sse_endpoint: url.to_string().into(),
                        ..Default::default()
                    },
                )
                .await
                .with_context(|| format!("sse connect to {url}"))?;
                client_info
                    .into_dyn()
                    .serve(transport)
                    .await
                    .with_context(|| format!("mcp handshake (sse) with {url}"))?
            }
        };

        Ok(Self { running })
    }

    /// Full tool catalogue as reported by the server.
    pub async fn list_tools(&self) -> anyhow::Result<Vec<McpTool>> {
        self.running
            .peer()
            .list_all_tools()
            .await
            .context("tools/list failed")
    }

    /// Invoke a tool by its server-side name.
    ///
    /// The whole `CallToolResult` is serialised so `is_error` and any
    /// structured content survive into the cache and the journal digest.
    pub async fn call_tool(&self, name: &str, args: &Value) -> Result<Value, InvokeError> {
        let arguments = args.as_object().cloned();
        let result = self
            .running
            .peer()
            .call_tool(CallToolRequestParam {
                name: name.to_string().into(),
                arguments,
            })
            .await
            .map_err(classify_service_error)?;
        serde_json::to_value(&result).map_err(|e| InvokeError::Exec(e.to_string()))
    }

    /// Tear down the session.  The transports hold no server-side state,
    /// so dropping the running service is the whole teardown.
    pub fn close(self) {
        drop(self.running);
    }
}

fn http_client(bearer_token: Option<&str>, timeout: Duration) -> anyhow::Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    if let Some(token) = bearer_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("bearer token is not a valid header value")?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("building mcp http client")
}

/// Map an rmcp service error onto the invocation failure classes.  The
/// error chain is matched textually: rmcp wraps transport and HTTP failures
/// in opaque layers, and the status code only survives in the message.
fn classify_service_error<E: std::fmt::Display>(e: E) -> InvokeError {
    let msg = e.to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("403") {
        InvokeError::Auth(msg)
    } else if lower.contains("connect")
        || lower.contains("connection")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("transport")
        || lower.contains("channel closed")
    {
        InvokeError::Transport(msg)
    } else {
        InvokeError::Exec(msg)
    }
}

/// True when a serialised `CallToolResult` reports a tool-level error.
pub(crate) fn is_error_result(value: &Value) -> bool {
    value
        .get("isError")
        .or_else(|| value.get("is_error"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_of_auth_errors() {
        assert!(matches!(
            classify_service_error("HTTP 401 Unauthorized"),
            InvokeError::Auth(_)
        ));
        assert!(matches!(
            classify_service_error("server returned 403"),
            InvokeError::Auth(_)
        ));
    }

    #[test]
    fn classification_of_transport_errors() {
        assert!(matches!(
            classify_service_error("connection refused"),
            InvokeError::Transport(_)
        ));
        assert!(matches!(
            classify_service_error("request timed out"),
            InvokeError::Transport(_)
        ));
    }

    #[test]
    fn everything_else_is_exec() {
        assert!(matches!(
            classify_service_error("tool raised: page not found"),
            InvokeError::Exec(_)
        ));
    }

    #[test]
    fn error_result_detection() {
        assert!(is_error_result(&serde_json::json!({"isError": true})));
        assert!(is_error_result(&serde_json::json!({"is_error": true})));
        assert!(!is_error_result(&serde_json::json!({"isError": false})));
        assert!(!is_error_result(&serde_json::json!({"content": []})));
    }
}
