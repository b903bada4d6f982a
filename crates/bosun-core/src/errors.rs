// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The fixed error taxonomy every agent-loop failure is normalised into.

use serde::Serialize;

use crate::context::ToolError;

/// Runtime error buckets exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    #[serde(rename = "MODEL_PROVIDER_ERROR")]
    ModelProvider,
    #[serde(rename = "MCP_UNAVAILABLE")]
    McpUnavailable,
    #[serde(rename = "TOOL_EXEC_ERROR")]
    ToolExec,
    #[serde(rename = "APP_UNEXPECTED")]
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelProvider => "MODEL_PROVIDER_ERROR",
            Self::McpUnavailable => "MCP_UNAVAILABLE",
            Self::ToolExec => "TOOL_EXEC_ERROR",
            Self::Unexpected => "APP_UNEXPECTED",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{kind:?}: {message}")]
    Runtime { kind: ErrorKind, message: String },
    /// The per-request wall-clock budget ran out (maps to 504, not a
    /// runtime bucket).
    #[error("agent run timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("agent run cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn model(message: impl Into<String>) -> Self {
        Self::Runtime {
            kind: ErrorKind::ModelProvider,
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Runtime {
            kind: ErrorKind::Unexpected,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Runtime { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<ToolError> for AgentError {
    fn from(e: ToolError) -> Self {
        let kind = match &e {
            ToolError::Unavailable(_) => ErrorKind::McpUnavailable,
            ToolError::Auth(_) | ToolError::Exec(_) => ErrorKind::ToolExec,
        };
        Self::Runtime {
            kind,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_errors_map_to_buckets() {
        let e: AgentError = ToolError::Unavailable("down".into()).into();
        assert_eq!(e.kind(), Some(ErrorKind::McpUnavailable));

        let e: AgentError = ToolError::Exec("boom".into()).into();
        assert_eq!(e.kind(), Some(ErrorKind::ToolExec));

        let e: AgentError = ToolError::Auth("401".into()).into();
        assert_eq!(e.kind(), Some(ErrorKind::ToolExec));
    }

    #[test]
    fn kind_strings_are_the_wire_codes() {
        assert_eq!(ErrorKind::ModelProvider.as_str(), "MODEL_PROVIDER_ERROR");
        assert_eq!(ErrorKind::McpUnavailable.as_str(), "MCP_UNAVAILABLE");
        assert_eq!(ErrorKind::ToolExec.as_str(), "TOOL_EXEC_ERROR");
        assert_eq!(ErrorKind::Unexpected.as_str(), "APP_UNEXPECTED");
    }

    #[test]
    fn timeout_has_no_runtime_kind() {
        assert!(AgentError::Timeout { seconds: 30 }.kind().is_none());
    }
}
