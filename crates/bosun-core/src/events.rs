// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use crate::errors::ErrorKind;
use crate::orchestrator::Usage;

/// Events emitted while an agent run is in progress.  The gateway frames
/// these as SSE; non-streaming callers just await the final outcome.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A chunk of assistant text.
    Token(String),
    /// The model asked for a tool; emitted before execution.
    ToolCallStarted { name: String },
    /// Tool execution finished.
    ToolCallFinished {
        name: String,
        cache_hit: bool,
        is_error: bool,
    },
    /// Budget threshold crossed (level is `warning`/`critical`/`over`).
    Warning { level: String, message: String },
    /// Cumulative usage after a model turn.
    UsageUpdate(Usage),
    /// The run failed; terminal.
    Error { kind: ErrorKind, message: String },
    /// The run completed; terminal.
    Done,
}
