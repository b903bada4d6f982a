// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent loop: model call → tool calls → repeat, with every tool call
//! serialised through the dispatcher under a strictly increasing call
//! index.
//!
//! Tool failures are fed back into the conversation as error results so
//! the model can adapt; only an unreachable tool server aborts the run
//! (`MCP_UNAVAILABLE`).  Wall-clock and tool-call budgets bound every run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use bosun_model::{
    CompletionRequest, FunctionCall, Message, MessageContent, ModelProvider, ResponseEvent, Role,
    ToolSchema,
};

use crate::context::{CallContext, ToolDispatcher, ToolError};
use crate::errors::AgentError;
use crate::events::AgentEvent;

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub context: CallContext,
    /// Prior conversation turns.  The caller is responsible for excluding
    /// the just-persisted user message; it is passed separately below.
    pub history: Vec<Message>,
    pub user_message: String,
    pub max_tool_calls: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub cache_hit: bool,
    pub cache_ttl_remaining_s: Option<i64>,
    pub is_error: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatOutcome {
    pub reply: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub usage: Usage,
    pub duration_ms: u64,
    pub model: String,
}

pub struct Orchestrator {
    model: Arc<dyn ModelProvider>,
    dispatcher: Arc<dyn ToolDispatcher>,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn ModelProvider>, dispatcher: Arc<dyn ToolDispatcher>) -> Self {
        Self { model, dispatcher }
    }

    /// Run one chat request.  Events go to `tx` as they happen; the final
    /// outcome is also returned for the non-streaming path.  Cancellation
    /// (client disconnect) and the timeout both stop the run at the next
    /// suspension point.
    pub async fn run(
        &self,
        req: AgentRequest,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<ChatOutcome, AgentError> {
        let timeout = req.timeout;
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            run = tokio::time::timeout(timeout, self.run_inner(req, &tx, started)) => {
                match run {
                    Ok(outcome) => outcome,
                    Err(_) => Err(AgentError::Timeout { seconds: timeout.as_secs() }),
                }
            }
        };

        match &result {
            Ok(_) => {
                let _ = tx.send(AgentEvent::Done).await;
            }
            Err(AgentError::Cancelled) => {}
            Err(e) => {
                let kind = e.kind().unwrap_or(crate::errors::ErrorKind::Unexpected);
                let _ = tx
                    .send(AgentEvent::Error {
                        kind,
                        message: e.to_string(),
                    })
                    .await;
            }
        }
        result
    }

    async fn run_inner(
        &self,
        req: AgentRequest,
        tx: &mpsc::Sender<AgentEvent>,
        started: Instant,
    ) -> Result<ChatOutcome, AgentError> {
        let toolset = self.dispatcher.toolset(req.context.user_id).await;
        let tools: Vec<ToolSchema> = toolset
            .into_iter()
            .map(|t| ToolSchema {
                name: t.name,
                description: t.description,
                parameters: t.input_schema,
            })
            .collect();

        let mut messages: Vec<Message> = Vec::with_capacity(req.history.len() + 2);
        messages.push(Message::system(system_prompt()));
        messages.extend(req.history.iter().cloned());
        messages.push(Message::user(&req.user_message));

        let mut reply = String::new();
        let mut usage = Usage::default();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut next_call_index: u32 = 0;
        let mut budget_exhausted = false;

        loop {
            let with_tools = !budget_exhausted;
            let turn = self
                .stream_one_turn(&messages, if with_tools { &tools } else { &[] }, tx)
                .await?;
            usage.input_tokens += turn.usage.input_tokens;
            usage.output_tokens += turn.usage.output_tokens;
            let _ = tx.send(AgentEvent::UsageUpdate(usage)).await;

            if !turn.text.is_empty() {
                reply.push_str(&turn.text);
                messages.push(Message::assistant(&turn.text));
            }

            if turn.tool_calls.is_empty() || budget_exhausted {
                break;
            }

            for tc in turn.tool_calls {
                if next_call_index >= req.max_tool_calls {
                    // Budget reached: tell the model and give it one final
                    // tool-free turn to wrap up instead of failing hard.
                    warn!(
                        request_id = %req.context.request_id,
                        max_tool_calls = req.max_tool_calls,
                        "tool-call budget reached"
                    );
                    messages.push(Message::user(format!(
                        "The tool-call budget for this request ({}) is used up. \
                         Do not call any more tools; answer with what you have.",
                        req.max_tool_calls
                    )));
                    budget_exhausted = true;
                    break;
                }

                let _ = tx
                    .send(AgentEvent::ToolCallStarted {
                        name: tc.name.clone(),
                    })
                    .await;

                let args: Value = serde_json::from_str(&tc.arguments).unwrap_or_else(|e| {
                    warn!(tool = %tc.name, error = %e, "tool arguments not valid JSON, substituting {{}}");
                    Value::Object(Default::default())
                });

                let ctx = req.context.with_index(next_call_index);
                next_call_index += 1;

                let call_started = Instant::now();
                let (result_text, cache_hit, ttl_remaining, is_error) =
                    match self.dispatcher.dispatch(&ctx, &tc.name, &args).await {
                        Ok(outcome) => (
                            outcome.value.to_string(),
                            outcome.cache_hit,
                            outcome.cache_ttl_remaining_s,
                            false,
                        ),
                        Err(ToolError::Unavailable(msg)) => {
                            return Err(ToolError::Unavailable(msg).into());
                        }
                        // Auth (already retried once below the seam) and
                        // execution failures go back to the model as error
                        // results; it can try another tool or explain.
                        Err(e) => (format!("tool error: {e}"), false, None, true),
                    };

                records.push(ToolCallRecord {
                    name: tc.name.clone(),
                    cache_hit,
                    cache_ttl_remaining_s: ttl_remaining,
                    is_error,
                    duration_ms: call_started.elapsed().as_millis() as u64,
                });
                let _ = tx
                    .send(AgentEvent::ToolCallFinished {
                        name: tc.name.clone(),
                        cache_hit,
                        is_error,
                    })
                    .await;

                messages.push(Message {
                    role: Role::Assistant,
                    content: MessageContent::ToolCall {
                        tool_call_id: tc.id.clone(),
                        function: FunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    },
                });
                messages.push(Message::tool_result(&tc.id, &result_text));
            }
        }

        Ok(ChatOutcome {
            reply,
            tool_calls: records,
            usage,
            duration_ms: started.elapsed().as_millis() as u64,
            model: self.model.model_name().to_string(),
        })
    }

    /// One model turn: stream deltas out, collect the full text, usage, and
    /// any tool calls (parallel fragments reassembled by index).
    async fn stream_one_turn(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<Turn, AgentError> {
        let req = CompletionRequest {
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            stream: true,
        };
        let mut stream = self
            .model
            .complete(req)
            .await
            .map_err(|e| AgentError::model(e.to_string()))?;

        let mut text = String::new();
        let mut usage = Usage::default();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        let mut truncated = false;

        while let Some(event) = stream.next().await {
            match event.map_err(|e| AgentError::model(e.to_string()))? {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    text.push_str(&delta);
                    let _ = tx.send(AgentEvent::Token(delta)).await;
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let p = pending.entry(index).or_default();
                    if !id.is_empty() {
                        p.id = id;
                    }
                    if !name.is_empty() {
                        p.name = name;
                    }
                    p.arguments.push_str(&arguments);
                }
                ResponseEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    usage.input_tokens += input_tokens as u64;
                    usage.output_tokens += output_tokens as u64;
                }
                ResponseEvent::MaxTokens => truncated = true,
                ResponseEvent::Done => break,
            }
        }

        // Reassemble parallel tool calls in index order.  Nameless calls
        // cannot be dispatched and are dropped; truncated argument buffers
        // (MaxTokens) are dropped too rather than dispatched half-parsed.
        let mut calls: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        calls.sort_by_key(|(i, _)| *i);
        let tool_calls: Vec<CompletedToolCall> = calls
            .into_iter()
            .filter_map(|(_, p)| {
                if p.name.is_empty() {
                    warn!("dropping tool call with empty name from model");
                    return None;
                }
                if truncated && serde_json::from_str::<Value>(&p.arguments).is_err() {
                    warn!(tool = %p.name, "dropping tool call truncated by max_tokens");
                    return None;
                }
                Some(CompletedToolCall {
                    id: if p.id.is_empty() {
                        format!("tc_synthetic_{}", p.name)
                    } else {
                        p.id
                    },
                    name: p.name,
                    arguments: if p.arguments.is_empty() {
                        "{}".to_string()
                    } else {
                        p.arguments
                    },
                })
            })
            .collect();

        Ok(Turn {
            text,
            tool_calls,
            usage,
        })
    }
}

fn system_prompt() -> String {
    "You are a capable assistant with access to external tools. \
     Use tools when they help answer the request; answer directly when they do not. \
     Be concise and accurate."
        .to_string()
}

struct Turn {
    text: String,
    tool_calls: Vec<CompletedToolCall>,
    usage: Usage,
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

struct CompletedToolCall {
    id: String,
    name: String,
    arguments: String,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bosun_model::ScriptedMockProvider;
    use std::sync::Mutex;
    use uuid::Uuid;

    use crate::context::{CacheMode, DispatchOutcome, ToolSpec};
    use crate::errors::ErrorKind;

    /// Dispatcher that records calls and returns canned results.
    struct ScriptedDispatcher {
        calls: Mutex<Vec<(u32, String, Value)>>,
        result: Result<DispatchOutcome, fn() -> ToolError>,
    }

    impl ScriptedDispatcher {
        fn ok(value: Value) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                result: Ok(DispatchOutcome {
                    value,
                    cache_hit: false,
                    cache_ttl_remaining_s: None,
                }),
            }
        }

        fn failing(f: fn() -> ToolError) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                result: Err(f),
            }
        }
    }

    #[async_trait]
    impl ToolDispatcher for ScriptedDispatcher {
        async fn toolset(&self, _user: Option<Uuid>) -> Vec<ToolSpec> {
            vec![ToolSpec {
                name: "time_now".into(),
                description: "Current time".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }]
        }

        async fn dispatch(
            &self,
            ctx: &CallContext,
            name: &str,
            args: &Value,
        ) -> Result<DispatchOutcome, ToolError> {
            self.calls
                .lock()
                .unwrap()
                .push((ctx.call_index, name.to_string(), args.clone()));
            match &self.result {
                Ok(outcome) => Ok(outcome.clone()),
                Err(f) => Err(f()),
            }
        }
    }

    fn request() -> AgentRequest {
        AgentRequest {
            context: CallContext {
                request_id: Uuid::new_v4(),
                thread_id: Uuid::new_v4(),
                user_message_id: Uuid::new_v4(),
                user_id: None,
                workspace_id: None,
                cache_mode: CacheMode::Prefer,
                call_index: 0,
                force_retry: false,
            },
            history: Vec::new(),
            user_message: "what time is it?".into(),
            max_tool_calls: 5,
            timeout: Duration::from_secs(10),
        }
    }

    fn orchestrator(
        model: ScriptedMockProvider,
        dispatcher: Arc<ScriptedDispatcher>,
    ) -> Orchestrator {
        Orchestrator::new(Arc::new(model), dispatcher)
    }

    #[tokio::test]
    async fn plain_text_run_returns_reply_and_usage() {
        let o = orchestrator(
            ScriptedMockProvider::always_text("hello there"),
            Arc::new(ScriptedDispatcher::ok(serde_json::json!({}))),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = o
            .run(request(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.reply, "hello there");
        assert_eq!(outcome.usage.input_tokens, 5);
        assert!(outcome.tool_calls.is_empty());

        let mut saw_done = false;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, AgentEvent::Done) {
                saw_done = true;
            }
        }
        assert!(saw_done, "stream must end with Done");
    }

    #[tokio::test]
    async fn tool_call_round_trips_through_dispatcher() {
        let dispatcher = Arc::new(ScriptedDispatcher::ok(serde_json::json!({"time": "12:00"})));
        let o = orchestrator(
            ScriptedMockProvider::tool_then_text("c1", "time_now", r#"{"tz":"UTC"}"#, "it is noon"),
            Arc::clone(&dispatcher),
        );
        let (tx, _rx) = mpsc::channel(64);
        let outcome = o
            .run(request(), tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.reply, "it is noon");
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, "time_now");

        let calls = dispatcher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 0, "first call gets index 0");
        assert_eq!(calls[0].2["tz"], "UTC");
    }

    #[tokio::test]
    async fn call_indices_increase_strictly() {
        // Two rounds of tool calls, then text.
        let model = ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "a".into(),
                    name: "time_now".into(),
                    arguments: "{}".into(),
                },
                ResponseEvent::Done,
            ],
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "b".into(),
                    name: "time_now".into(),
                    arguments: "{}".into(),
                },
                ResponseEvent::Done,
            ],
            vec![ResponseEvent::TextDelta("done".into()), ResponseEvent::Done],
        ]);
        let dispatcher = Arc::new(ScriptedDispatcher::ok(serde_json::json!({})));
        let o = orchestrator(model, Arc::clone(&dispatcher));
        let (tx, _rx) = mpsc::channel(64);
        o.run(request(), tx, CancellationToken::new())
            .await
            .unwrap();

        let calls = dispatcher.calls.lock().unwrap();
        let indices: Vec<u32> = calls.iter().map(|c| c.0).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn unavailable_server_aborts_with_mcp_bucket() {
        let o = orchestrator(
            ScriptedMockProvider::tool_then_text("c1", "time_now", "{}", "never reached"),
            Arc::new(ScriptedDispatcher::failing(|| {
                ToolError::Unavailable("gone".into())
            })),
        );
        let (tx, _rx) = mpsc::channel(64);
        let err = o
            .run(request(), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::McpUnavailable));
    }

    #[tokio::test]
    async fn exec_failure_feeds_back_and_run_completes() {
        let o = orchestrator(
            ScriptedMockProvider::tool_then_text("c1", "time_now", "{}", "tool was broken"),
            Arc::new(ScriptedDispatcher::failing(|| {
                ToolError::Exec("boom".into())
            })),
        );
        let (tx, _rx) = mpsc::channel(64);
        let outcome = o
            .run(request(), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.reply, "tool was broken");
        assert!(outcome.tool_calls[0].is_error);
    }

    #[tokio::test]
    async fn budget_forces_final_tool_free_turn() {
        // Model wants tools forever; budget is 1.
        let model = ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "a".into(),
                    name: "time_now".into(),
                    arguments: "{}".into(),
                },
                ResponseEvent::ToolCall {
                    index: 1,
                    id: "b".into(),
                    name: "time_now".into(),
                    arguments: "{}".into(),
                },
                ResponseEvent::Done,
            ],
            vec![
                ResponseEvent::TextDelta("wrapping up".into()),
                ResponseEvent::Done,
            ],
        ]);
        let dispatcher = Arc::new(ScriptedDispatcher::ok(serde_json::json!({})));
        let o = orchestrator(model, Arc::clone(&dispatcher));
        let mut req = request();
        req.max_tool_calls = 1;
        let (tx, _rx) = mpsc::channel(64);
        let outcome = o.run(req, tx, CancellationToken::new()).await.unwrap();

        assert_eq!(dispatcher.calls.lock().unwrap().len(), 1);
        assert_eq!(outcome.reply, "wrapping up");
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let o = orchestrator(
            ScriptedMockProvider::always_text("never"),
            Arc::new(ScriptedDispatcher::ok(serde_json::json!({}))),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(64);
        let err = o.run(request(), tx, cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn parallel_tool_calls_execute_in_index_order() {
        let model = ScriptedMockProvider::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 1,
                    id: "second".into(),
                    name: "time_now".into(),
                    arguments: r#"{"which":"second"}"#.into(),
                },
                ResponseEvent::ToolCall {
                    index: 0,
                    id: "first".into(),
                    name: "time_now".into(),
                    arguments: r#"{"which":"first"}"#.into(),
                },
                ResponseEvent::Done,
            ],
            vec![ResponseEvent::TextDelta("ok".into()), ResponseEvent::Done],
        ]);
        let dispatcher = Arc::new(ScriptedDispatcher::ok(serde_json::json!({})));
        let o = orchestrator(model, Arc::clone(&dispatcher));
        let (tx, _rx) = mpsc::channel(64);
        o.run(request(), tx, CancellationToken::new())
            .await
            .unwrap();

        let calls = dispatcher.calls.lock().unwrap();
        assert_eq!(calls[0].2["which"], "first");
        assert_eq!(calls[1].2["which"], "second");
    }
}
