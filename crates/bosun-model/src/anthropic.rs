// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Streaming driver for the Anthropic Messages API.
//!
//! The response arrives as SSE: each `data:` line is one JSON event which
//! [`decode_event`] maps onto the provider-neutral [`ResponseEvent`] set.
//! Tool-call input JSON streams in fragments (`input_json_delta`); the
//! orchestrator reassembles fragments by block index.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent};

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        timeout: Option<Duration>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout.unwrap_or(Duration::from_secs(120)))
            .build()
            .expect("anthropic http client");
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            client,
        }
    }

    fn request_body(&self, req: &CompletionRequest) -> Value {
        let (system, messages) = to_wire(&req.messages);
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "stream": req.stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl crate::ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self
            .api_key
            .as_deref()
            .context("ANTHROPIC_API_KEY not set")?;
        let body = self.request_body(&req);

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            bail!("Anthropic error {status}: {detail}");
        }

        // TCP chunks split SSE lines arbitrarily: keep the tail of each
        // chunk in a carry buffer and only decode complete lines.
        let events = resp
            .bytes_stream()
            .scan(String::new(), |carry, chunk| {
                let batch = match chunk {
                    Ok(bytes) => {
                        carry.push_str(&String::from_utf8_lossy(&bytes));
                        drain_sse_lines(carry).into_iter().map(Ok).collect()
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                futures::future::ready(Some(batch))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(events))
    }
}

/// Pull every complete `data:` line out of the carry buffer and decode it.
fn drain_sse_lines(carry: &mut String) -> Vec<ResponseEvent> {
    let mut out = Vec::new();
    while let Some(newline) = carry.find('\n') {
        let line = carry[..newline].trim_end_matches('\r').to_string();
        carry.drain(..=newline);
        let Some(payload) = line.strip_prefix("data: ") else {
            continue;
        };
        if let Ok(v) = serde_json::from_str::<Value>(payload.trim()) {
            out.push(decode_event(&v));
        }
    }
    out
}

/// Decode one wire event.  Unknown and irrelevant event types (pings,
/// thinking blocks, signatures) collapse to empty text deltas, which the
/// consumer already drops.
pub(crate) fn decode_event(v: &Value) -> ResponseEvent {
    let nothing = || ResponseEvent::TextDelta(String::new());
    match v["type"].as_str().unwrap_or_default() {
        "content_block_start" => {
            let block = &v["content_block"];
            if block["type"].as_str() != Some("tool_use") {
                return nothing();
            }
            ResponseEvent::ToolCall {
                index: v["index"].as_u64().unwrap_or(0) as u32,
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: String::new(),
            }
        }
        "content_block_delta" => match v["delta"]["type"].as_str().unwrap_or_default() {
            "text_delta" => ResponseEvent::TextDelta(
                v["delta"]["text"].as_str().unwrap_or_default().to_string(),
            ),
            "input_json_delta" => ResponseEvent::ToolCall {
                index: v["index"].as_u64().unwrap_or(0) as u32,
                id: String::new(),
                name: String::new(),
                arguments: v["delta"]["partial_json"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => nothing(),
        },
        "message_start" => match v["message"].get("usage") {
            Some(usage) => ResponseEvent::Usage {
                input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: 0,
            },
            None => nothing(),
        },
        "message_delta" => {
            // A max_tokens stop means any in-flight tool-call JSON may be
            // cut short; that signal outranks the usage payload beside it.
            if v["delta"]["stop_reason"].as_str() == Some("max_tokens") {
                return ResponseEvent::MaxTokens;
            }
            match v.get("usage") {
                Some(usage) => ResponseEvent::Usage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                },
                None => nothing(),
            }
        }
        "message_stop" => ResponseEvent::Done,
        _ => nothing(),
    }
}

/// Project our message list onto the Anthropic wire shape.
///
/// The system turn becomes the top-level `system` string; tool calls become
/// assistant `tool_use` blocks and tool results user `tool_result` blocks.
pub(crate) fn to_wire(messages: &[crate::Message]) -> (String, Vec<Value>) {
    use crate::{MessageContent, Role};

    let mut system = String::new();
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());

    for m in messages {
        match (&m.role, &m.content) {
            (Role::System, _) => {
                if let Some(t) = m.as_text() {
                    system = t.to_string();
                }
            }
            (role, MessageContent::Text(t)) => {
                let role = if matches!(role, Role::Assistant) {
                    "assistant"
                } else {
                    "user"
                };
                wire.push(json!({ "role": role, "content": t }));
            }
            (
                _,
                MessageContent::ToolCall {
                    tool_call_id,
                    function,
                },
            ) => {
                // tool_use ids must match ^[a-zA-Z0-9_-]+$; a blank id from a
                // degenerate stream gets a stable placeholder instead of
                // producing a 400 on the next request.
                let id = if tool_call_id.is_empty() {
                    "tc_fallback"
                } else {
                    tool_call_id
                };
                let input: Value =
                    serde_json::from_str(&function.arguments).unwrap_or_else(|_| json!({}));
                wire.push(json!({
                    "role": "assistant",
                    "content": [{
                        "type": "tool_use",
                        "id": id,
                        "name": function.name,
                        "input": input,
                    }]
                }));
            }
            (
                _,
                MessageContent::ToolResult {
                    tool_call_id,
                    content,
                },
            ) => {
                wire.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content,
                    }]
                }));
            }
        }
    }
    (system, wire)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionCall, Message, MessageContent, ModelProvider, Role};

    #[test]
    fn provider_identifies_itself() {
        let p = AnthropicProvider::new("claude-3-5-sonnet-latest".into(), None, None, None, None);
        assert_eq!(p.name(), "anthropic");
        assert_eq!(p.label(), "anthropic/claude-3-5-sonnet-latest");
    }

    #[test]
    fn request_body_carries_system_and_tools() {
        let p = AnthropicProvider::new("m".into(), None, None, Some(1024), None);
        let req = CompletionRequest {
            messages: vec![Message::system("be terse"), Message::user("hi")],
            tools: vec![crate::ToolSchema {
                name: "notion_search".into(),
                description: "Search".into(),
                parameters: json!({"type": "object"}),
            }],
            stream: true,
        };
        let body = p.request_body(&req);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["tools"][0]["name"], "notion_search");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn sse_lines_split_across_chunks_still_decode() {
        let mut carry = String::new();
        carry.push_str("data: {\"type\":\"message_st");
        assert!(drain_sse_lines(&mut carry).is_empty(), "incomplete line waits");
        carry.push_str("op\"}\n");
        let events = drain_sse_lines(&mut carry);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ResponseEvent::Done));
    }

    #[test]
    fn non_data_lines_are_ignored() {
        let mut carry = "event: message_stop\r\n: ping comment\n\n".to_string();
        assert!(drain_sse_lines(&mut carry).is_empty());
    }

    #[test]
    fn usage_flows_from_start_and_delta_events() {
        let start = json!({
            "type": "message_start",
            "message": { "usage": { "input_tokens": 42, "output_tokens": 0 } }
        });
        assert!(matches!(
            decode_event(&start),
            ResponseEvent::Usage { input_tokens: 42, output_tokens: 0 }
        ));

        let delta = json!({ "type": "message_delta", "usage": { "output_tokens": 88 } });
        assert!(matches!(
            decode_event(&delta),
            ResponseEvent::Usage { input_tokens: 0, output_tokens: 88 }
        ));
    }

    #[test]
    fn max_tokens_outranks_usage() {
        let v = json!({
            "type": "message_delta",
            "delta": { "stop_reason": "max_tokens" },
            "usage": { "output_tokens": 4096 }
        });
        assert!(matches!(decode_event(&v), ResponseEvent::MaxTokens));
    }

    #[test]
    fn tool_use_block_opens_a_tool_call() {
        let v = json!({
            "type": "content_block_start",
            "index": 2,
            "content_block": { "type": "tool_use", "id": "toolu_9", "name": "notion_search" }
        });
        match decode_event(&v) {
            ResponseEvent::ToolCall {
                index,
                id,
                name,
                arguments,
            } => {
                assert_eq!((index, id.as_str(), name.as_str()), (2, "toolu_9", "notion_search"));
                assert!(arguments.is_empty());
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn input_json_fragments_keep_their_index() {
        let v = json!({
            "type": "content_block_delta",
            "index": 2,
            "delta": { "type": "input_json_delta", "partial_json": "{\"query\":" }
        });
        assert!(matches!(
            decode_event(&v),
            ResponseEvent::ToolCall { index: 2, arguments, .. } if arguments == "{\"query\":"
        ));
    }

    #[test]
    fn thinking_and_unknown_events_decode_to_nothing() {
        for payload in [
            json!({"type": "ping"}),
            json!({"type": "content_block_delta", "delta": {"type": "thinking_delta", "thinking": "hmm"}}),
            json!({"type": "content_block_delta", "delta": {"type": "signature_delta", "signature": "xx"}}),
        ] {
            assert!(matches!(
                decode_event(&payload),
                ResponseEvent::TextDelta(t) if t.is_empty()
            ));
        }
    }

    #[test]
    fn wire_projection_of_a_tool_round_trip() {
        let call = Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: "tc-7".into(),
                function: FunctionCall {
                    name: "notion_search".into(),
                    arguments: r#"{"query":"X"}"#.into(),
                },
            },
        };
        let result = Message::tool_result("tc-7", "three pages found");
        let (_, wire) = to_wire(&[call, result]);

        assert_eq!(wire[0]["content"][0]["type"], "tool_use");
        assert_eq!(wire[0]["content"][0]["input"]["query"], "X");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[1]["content"][0]["tool_use_id"], "tc-7");
    }

    #[test]
    fn blank_tool_ids_and_broken_arguments_are_defused() {
        let call = Message {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: String::new(),
                function: FunctionCall {
                    name: "t".into(),
                    arguments: "{broken".into(),
                },
            },
        };
        let (_, wire) = to_wire(&[call]);
        assert_eq!(wire[0]["content"][0]["id"], "tc_fallback");
        assert_eq!(wire[0]["content"][0]["input"], json!({}));
    }

    #[test]
    fn tool_role_messages_land_on_the_user_side() {
        let (_, wire) = to_wire(&[Message::tool_result("id-1", "output")]);
        assert_eq!(wire[0]["role"], "user");
    }
}
