// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Scripted model driver for tests.
//!
//! Each `complete` call pops the next event script off a queue, so a test
//! can stage an exact multi-turn exchange (tool calls included) without a
//! network.  The request that triggered each call is kept for assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent};

pub struct ScriptedMockProvider {
    queue: Arc<Mutex<VecDeque<Vec<ResponseEvent>>>>,
    /// Requests in the order they were received.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Stage the given scripts; call N of `complete` plays script N.
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(scripts.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// One turn, plain text, small usage numbers.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![
            ResponseEvent::TextDelta(reply.into()),
            ResponseEvent::Usage {
                input_tokens: 5,
                output_tokens: 5,
            },
            ResponseEvent::Done,
        ]])
    }

    /// Two turns: a tool request, then a closing text reply once the tool
    /// result has been fed back.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Usage {
                    input_tokens: 8,
                    output_tokens: 4,
                },
                ResponseEvent::Done,
            ],
            vec![
                ResponseEvent::TextDelta(final_text.into()),
                ResponseEvent::Usage {
                    input_tokens: 12,
                    output_tokens: 6,
                },
                ResponseEvent::Done,
            ],
        ])
    }

    /// The most recent request, if any (assertion helper).
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        self.requests.lock().unwrap().push(req);
        // Running off the end of the queue yields a marker turn rather than
        // an error so a looping test fails with a readable assertion.
        let script = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                vec![
                    ResponseEvent::TextDelta("[script queue empty]".into()),
                    ResponseEvent::Done,
                ]
            });
        let items: Vec<anyhow::Result<ResponseEvent>> = script.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

/// Echo driver: one text turn repeating the latest user message.  Handy for
/// wiring smoke tests where the content does not matter.
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("(empty)")
            .to_string();
        let items: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(last_user)),
            Ok(ResponseEvent::Usage {
                input_tokens: 1,
                output_tokens: 1,
            }),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(items)))
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{Message, ModelProvider};

    fn req(text: &str) -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user(text)],
            stream: true,
            ..Default::default()
        }
    }

    async fn collect(mut s: ResponseStream) -> Vec<ResponseEvent> {
        let mut out = Vec::new();
        while let Some(ev) = s.next().await {
            out.push(ev.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn scripts_play_in_order_then_run_dry() {
        let p = ScriptedMockProvider::tool_then_text("c1", "time_now", "{}", "noon");

        let first = collect(p.complete(req("a")).await.unwrap()).await;
        assert!(first
            .iter()
            .any(|e| matches!(e, ResponseEvent::ToolCall { name, .. } if name == "time_now")));

        let second = collect(p.complete(req("b")).await.unwrap()).await;
        assert!(second
            .iter()
            .any(|e| matches!(e, ResponseEvent::TextDelta(t) if t == "noon")));

        let dry = collect(p.complete(req("c")).await.unwrap()).await;
        assert!(dry
            .iter()
            .any(|e| matches!(e, ResponseEvent::TextDelta(t) if t.contains("queue empty"))));
    }

    #[tokio::test]
    async fn requests_are_recorded_for_assertions() {
        let p = ScriptedMockProvider::always_text("ok");
        let _ = p.complete(req("what time is it?")).await.unwrap();
        let seen = p.last_request().expect("request recorded");
        assert_eq!(seen.messages.len(), 1);
        assert_eq!(seen.messages[0].as_text(), Some("what time is it?"));
    }

    #[tokio::test]
    async fn echo_driver_repeats_the_user() {
        let events = collect(MockProvider.complete(req("ping")).await.unwrap()).await;
        assert!(matches!(&events[0], ResponseEvent::TextDelta(t) if t == "ping"));
        assert!(matches!(events.last(), Some(ResponseEvent::Done)));
    }
}
