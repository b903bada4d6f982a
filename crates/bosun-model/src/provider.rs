// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionRequest, ResponseEvent};

/// A completion response as it arrives: events until `Done`, errors inline.
pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// The seam to an LLM backend.  One implementation per provider; the
/// orchestrator only ever sees this trait.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider identifier recorded on usage rows (`"anthropic"`).
    fn name(&self) -> &str;

    /// Concrete model id recorded in response metadata.
    fn model_name(&self) -> &str;

    /// Issue one completion and stream the response back.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;

    /// `provider/model` label for log lines.
    fn label(&self) -> String {
        format!("{}/{}", self.name(), self.model_name())
    }
}
