// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The LLM boundary: message/tool wire types, the [`ModelProvider`] trait,
//! the streaming Anthropic driver, and scripted mocks for tests.

mod anthropic;
mod mock;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use types::*;
