//! Unified chat-completion client over OpenAI, Gemini and Anthropic.
//!
//! Provides one provider-agnostic `Message` model, a codec and
//! `ProviderAdapter` per provider, a shared retry loop, and `LlmClient` for
//! validating requests, routing them by model prefix and accounting usage.

pub mod anthropic;
mod client;
pub mod config;
pub mod gemini;
pub mod json_mode;
pub mod openai;
mod provider;
pub mod retry;
pub mod tokens;
pub mod tools;
pub mod transport;
mod types;

#[cfg(test)]
mod testing;

pub use anthropic::AnthropicAdapter;
pub use client::*;
pub use config::ClientConfig;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;
pub use provider::{ProviderAdapter, ProviderCall, ProviderReply};
pub use retry::RetryPolicy;
pub use switchboard_types::{ErrorKind, Provider, Result, SwitchboardError};
pub use tools::{Tool, ToolChoice, ToolSchema};
pub use types::*;
