//! Shared types and errors for the Switchboard crates.
//!
//! This crate provides the foundational types used across the workspace:
//! - `Provider`: the closed set of chat-completion backends
//! - `SwitchboardError`: unified error taxonomy
//! - `ErrorKind`: the classification callers branch on

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// One of the three supported chat-completion services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "anthropic")]
    Anthropic,
}

/// Model-name prefixes and the provider that serves them. Checked in order.
const MODEL_PREFIXES: &[(&str, Provider)] = &[
    ("gpt", Provider::OpenAi),
    ("chatgpt", Provider::OpenAi),
    ("o1", Provider::OpenAi),
    ("o3", Provider::OpenAi),
    ("o4", Provider::OpenAi),
    ("gemini", Provider::Gemini),
    ("claude", Provider::Anthropic),
];

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Gemini, Provider::Anthropic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Gemini => "gemini",
            Provider::Anthropic => "anthropic",
        }
    }

    /// Resolve the provider for a model identifier by prefix.
    pub fn from_model(model: &str) -> Option<Provider> {
        MODEL_PREFIXES
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix))
            .map(|(_, provider)| *provider)
    }

    /// Environment variable consulted when no key is configured explicitly.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad caller input. Never retried.
    Validation,
    /// Bad or missing credential. Never retried.
    Auth,
    /// Still rate limited or overloaded after the retry budget.
    ExhaustedRetries,
    /// Unexpected or unknown wire error shape.
    ProviderProtocol,
    /// Malformed JSON or a wrapper extraction failure.
    Decode,
    /// Connection refused, timeout, broken body.
    Transport,
    Cancelled,
}

// ---------------------------------------------------------------------------
// SwitchboardError
// ---------------------------------------------------------------------------

/// Unified error type for every Switchboard operation.
#[derive(Debug, thiserror::Error)]
pub enum SwitchboardError {
    // === Caller input ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unsupported model '{model}': no provider matches its prefix")]
    UnsupportedModel { model: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // === Credentials ===
    #[error("No API key for {provider}: configure one or set {env_var}")]
    MissingApiKey {
        provider: Provider,
        env_var: &'static str,
    },

    #[error("Authentication failed for provider {provider}: {message}")]
    AuthError { provider: Provider, message: String },

    // === Provider responses ===
    #[error("Context length exceeded for {provider}: {message}")]
    ContextLengthExceeded { provider: Provider, message: String },

    #[error("Provider {provider} rejected the request ({code}): {body}")]
    ProviderRejected {
        provider: Provider,
        code: String,
        body: String,
    },

    #[error("Retries exhausted for {provider} after {attempts} attempts: {body}")]
    RetriesExhausted {
        provider: Provider,
        attempts: u32,
        body: String,
    },

    #[error("Failed to decode {provider} response: {message}")]
    Decode { provider: Provider, message: String },

    // === Transport ===
    #[error("Transport error talking to {provider}: {message}")]
    Transport { provider: Provider, message: String },

    #[error("Request to {provider} was cancelled")]
    Cancelled { provider: Provider },

    // === Context ===
    #[error("Completion with model '{model}' via {provider} failed: {source}")]
    Completion {
        provider: Provider,
        model: String,
        #[source]
        source: Box<SwitchboardError>,
    },

    // === Generic ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SwitchboardError {
    /// Classification of the underlying failure. Context wrappers delegate to
    /// the error they wrap, so adding context never changes the kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SwitchboardError::Validation(_)
            | SwitchboardError::UnsupportedModel { .. }
            | SwitchboardError::Config(_)
            | SwitchboardError::ContextLengthExceeded { .. } => ErrorKind::Validation,
            SwitchboardError::MissingApiKey { .. } | SwitchboardError::AuthError { .. } => {
                ErrorKind::Auth
            }
            SwitchboardError::ProviderRejected { .. } => ErrorKind::ProviderProtocol,
            SwitchboardError::RetriesExhausted { .. } => ErrorKind::ExhaustedRetries,
            SwitchboardError::Decode { .. } | SwitchboardError::Json(_) => ErrorKind::Decode,
            SwitchboardError::Transport { .. } => ErrorKind::Transport,
            SwitchboardError::Cancelled { .. } => ErrorKind::Cancelled,
            SwitchboardError::Completion { source, .. } => source.kind(),
        }
    }

    /// Returns `true` if issuing the whole call again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ExhaustedRetries | ErrorKind::Transport
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::Auth)
    }

    /// The provider involved, when the failure happened past validation.
    pub fn provider(&self) -> Option<Provider> {
        match self {
            SwitchboardError::MissingApiKey { provider, .. }
            | SwitchboardError::AuthError { provider, .. }
            | SwitchboardError::ContextLengthExceeded { provider, .. }
            | SwitchboardError::ProviderRejected { provider, .. }
            | SwitchboardError::RetriesExhausted { provider, .. }
            | SwitchboardError::Decode { provider, .. }
            | SwitchboardError::Transport { provider, .. }
            | SwitchboardError::Cancelled { provider }
            | SwitchboardError::Completion { provider, .. } => Some(*provider),
            SwitchboardError::Validation(_)
            | SwitchboardError::UnsupportedModel { .. }
            | SwitchboardError::Config(_)
            | SwitchboardError::Json(_) => None,
        }
    }
}

/// A convenience alias for `Result<T, SwitchboardError>`.
pub type Result<T> = std::result::Result<T, SwitchboardError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
