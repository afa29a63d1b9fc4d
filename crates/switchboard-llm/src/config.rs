//! Client configuration with central defaults.
//!
//! Every field has a default, so a partial JSON file (or none at all) yields a
//! working configuration pointed at the public endpoints.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use switchboard_types::{Provider, Result, SwitchboardError};

use crate::retry::RetryPolicy;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_MAX_TOKENS: u32 = 4096;
pub const GEMINI_SAFETY_THRESHOLD: &str = "BLOCK_ONLY_HIGH";

// ---------------------------------------------------------------------------
// Per-provider sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Sent as `max_tokens` when set.
    pub max_tokens: Option<u32>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: None,
            max_tokens: None,
        }
    }
}

/// Where the system prompt goes in a Gemini request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeminiSystemMode {
    /// Top-level `systemInstruction`.
    #[default]
    Native,
    /// Folded into the first user turn behind a marker sentence.
    Sentinel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    /// Models collection URL; the model name and method are appended.
    pub base_url: String,
    pub api_key: Option<String>,
    pub system_mode: GeminiSystemMode,
    /// Applied to each harm category.
    pub safety_threshold: String,
    pub max_output_tokens: Option<u32>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: GEMINI_BASE_URL.to_string(),
            api_key: None,
            system_mode: GeminiSystemMode::default(),
            safety_threshold: GEMINI_SAFETY_THRESHOLD.to_string(),
            max_output_tokens: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub version: String,
    pub max_tokens: u32,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: ANTHROPIC_BASE_URL.to_string(),
            api_key: None,
            version: ANTHROPIC_VERSION.to_string(),
            max_tokens: ANTHROPIC_MAX_TOKENS,
        }
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub openai: OpenAiConfig,
    pub gemini: GeminiConfig,
    pub anthropic: AnthropicConfig,
    pub retry: RetryPolicy,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// End-user identifier forwarded to OpenAI as `user`.
    pub user_id: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            openai: OpenAiConfig::default(),
            gemini: GeminiConfig::default(),
            anthropic: AnthropicConfig::default(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(120),
            user_id: None,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| SwitchboardError::Config(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SwitchboardError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn configured_key(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::OpenAi => self.openai.api_key.as_deref(),
            Provider::Gemini => self.gemini.api_key.as_deref(),
            Provider::Anthropic => self.anthropic.api_key.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Looks up an environment variable. Injected so tests never touch the
/// process environment.
pub type EnvReader = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn process_env() -> EnvReader {
    Arc::new(|name| std::env::var(name).ok())
}

fn usable(key: &str) -> bool {
    let key = key.trim();
    !key.is_empty() && key != "null"
}

/// Explicit configuration first, then the provider's environment variable.
pub fn resolve_api_key(
    provider: Provider,
    configured: Option<&str>,
    env: &EnvReader,
) -> Result<String> {
    if let Some(key) = configured.filter(|k| usable(k)) {
        return Ok(key.to_string());
    }
    let env_var = provider.api_key_env();
    match env(env_var) {
        Some(key) if usable(&key) => Ok(key),
        _ => Err(SwitchboardError::MissingApiKey { provider, env_var }),
    }
}

// ---------------------------------------------------------------------------
// Duration as milliseconds
// ---------------------------------------------------------------------------

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
