//! Prompt-side JSON instructions and reply-side payload extraction.
//!
//! The three providers disagree on what to do when a JSON-mode reply cannot be
//! unwrapped, and callers rely on each behaviour, so the fallback is a fixed
//! per-provider policy rather than a single rule.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use switchboard_types::{Provider, Result, SwitchboardError};

use crate::types::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonFallback {
    /// Surface a decode error.
    Fail,
    /// Log a warning and hand back the unmodified text.
    RawText,
}

pub fn fallback_for(provider: Provider) -> JsonFallback {
    match provider {
        Provider::OpenAi => JsonFallback::Fail,
        Provider::Gemini | Provider::Anthropic => JsonFallback::RawText,
    }
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

const SCHEMA_GUIDANCE: &str = "Please respond to this message ONLY with the given json schema.";
const NO_BACKTICKS: &str =
    "This schema should be parsed as valid json, and shall NOT contain backticks (`).";
const RESPONSE_TAG_GUIDANCE: &str = "Formatting Instructions:\nYou MUST place your response to this message inside <response></response> XML tags. Any context or extra information shall be placed outside these tags, with the <response> XML tag containing exactly what was requested.";

/// Text appended to the final message when JSON mode is on.
pub fn instructions(provider: Provider, schema: &str) -> String {
    match provider {
        Provider::OpenAi => format!("\n\n{SCHEMA_GUIDANCE}\n\nJSON SCHEMA:\n{schema}"),
        Provider::Gemini => {
            format!("\n\n{SCHEMA_GUIDANCE} {NO_BACKTICKS}\n\nJSON SCHEMA:\n{schema}")
        }
        Provider::Anthropic => {
            format!("\n\n{SCHEMA_GUIDANCE}\n\nJSON SCHEMA:\n{schema}\n\n{RESPONSE_TAG_GUIDANCE}")
        }
    }
}

/// Append the instructions to the last message of a working copy.
pub fn inject(conversation: &mut [Message], provider: Provider, schema: &str) {
    if let Some(last) = conversation.last_mut() {
        last.text.push_str(&instructions(provider, schema));
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

fn parses_as_json(text: &str) -> bool {
    serde_json::from_str::<Value>(text).is_ok()
}

/// Drop a surrounding markdown fence such as three backticks followed by `json`.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    let body = match rest.find('\n') {
        Some(i) if rest[..i].chars().all(|c| c.is_ascii_alphanumeric()) => &rest[i + 1..],
        _ => rest,
    };
    body.trim()
}

static RESPONSE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<response>(.*)</response>").unwrap());

/// Inner content of the outermost `<response>` tag pair, if non-empty.
pub fn extract_response_tag(text: &str) -> Option<String> {
    RESPONSE_TAG
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|inner| !inner.is_empty())
}

/// Unwrap a JSON-mode reply according to the provider's policy.
pub fn extract(provider: Provider, text: &str) -> Result<String> {
    let candidate = match provider {
        Provider::OpenAi => {
            let trimmed = text.trim();
            parses_as_json(trimmed).then(|| trimmed.to_string())
        }
        Provider::Gemini => {
            let stripped = strip_code_fence(text);
            parses_as_json(stripped).then(|| stripped.to_string())
        }
        Provider::Anthropic => extract_response_tag(text),
    };

    match (candidate, fallback_for(provider)) {
        (Some(payload), _) => Ok(payload),
        (None, JsonFallback::Fail) => Err(SwitchboardError::Decode {
            provider,
            message: format!("JSON-mode reply is not valid JSON: {text}"),
        }),
        (None, JsonFallback::RawText) => {
            tracing::warn!(%provider, "Could not unwrap JSON-mode reply, using the raw content");
            Ok(text.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
