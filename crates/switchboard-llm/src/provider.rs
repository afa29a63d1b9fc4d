use async_trait::async_trait;
use serde::de::DeserializeOwned;
use switchboard_types::{Provider, Result, SwitchboardError};
use tokio_util::sync::CancellationToken;

use crate::{CompletionRequest, FinishReason, Message, Usage};

// ---------------------------------------------------------------------------
// ProviderCall / ProviderReply
// ---------------------------------------------------------------------------

/// Everything an adapter needs for one exchange.
pub struct ProviderCall<'a> {
    pub request: &'a CompletionRequest,
    /// Working copy of the conversation. Adapters may mutate it; the caller's
    /// original is never touched.
    pub conversation: Vec<Message>,
    pub api_key: String,
}

impl<'a> ProviderCall<'a> {
    pub fn new(request: &'a CompletionRequest, api_key: impl Into<String>) -> Self {
        Self {
            request,
            conversation: request.conversation.clone(),
            api_key: api_key.into(),
        }
    }
}

/// A decoded reply, before the orchestrator attaches model and usage record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub message: Message,
    pub stop_reason: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

// ---------------------------------------------------------------------------
// ProviderAdapter
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn complete(
        &self,
        call: ProviderCall<'_>,
        cancel: &CancellationToken,
    ) -> Result<ProviderReply>;
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse a 2xx body. Anything malformed is a decode error, never retried.
pub(crate) fn parse_body<T: DeserializeOwned>(provider: Provider, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| SwitchboardError::Decode {
        provider,
        message: format!("Failed to parse response JSON: {e}"),
    })
}

/// Status-only fallback when the error body carries no recognised code.
pub(crate) fn is_transient_status(status: u16) -> bool {
    status == 429 || status >= 500
}

pub(crate) fn is_auth_status(status: u16) -> bool {
    status == 401 || status == 403
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
