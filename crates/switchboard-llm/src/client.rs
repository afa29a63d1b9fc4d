use std::sync::{Arc, Mutex, PoisonError};

use switchboard_types::{Provider, Result, SwitchboardError};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{process_env, resolve_api_key, ClientConfig, EnvReader};
use crate::tokens::{self, EstimateMethod};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::{
    AnthropicAdapter, CompletionRequest, CompletionResponse, GeminiAdapter, OpenAiAdapter,
    ProviderAdapter, ProviderCall, Usage, UsageRecord,
};

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Observes each successful call. Middleware cannot alter the request; the
/// caller's conversation is never mutated.
pub trait Middleware: Send + Sync {
    fn before(&self, _request: &CompletionRequest) {}
    fn after(&self, _request: &CompletionRequest, _response: &CompletionResponse) {}
}

// ---------------------------------------------------------------------------
// Built-in middleware: LoggingMiddleware
// ---------------------------------------------------------------------------

pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn before(&self, request: &CompletionRequest) {
        tracing::info!(
            model = %request.model,
            messages = request.conversation.len(),
            tools = request.tools.len(),
            json_mode = request.json_mode,
            "LLM request"
        );
    }

    fn after(&self, _request: &CompletionRequest, response: &CompletionResponse) {
        tracing::info!(
            model = %response.model,
            provider = %response.provider,
            input_tokens = response.usage_record.input_tokens,
            output_tokens = response.usage_record.output_tokens,
            finish = ?response.finish_reason,
            "LLM response"
        );
    }
}

// ---------------------------------------------------------------------------
// LlmClient
// ---------------------------------------------------------------------------

/// Single entry point over all three providers. Cheap to share behind an
/// `Arc`; usage records from concurrent calls land in one ordered list.
pub struct LlmClient {
    openai: OpenAiAdapter,
    gemini: GeminiAdapter,
    anthropic: AnthropicAdapter,
    config: ClientConfig,
    env: EnvReader,
    middleware: Vec<Box<dyn Middleware>>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl LlmClient {
    /// Build a client over one pooled HTTP client honouring the configured
    /// timeout.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::with_timeout(config.request_timeout)
            .map_err(|e| SwitchboardError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let openai = OpenAiAdapter::new(transport.clone(), config.openai.clone(), config.retry.clone())
            .with_user_id(config.user_id.clone());
        let gemini = GeminiAdapter::new(transport.clone(), config.gemini.clone(), config.retry.clone());
        let anthropic =
            AnthropicAdapter::new(transport, config.anthropic.clone(), config.retry.clone());
        Self {
            openai,
            gemini,
            anthropic,
            config,
            env: process_env(),
            middleware: Vec::new(),
            usage: Mutex::new(Vec::new()),
        }
    }

    /// Replace the environment lookup used for API keys.
    pub fn with_env(mut self, env: EnvReader) -> Self {
        self.env = env;
        self
    }

    pub fn with_middleware(mut self, m: impl Middleware + 'static) -> Self {
        self.middleware.push(Box::new(m));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn adapter(&self, provider: Provider) -> &dyn ProviderAdapter {
        match provider {
            Provider::OpenAi => &self.openai,
            Provider::Gemini => &self.gemini,
            Provider::Anthropic => &self.anthropic,
        }
    }

    fn api_key(&self, provider: Provider) -> Result<String> {
        resolve_api_key(provider, self.config.configured_key(provider), &self.env)
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.complete_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like [`complete`](Self::complete), abandoning the in-flight request or
    /// backoff sleep as soon as `cancel` fires.
    pub async fn complete_with_cancel(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse> {
        // 1. Preconditions and credentials, before any network traffic
        let provider = request.validate()?;
        let api_key = self.api_key(provider)?;

        for m in &self.middleware {
            m.before(request);
        }

        // 2. Provider exchange on a private copy of the conversation
        let span = tracing::info_span!("completion", %provider, model = %request.model);
        let reply = self
            .adapter(provider)
            .complete(ProviderCall::new(request, api_key), cancel)
            .instrument(span)
            .await
            .map_err(|source| SwitchboardError::Completion {
                provider,
                model: request.model.clone(),
                source: Box::new(source),
            })?;

        // 3. Unified response and usage accounting
        let usage_record = UsageRecord::new(request.model.clone(), reply.usage);
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(usage_record.clone());

        let response = CompletionResponse {
            model: request.model.clone(),
            provider,
            stop_reason: reply.stop_reason,
            finish_reason: reply.finish_reason,
            message: reply.message,
            usage_record,
        };

        for m in &self.middleware {
            m.after(request, &response);
        }

        Ok(response)
    }

    /// Token count for `text` under `model`. Exact for Gemini (one network
    /// call), approximate for the others.
    pub async fn estimate_tokens(&self, model: &str, text: &str) -> Result<u64> {
        self.estimate_tokens_with(model, text, EstimateMethod::default())
            .await
    }

    /// As [`estimate_tokens`](Self::estimate_tokens), choosing how the GPT
    /// word and character estimates are combined.
    pub async fn estimate_tokens_with(
        &self,
        model: &str,
        text: &str,
        method: EstimateMethod,
    ) -> Result<u64> {
        let provider = Provider::from_model(model).ok_or_else(|| {
            SwitchboardError::UnsupportedModel {
                model: model.to_string(),
            }
        })?;
        match provider {
            Provider::OpenAi => Ok(tokens::approximate_gpt(text, method)),
            Provider::Anthropic => Ok(tokens::approximate_anthropic(text)),
            Provider::Gemini => {
                let api_key = self.api_key(provider)?;
                self.gemini
                    .count_tokens(model, text, &api_key, &CancellationToken::new())
                    .await
            }
        }
    }

    /// Snapshot of every usage record so far, in completion order.
    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total_usage(&self) -> Usage {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .fold(Usage::default(), |acc, r| Usage {
                input_tokens: acc.input_tokens + r.input_tokens,
                output_tokens: acc.output_tokens + r.output_tokens,
                total_tokens: acc.total_tokens + r.total_tokens,
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
