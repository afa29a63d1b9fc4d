use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use switchboard_types::{Provider, Result, SwitchboardError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{GeminiConfig, GeminiSystemMode};
use crate::provider::{is_auth_status, is_transient_status, parse_body};
use crate::retry::{send_with_retry, Attempt, RetryPolicy};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::{
    json_mode, tools, CompletionRequest, FinishReason, Message, ProviderAdapter, ProviderCall,
    ProviderReply, Role, Usage,
};

const PROVIDER: Provider = Provider::Gemini;

/// Marker that introduces a folded system prompt in sentinel mode.
pub const SYSTEM_SENTINEL: &str = "This is the system message of the conversation, and should be used as a general reference for the entire conversation";

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<GeminiFunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    pub name: String,
    pub response: Value,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

impl GeminiContent {
    fn new(role: &str, parts: Vec<GeminiPart>) -> Self {
        Self {
            role: role.to_string(),
            parts,
        }
    }

    fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

/// A conversation in Gemini form: the turn list plus the optional
/// top-level system instruction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeminiConversation {
    pub system_instruction: Option<GeminiContent>,
    pub contents: Vec<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: GeminiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<GeminiContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsage {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountTokensResponse {
    #[serde(default)]
    total_tokens: u64,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub fn encode_messages(messages: &[Message], mode: GeminiSystemMode) -> GeminiConversation {
    let mut out = GeminiConversation::default();
    let mut fold_next_user = false;

    for msg in messages {
        let fold = std::mem::take(&mut fold_next_user);
        match msg.role {
            Role::System => match mode {
                GeminiSystemMode::Native => {
                    out.system_instruction =
                        Some(GeminiContent::new("", vec![GeminiPart::text(&msg.text)]));
                }
                GeminiSystemMode::Sentinel => {
                    let marked = format!("{SYSTEM_SENTINEL}: {}", msg.text);
                    out.contents
                        .push(GeminiContent::new("user", vec![GeminiPart::text(marked)]));
                    fold_next_user = true;
                }
            },
            Role::User => {
                if fold {
                    // Gemini has no system turn, so the user text rides along.
                    if let Some(text) = out
                        .contents
                        .last_mut()
                        .and_then(|c| c.parts.first_mut())
                        .and_then(|p| p.text.as_mut())
                    {
                        text.push_str("\n\n");
                        text.push_str(&msg.text);
                        continue;
                    }
                }
                out.contents
                    .push(GeminiContent::new("user", vec![GeminiPart::text(&msg.text)]));
            }
            Role::Assistant => {
                out.contents
                    .push(GeminiContent::new("model", vec![GeminiPart::text(&msg.text)]));
            }
            Role::ToolCall => {
                let mut parts = Vec::new();
                if !msg.text.is_empty() {
                    parts.push(GeminiPart::text(&msg.text));
                }
                parts.push(GeminiPart {
                    function_call: Some(GeminiFunctionCall {
                        id: msg.tool_use_id.clone(),
                        name: msg.tool_name().to_string(),
                        args: msg.tool_arguments.clone().unwrap_or_default(),
                    }),
                    ..Default::default()
                });
                out.contents.push(GeminiContent::new("model", parts));
            }
            Role::ToolResult => {
                let part = GeminiPart {
                    function_response: Some(GeminiFunctionResponse {
                        name: msg.tool_name().to_string(),
                        response: json!({ "content": msg.text }),
                    }),
                    ..Default::default()
                };
                out.contents.push(GeminiContent::new("user", vec![part]));
            }
        }
    }
    out
}

fn response_text(response: &Value) -> String {
    match response.get("content") {
        Some(Value::String(text)) => text.clone(),
        _ => response.to_string(),
    }
}

/// Decode one turn. A function response has no id on the wire, so it is
/// correlated with the message decoded just before it.
pub fn decode_content(content: &GeminiContent, previous: Option<&Message>) -> Result<Message> {
    let text = content.joined_text();

    let calls: Vec<&GeminiFunctionCall> = content
        .parts
        .iter()
        .filter_map(|p| p.function_call.as_ref())
        .collect();
    if let Some(call) = calls.first() {
        if calls.len() > 1 {
            tracing::warn!(count = calls.len(), "Reply carried several function calls, keeping the first");
        }
        let id = call
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        return Ok(Message::tool_call(id, call.name.clone(), call.args.clone()).with_text(text));
    }

    if let Some(resp) = content.parts.iter().find_map(|p| p.function_response.as_ref()) {
        let id = previous
            .filter(|m| m.role == Role::ToolCall)
            .and_then(|m| m.tool_use_id.clone())
            .unwrap_or_default();
        return Ok(Message::tool_result(id, resp.name.clone(), response_text(&resp.response)));
    }

    Ok(match content.role.as_str() {
        "model" => Message::assistant(text),
        _ => Message::user(text),
    })
}

pub fn decode_messages(conversation: &GeminiConversation) -> Result<Vec<Message>> {
    let mut out: Vec<Message> = Vec::new();
    if let Some(ref system) = conversation.system_instruction {
        out.push(Message::system(system.joined_text()));
    }

    let marker = format!("{SYSTEM_SENTINEL}: ");
    for content in &conversation.contents {
        let first_text = content.parts.first().and_then(|p| p.text.as_deref());
        if let Some(folded) = first_text.and_then(|t| t.strip_prefix(marker.as_str())) {
            let mut split = folded.splitn(2, "\n\n");
            out.push(Message::system(split.next().unwrap_or_default()));
            if let Some(user) = split.next() {
                out.push(Message::user(user));
            }
            continue;
        }
        let msg = decode_content(content, out.last())?;
        out.push(msg);
    }
    Ok(out)
}

fn map_finish_reason(reason: &str, message: &Message) -> FinishReason {
    match reason {
        "STOP" if message.role == Role::ToolCall => FinishReason::ToolUse,
        "STOP" => FinishReason::EndTurn,
        "MAX_TOKENS" => FinishReason::MaxTokens,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Other,
    }
}

// ---------------------------------------------------------------------------
// GeminiAdapter
// ---------------------------------------------------------------------------

pub struct GeminiAdapter {
    transport: Arc<dyn HttpTransport>,
    config: GeminiConfig,
    retry: RetryPolicy,
}

impl GeminiAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>, config: GeminiConfig, retry: RetryPolicy) -> Self {
        Self {
            transport,
            config,
            retry,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.config.base_url = url;
        self
    }

    fn method_url(&self, model: &str, method: &str, api_key: &str) -> String {
        format!(
            "{}/{}:{}?key={}",
            self.config.base_url.trim_end_matches('/'),
            model,
            method,
            api_key
        )
    }

    fn build_request_body(
        &self,
        request: &CompletionRequest,
        conversation: &[Message],
        json_applied: bool,
    ) -> Value {
        // 1. Contents and system instruction
        let encoded = encode_messages(conversation, self.config.system_mode);
        let mut body = json!({ "contents": encoded.contents });
        if let Some(system) = encoded.system_instruction {
            body["systemInstruction"] = json!(system);
        }

        // 2. Generation config
        let mut generation = Map::new();
        if let Some(temp) = request.temperature {
            generation.insert("temperature".into(), json!(temp));
        }
        if let Some(max) = self.config.max_output_tokens {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if json_applied && request.tools.is_empty() {
            generation.insert("responseMimeType".into(), json!("application/json"));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        // 3. Safety settings
        let safety: Vec<Value> = HARM_CATEGORIES
            .iter()
            .map(|category| {
                json!({ "category": category, "threshold": self.config.safety_threshold })
            })
            .collect();
        body["safetySettings"] = json!(safety);

        // 4. Tools, always a single declaration group
        if let Some(group) = tools::to_gemini(&request.tools) {
            body["tools"] = json!([group]);
            if let Some(config) = request.tool_choice().for_gemini() {
                body["toolConfig"] = config;
            }
        }

        body
    }

    fn parse_response(
        &self,
        response: GenerateContentResponse,
        json_applied: bool,
    ) -> Result<ProviderReply> {
        let usage = Usage {
            input_tokens: response.usage_metadata.prompt_token_count,
            output_tokens: response.usage_metadata.candidates_token_count,
            total_tokens: response.usage_metadata.total_token_count,
        };
        let candidate = response.candidates.into_iter().next().ok_or_else(|| {
            SwitchboardError::ProviderRejected {
                provider: PROVIDER,
                code: "no_candidates".into(),
                body: "response carried no candidates".into(),
            }
        })?;
        let stop_reason = candidate.finish_reason.unwrap_or_default();
        let content = candidate
            .content
            .filter(|c| !c.parts.is_empty())
            .ok_or_else(|| SwitchboardError::ProviderRejected {
                provider: PROVIDER,
                code: stop_reason.clone(),
                body: "candidate carried no content parts".into(),
            })?;

        let mut message = decode_content(&content, None)?;
        if json_applied && message.role == Role::Assistant {
            message.text = json_mode::extract(PROVIDER, &message.text)?;
        }

        Ok(ProviderReply {
            finish_reason: map_finish_reason(&stop_reason, &message),
            stop_reason,
            message,
            usage,
        })
    }

    /// Exact token count from the `countTokens` endpoint.
    pub async fn count_tokens(
        &self,
        model: &str,
        text: &str,
        api_key: &str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": text }] }]
        });
        let http = HttpRequest::post_json(self.method_url(model, "countTokens", api_key), &body)?;
        send_with_retry(
            self.transport.as_ref(),
            &http,
            &self.retry,
            PROVIDER,
            cancel,
            |resp: &HttpResponse| {
                if let Some(attempt) = error_in(resp) {
                    return attempt;
                }
                match parse_body::<CountTokensResponse>(PROVIDER, &resp.body) {
                    Ok(count) => Attempt::Success(count.total_tokens),
                    Err(e) => Attempt::Fatal(e),
                }
            },
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

const TRANSIENT_STATUSES: &[&str] = &["RESOURCE_EXHAUSTED", "ABORTED", "INTERNAL", "UNAVAILABLE"];

/// Gemini reports errors as `{"error": {"code", "message", "status"}}`,
/// occasionally with a 2xx status.
fn error_in<T>(resp: &HttpResponse) -> Option<Attempt<T>> {
    let parsed = serde_json::from_str::<Value>(&resp.body).ok();
    let has_error = parsed.as_ref().is_some_and(|v| v["error"].is_object());
    if has_error || !resp.is_success() {
        Some(map_error(resp.status, &resp.body))
    } else {
        None
    }
}

fn map_error<T>(status: u16, body: &str) -> Attempt<T> {
    let parsed = serde_json::from_str::<Value>(body).unwrap_or(Value::Null);
    let error = &parsed["error"];
    let message = error["message"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| body.to_string());

    match error["status"].as_str() {
        Some("UNAUTHENTICATED") | Some("PERMISSION_DENIED") => {
            Attempt::Fatal(SwitchboardError::AuthError {
                provider: PROVIDER,
                message,
            })
        }
        // An invalid key comes back as INVALID_ARGUMENT with this reason.
        _ if body.contains("API_KEY_INVALID") => Attempt::Fatal(SwitchboardError::AuthError {
            provider: PROVIDER,
            message,
        }),
        Some(code) if TRANSIENT_STATUSES.contains(&code) => Attempt::Retry {
            reason: code.to_string(),
        },
        Some(code) => Attempt::Fatal(SwitchboardError::ProviderRejected {
            provider: PROVIDER,
            code: code.to_string(),
            body: body.to_string(),
        }),
        None if is_auth_status(status) => Attempt::Fatal(SwitchboardError::AuthError {
            provider: PROVIDER,
            message,
        }),
        None if is_transient_status(status) => Attempt::Retry {
            reason: format!("HTTP {status}"),
        },
        None => Attempt::Fatal(SwitchboardError::ProviderRejected {
            provider: PROVIDER,
            code: format!("HTTP {status}"),
            body: body.to_string(),
        }),
    }
}

fn classify(resp: &HttpResponse) -> Attempt<GenerateContentResponse> {
    if let Some(attempt) = error_in(resp) {
        return attempt;
    }
    match parse_body::<GenerateContentResponse>(PROVIDER, &resp.body) {
        Ok(parsed) if parsed.candidates.is_empty() => {
            Attempt::Fatal(SwitchboardError::ProviderRejected {
                provider: PROVIDER,
                code: "no_candidates".into(),
                body: resp.body.clone(),
            })
        }
        Ok(parsed) => Attempt::Success(parsed),
        Err(e) => Attempt::Fatal(e),
    }
}

// ---------------------------------------------------------------------------
// ProviderAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn complete(
        &self,
        mut call: ProviderCall<'_>,
        cancel: &CancellationToken,
    ) -> Result<ProviderReply> {
        let request = call.request;
        let json_applied = request.json_applied();
        if json_applied {
            json_mode::inject(&mut call.conversation, PROVIDER, &request.json_schema);
        }

        let body = self.build_request_body(request, &call.conversation, json_applied);
        tracing::debug!(body = %body, "Gemini request body");

        let http = HttpRequest::post_json(
            self.method_url(&request.model, "generateContent", &call.api_key),
            &body,
        )?;

        let response = send_with_retry(
            self.transport.as_ref(),
            &http,
            &self.retry,
            PROVIDER,
            cancel,
            classify,
        )
        .await?;

        self.parse_response(response, json_applied)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
