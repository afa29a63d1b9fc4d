use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use switchboard_types::{Provider, Result, SwitchboardError};
use tokio_util::sync::CancellationToken;

use crate::config::OpenAiConfig;
use crate::provider::{is_auth_status, is_transient_status, parse_body};
use crate::retry::{send_with_retry, Attempt, RetryPolicy};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::{
    json_mode, tools, CompletionRequest, FinishReason, Message, ProviderAdapter, ProviderCall,
    ProviderReply, Role, Usage,
};

const PROVIDER: Provider = Provider::OpenAi;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<OpenAiToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub call_type: String,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiFunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    #[serde(default)]
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: OpenAiUsage,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: OpenAiMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub fn encode_message(msg: &Message) -> OpenAiMessage {
    let mut wire = OpenAiMessage {
        role: String::new(),
        content: Some(msg.text.clone()),
        tool_calls: Vec::new(),
        tool_call_id: None,
        name: None,
    };
    match msg.role {
        Role::System => wire.role = "system".into(),
        Role::User => wire.role = "user".into(),
        Role::Assistant => wire.role = "assistant".into(),
        Role::ToolCall => {
            wire.role = "assistant".into();
            if msg.text.is_empty() {
                wire.content = None;
            }
            wire.tool_calls.push(OpenAiToolCall {
                id: msg.tool_use_id().to_string(),
                call_type: function_type(),
                function: OpenAiFunctionCall {
                    name: msg.tool_name().to_string(),
                    arguments: msg.arguments_value().to_string(),
                },
            });
        }
        Role::ToolResult => {
            wire.role = "tool".into();
            wire.tool_call_id = msg.tool_use_id.clone();
            wire.name = msg.tool_name.clone();
        }
    }
    wire
}

pub fn encode_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
    messages.iter().map(encode_message).collect()
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    serde_json::from_str(raw).map_err(|e| SwitchboardError::Decode {
        provider: PROVIDER,
        message: format!("tool call arguments are not a JSON object: {e}"),
    })
}

/// An assistant message with a non-empty call list decodes as a ToolCall.
/// Unrecognised roles decode as User.
pub fn decode_message(wire: &OpenAiMessage) -> Result<Message> {
    let text = wire.content.clone().unwrap_or_default();
    let msg = match wire.role.as_str() {
        "assistant" if !wire.tool_calls.is_empty() => {
            if wire.tool_calls.len() > 1 {
                tracing::warn!(
                    count = wire.tool_calls.len(),
                    "Reply carried several tool calls, keeping the first"
                );
            }
            let call = &wire.tool_calls[0];
            let arguments = parse_arguments(&call.function.arguments)?;
            Message::tool_call(call.id.clone(), call.function.name.clone(), arguments)
                .with_text(text)
        }
        "assistant" => Message::assistant(text),
        "system" => Message::system(text),
        "tool" => Message::tool_result(
            wire.tool_call_id.clone().unwrap_or_default(),
            wire.name.clone().unwrap_or_default(),
            text,
        ),
        _ => Message::user(text),
    };
    Ok(msg)
}

pub fn decode_messages(messages: &[OpenAiMessage]) -> Result<Vec<Message>> {
    messages.iter().map(decode_message).collect()
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::EndTurn,
        "length" => FinishReason::MaxTokens,
        "tool_calls" | "function_call" => FinishReason::ToolUse,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

// ---------------------------------------------------------------------------
// OpenAiAdapter
// ---------------------------------------------------------------------------

pub struct OpenAiAdapter {
    transport: Arc<dyn HttpTransport>,
    config: OpenAiConfig,
    retry: RetryPolicy,
    user_id: Option<String>,
}

impl OpenAiAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>, config: OpenAiConfig, retry: RetryPolicy) -> Self {
        Self {
            transport,
            config,
            retry,
            user_id: None,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.config.base_url = url;
        self
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    fn build_request_body(
        &self,
        request: &CompletionRequest,
        conversation: &[Message],
        json_applied: bool,
    ) -> Value {
        // 1. Messages, roles mapped one to one
        let mut body = json!({
            "model": request.model,
            "messages": encode_messages(conversation),
            "n": 1,
            "stream": false,
        });

        // 2. Response format
        let format = if json_applied { "json_object" } else { "text" };
        body["response_format"] = json!({ "type": format });

        // 3. Sampling and limits
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(ref user) = self.user_id {
            body["user"] = json!(user);
        }

        // 4. Tools and tool choice
        if !request.tools.is_empty() {
            let declared: Vec<Value> = request.tools.iter().map(tools::to_openai).collect();
            body["tools"] = json!(declared);
            body["parallel_tool_calls"] = json!(false);
            if let Some(choice) = request.tool_choice().for_openai() {
                body["tool_choice"] = choice;
            }
        }

        body
    }

    fn parse_response(&self, completion: ChatCompletion, json_applied: bool) -> Result<ProviderReply> {
        let usage = Usage {
            input_tokens: completion.usage.prompt_tokens,
            output_tokens: completion.usage.completion_tokens,
            total_tokens: completion.usage.total_tokens,
        };
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| SwitchboardError::ProviderRejected {
                provider: PROVIDER,
                code: "empty_choices".into(),
                body: "response carried no choices".into(),
            })?;

        let mut message = decode_message(&choice.message)?;
        if json_applied && message.role == Role::Assistant {
            message.text = json_mode::extract(PROVIDER, &message.text)?;
        }

        let stop_reason = choice.finish_reason.unwrap_or_default();
        Ok(ProviderReply {
            message,
            finish_reason: map_finish_reason(&stop_reason),
            stop_reason,
            usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

const AUTH_CODES: &[&str] = &[
    "invalid_api_key",
    "authentication_error",
    "permission_error",
    "insufficient_permissions",
];
const TRANSIENT_CODES: &[&str] = &["rate_limit_exceeded", "requests", "tokens", "server_error"];

fn classify(resp: &HttpResponse) -> Attempt<ChatCompletion> {
    if !resp.is_success() {
        return map_error(resp.status, &resp.body);
    }
    match parse_body::<ChatCompletion>(PROVIDER, &resp.body) {
        Ok(completion) if completion.choices.is_empty() => {
            Attempt::Fatal(SwitchboardError::ProviderRejected {
                provider: PROVIDER,
                code: "empty_choices".into(),
                body: resp.body.clone(),
            })
        }
        Ok(completion) => Attempt::Success(completion),
        Err(e) => Attempt::Fatal(e),
    }
}

fn map_error(status: u16, body: &str) -> Attempt<ChatCompletion> {
    let parsed = serde_json::from_str::<Value>(body).unwrap_or(Value::Null);
    let error = &parsed["error"];
    let codes: Vec<&str> = [error["code"].as_str(), error["type"].as_str()]
        .into_iter()
        .flatten()
        .collect();
    let has = |set: &[&str]| codes.iter().any(|c| set.contains(c));

    if has(&["context_length_exceeded"]) {
        return Attempt::Fatal(SwitchboardError::ContextLengthExceeded {
            provider: PROVIDER,
            message: extract_error_message(body),
        });
    }
    if has(AUTH_CODES) || is_auth_status(status) {
        return Attempt::Fatal(SwitchboardError::AuthError {
            provider: PROVIDER,
            message: extract_error_message(body),
        });
    }
    if has(&["insufficient_quota"]) {
        return Attempt::Fatal(SwitchboardError::ProviderRejected {
            provider: PROVIDER,
            code: "insufficient_quota".into(),
            body: body.to_string(),
        });
    }
    if has(TRANSIENT_CODES) || is_transient_status(status) {
        return Attempt::Retry {
            reason: codes.first().map_or_else(|| format!("HTTP {status}"), |c| c.to_string()),
        };
    }
    Attempt::Fatal(SwitchboardError::ProviderRejected {
        provider: PROVIDER,
        code: codes
            .first()
            .map_or_else(|| format!("HTTP {status}"), |c| c.to_string()),
        body: body.to_string(),
    })
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// ProviderAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
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
        tracing::debug!(body = %body, "OpenAI request body");

        let http = HttpRequest::post_json(&self.config.base_url, &body)?
            .header("Authorization", format!("Bearer {}", call.api_key));

        let completion = send_with_retry(
            self.transport.as_ref(),
            &http,
            &self.retry,
            PROVIDER,
            cancel,
            classify,
        )
        .await?;

        self.parse_response(completion, json_applied)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::tools::{Tool, ToolSchema};

    fn adapter(transport: Arc<ScriptedTransport>) -> OpenAiAdapter {
        OpenAiAdapter::new(transport, OpenAiConfig::default(), RetryPolicy::immediate(3))
    }

    fn reply_body(message: Value, finish: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{ "index": 0, "message": message, "finish_reason": finish }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17 }
        })
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn system_and_user_encode_as_two_messages() {
        let wire = encode_messages(&[Message::system("be terse"), Message::user("2+2?")]);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[0].content.as_deref(), Some("be terse"));
        assert_eq!(wire[1].role, "user");
    }

    #[test]
    fn tool_call_encodes_as_assistant_with_call_list() {
        let msg = Message::tool_call("call_9", "get_weather", args(json!({"city": "Oslo"})));
        let wire = serde_json::to_value(encode_message(&msg)).unwrap();
        assert_eq!(wire["role"], "assistant");
        assert!(wire.get("content").is_none());
        assert_eq!(wire["tool_calls"][0]["id"], "call_9");
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "get_weather");
        assert_eq!(
            wire["tool_calls"][0]["function"]["arguments"],
            r#"{"city":"Oslo"}"#
        );
    }

    #[test]
    fn tool_result_encodes_as_tool_role() {
        let wire = encode_message(&Message::tool_result("call_9", "get_weather", "sunny"));
        assert_eq!(wire.role, "tool");
        assert_eq!(wire.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(wire.name.as_deref(), Some("get_weather"));
        assert_eq!(wire.content.as_deref(), Some("sunny"));
    }

    #[test]
    fn round_trip_every_role() {
        let conversation = vec![
            Message::system("sys"),
            Message::user("weather in Oslo?"),
            Message::tool_call("c1", "get_weather", args(json!({"city": "Oslo", "days": 2})))
                .with_text("Checking."),
            Message::tool_result("c1", "get_weather", "sunny"),
            Message::assistant("It is sunny."),
        ];
        let decoded = decode_messages(&encode_messages(&conversation)).unwrap();
        assert_eq!(decoded, conversation);
    }

    #[test]
    fn encoding_is_deterministic() {
        let msg = Message::tool_call("c1", "f", args(json!({"b": 1, "a": [1, 2]})));
        let first = serde_json::to_string(&encode_message(&msg)).unwrap();
        let second = serde_json::to_string(&encode_message(&msg)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn decode_unknown_role_as_user_and_bad_arguments_as_error() {
        let odd = OpenAiMessage {
            role: "developer".into(),
            content: Some("hi".into()),
            tool_calls: vec![],
            tool_call_id: None,
            name: None,
        };
        assert_eq!(decode_message(&odd).unwrap().role, Role::User);

        let broken = OpenAiMessage {
            role: "assistant".into(),
            content: None,
            tool_calls: vec![OpenAiToolCall {
                id: "c1".into(),
                call_type: "function".into(),
                function: OpenAiFunctionCall {
                    name: "f".into(),
                    arguments: "{not json".into(),
                },
            }],
            tool_call_id: None,
            name: None,
        };
        assert!(matches!(
            decode_message(&broken),
            Err(SwitchboardError::Decode { .. })
        ));
    }

    #[test]
    fn build_request_body_with_tools_and_json() {
        let transport = Arc::new(ScriptedTransport::ok(200, json!({})));
        let adapter = adapter(transport).with_user_id(Some("user-7".into()));
        let request = CompletionRequest::new("gpt-4o", vec![Message::user("hi")])
            .with_temperature(0.7)
            .with_tools(vec![Tool::new("search", "Search", ToolSchema::object())])
            .require_tool("search");

        let body = adapter.build_request_body(&request, &request.conversation, true);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["n"], 1);
        assert_eq!(body["stream"], false);
        assert_eq!(body["user"], "user-7");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!((body["temperature"].as_f64().unwrap() - 0.7).abs() < 0.01);
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert_eq!(body["tool_choice"]["function"]["name"], "search");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn build_request_body_without_tools_omits_choice() {
        let transport = Arc::new(ScriptedTransport::ok(200, json!({})));
        let adapter = adapter(transport);
        let request = CompletionRequest::new("gpt-4o", vec![Message::user("hi")]).prohibit_tools();
        let body = adapter.build_request_body(&request, &request.conversation, false);
        assert_eq!(body["response_format"]["type"], "text");
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[tokio::test]
    async fn complete_decodes_text_reply() {
        let transport = Arc::new(ScriptedTransport::ok(
            200,
            reply_body(json!({"role": "assistant", "content": "4"}), "stop"),
        ));
        let adapter = adapter(transport.clone());
        let request = CompletionRequest::new("gpt-4o", vec![Message::user("2+2?")]);

        let reply = adapter
            .complete(ProviderCall::new(&request, "sk-test"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.message, Message::assistant("4"));
        assert_eq!(reply.stop_reason, "stop");
        assert_eq!(reply.finish_reason, FinishReason::EndTurn);
        assert_eq!(reply.usage.total_tokens, 17);

        let sent = &transport.requests()[0];
        assert_eq!(sent.url, "https://api.openai.com/v1/chat/completions");
        assert!(sent
            .headers
            .contains(&("Authorization".into(), "Bearer sk-test".into())));
    }

    #[tokio::test]
    async fn complete_decodes_tool_call() {
        let transport = Arc::new(ScriptedTransport::ok(
            200,
            reply_body(
                json!({
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": { "name": "get_weather", "arguments": "{\"city\":\"Oslo\"}" }
                    }]
                }),
                "tool_calls",
            ),
        ));
        let adapter = adapter(transport);
        let request = CompletionRequest::new("gpt-4o", vec![Message::user("weather?")]);
        let reply = adapter
            .complete(ProviderCall::new(&request, "k"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.message.role, Role::ToolCall);
        assert_eq!(reply.message.tool_use_id(), "call_abc");
        assert_eq!(reply.message.arguments_value()["city"], "Oslo");
        assert_eq!(reply.finish_reason, FinishReason::ToolUse);
    }

    #[tokio::test]
    async fn json_mode_injects_schema_and_requires_json_reply() {
        let transport = Arc::new(ScriptedTransport::ok(
            200,
            reply_body(json!({"role": "assistant", "content": "not json"}), "stop"),
        ));
        let adapter = adapter(transport.clone());
        let request = CompletionRequest::new("gpt-4o", vec![Message::user("2+2?")])
            .with_json_schema(r#"{"answer": "number"}"#);

        let err = adapter
            .complete(ProviderCall::new(&request, "k"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::Decode { .. }));

        let body = transport.last_body();
        let sent_text = body["messages"][0]["content"].as_str().unwrap();
        assert!(sent_text.starts_with("2+2?\n\nPlease respond"));
        assert!(sent_text.ends_with(r#"{"answer": "number"}"#));
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn error_mapping_auth() {
        let attempt = map_error(
            401,
            r#"{"error": {"message": "Incorrect API key", "type": "invalid_request_error", "code": "invalid_api_key"}}"#,
        );
        assert!(matches!(
            attempt,
            Attempt::Fatal(SwitchboardError::AuthError { ref message, .. }) if message == "Incorrect API key"
        ));
    }

    #[test]
    fn error_mapping_rate_limit_and_server() {
        let rate = map_error(
            429,
            r#"{"error": {"message": "slow down", "type": "requests", "code": "rate_limit_exceeded"}}"#,
        );
        assert!(matches!(rate, Attempt::Retry { ref reason } if reason == "rate_limit_exceeded"));

        let server = map_error(503, "upstream unavailable");
        assert!(matches!(server, Attempt::Retry { ref reason } if reason == "HTTP 503"));
    }

    #[test]
    fn error_mapping_context_length_and_quota() {
        let ctx = map_error(
            400,
            r#"{"error": {"message": "too long", "type": "invalid_request_error", "code": "context_length_exceeded"}}"#,
        );
        assert!(matches!(
            ctx,
            Attempt::Fatal(SwitchboardError::ContextLengthExceeded { .. })
        ));

        let quota = map_error(
            429,
            r#"{"error": {"message": "quota", "type": "insufficient_quota", "code": "insufficient_quota"}}"#,
        );
        assert!(matches!(
            quota,
            Attempt::Fatal(SwitchboardError::ProviderRejected { .. })
        ));
    }

    #[test]
    fn error_mapping_validation_keeps_raw_body() {
        let body = r#"{"error": {"message": "bad param", "type": "invalid_request_error", "code": null}}"#;
        match map_error(400, body) {
            Attempt::Fatal(SwitchboardError::ProviderRejected { code, body: raw, .. }) => {
                assert_eq!(code, "invalid_request_error");
                assert_eq!(raw, body);
            }
            other => panic!("expected ProviderRejected, got {other:?}"),
        }
    }

    #[test]
    fn empty_choices_is_protocol_error() {
        let attempt = classify(&HttpResponse::new(200, r#"{"choices": []}"#));
        assert!(matches!(
            attempt,
            Attempt::Fatal(SwitchboardError::ProviderRejected { .. })
        ));
        let garbage = classify(&HttpResponse::new(200, "<html>"));
        assert!(matches!(garbage, Attempt::Fatal(SwitchboardError::Decode { .. })));
    }

    #[test]
    fn with_base_url_sets_custom_url() {
        let transport = Arc::new(ScriptedTransport::ok(200, json!({})));
        let adapter = adapter(transport).with_base_url("http://localhost:9000/v1".into());
        assert_eq!(adapter.config.base_url, "http://localhost:9000/v1");
    }
}
