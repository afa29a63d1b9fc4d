use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use switchboard_types::{Provider, Result, SwitchboardError};
use tokio_util::sync::CancellationToken;

use crate::config::AnthropicConfig;
use crate::provider::{is_auth_status, is_transient_status, parse_body};
use crate::retry::{send_with_retry, Attempt, RetryPolicy};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::{
    json_mode, tools, CompletionRequest, FinishReason, Message, ProviderAdapter, ProviderCall,
    ProviderReply, Role, Usage,
};

const PROVIDER: Provider = Provider::Anthropic;

/// Sent as the leading text block of a tool call whose text is empty, since
/// the API rejects empty text blocks.
pub const TOOL_CALL_FILLER: &str = "Calling the requested tool.";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Map<String, Value>,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
    },
    /// Thinking, images and anything else this crate does not model.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

/// A conversation in Anthropic form: the promoted system prompt plus turns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnthropicConversation {
    pub system: Option<String>,
    pub messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: AnthropicUsage,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub fn encode_messages(messages: &[Message]) -> AnthropicConversation {
    let mut out = AnthropicConversation::default();
    for msg in messages {
        match msg.role {
            Role::System => out.system = Some(msg.text.clone()),
            Role::User => out.messages.push(AnthropicMessage {
                role: "user".into(),
                content: vec![ContentBlock::Text {
                    text: msg.text.clone(),
                }],
            }),
            Role::Assistant => out.messages.push(AnthropicMessage {
                role: "assistant".into(),
                content: vec![ContentBlock::Text {
                    text: msg.text.clone(),
                }],
            }),
            Role::ToolCall => {
                let text = if msg.text.is_empty() {
                    TOOL_CALL_FILLER.to_string()
                } else {
                    msg.text.clone()
                };
                out.messages.push(AnthropicMessage {
                    role: "assistant".into(),
                    content: vec![
                        ContentBlock::Text { text },
                        ContentBlock::ToolUse {
                            id: msg.tool_use_id().to_string(),
                            name: msg.tool_name().to_string(),
                            input: msg.tool_arguments.clone().unwrap_or_default(),
                        },
                    ],
                });
            }
            Role::ToolResult => out.messages.push(AnthropicMessage {
                role: "user".into(),
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: msg.tool_use_id().to_string(),
                    content: json!(msg.text),
                }],
            }),
        }
    }
    out
}

/// Tool results may carry a plain string or a list of text blocks.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Decode one turn's content blocks. `history` is searched for the tool call
/// a tool result answers, since results carry no name on the wire.
pub fn decode_blocks(role: &str, blocks: &[ContentBlock], history: &[Message]) -> Message {
    let text: String = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("");

    let tool_use = blocks.iter().find_map(|b| match b {
        ContentBlock::ToolUse { id, name, input } => Some((id, name, input)),
        _ => None,
    });
    if let Some((id, name, input)) = tool_use {
        let text = if text == TOOL_CALL_FILLER { String::new() } else { text };
        return Message::tool_call(id.clone(), name.clone(), input.clone()).with_text(text);
    }

    let tool_result = blocks.iter().find_map(|b| match b {
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => Some((tool_use_id, content)),
        _ => None,
    });
    if let Some((id, content)) = tool_result {
        let name = history
            .iter()
            .rev()
            .find(|m| m.role == Role::ToolCall && m.tool_use_id() == id.as_str())
            .map(|m| m.tool_name().to_string())
            .unwrap_or_default();
        return Message::tool_result(id.clone(), name, tool_result_text(content));
    }

    match role {
        "assistant" => Message::assistant(text),
        _ => Message::user(text),
    }
}

pub fn decode_messages(conversation: &AnthropicConversation) -> Result<Vec<Message>> {
    let mut out = Vec::new();
    if let Some(ref system) = conversation.system {
        out.push(Message::system(system.clone()));
    }
    for msg in &conversation.messages {
        let decoded = decode_blocks(&msg.role, &msg.content, &out);
        out.push(decoded);
    }
    Ok(out)
}

fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" => FinishReason::EndTurn,
        "max_tokens" => FinishReason::MaxTokens,
        "stop_sequence" => FinishReason::StopSequence,
        "tool_use" => FinishReason::ToolUse,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

// ---------------------------------------------------------------------------
// AnthropicAdapter
// ---------------------------------------------------------------------------

pub struct AnthropicAdapter {
    transport: Arc<dyn HttpTransport>,
    config: AnthropicConfig,
    retry: RetryPolicy,
}

impl AnthropicAdapter {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        config: AnthropicConfig,
        retry: RetryPolicy,
    ) -> Self {
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

    fn build_request_body(&self, request: &CompletionRequest, conversation: &[Message]) -> Value {
        // 1. Model, turns and token limit
        let encoded = encode_messages(conversation);
        let mut body = json!({
            "model": request.model,
            "messages": encoded.messages,
            "max_tokens": self.config.max_tokens,
        });

        // 2. System prompt
        if let Some(system) = encoded.system {
            body["system"] = json!(system);
        }

        // 3. Temperature
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }

        // 4. Tools and tool choice
        if !request.tools.is_empty() {
            let declared: Vec<Value> = request.tools.iter().map(tools::to_anthropic).collect();
            body["tools"] = json!(declared);
            if let Some(choice) = request.tool_choice().for_anthropic() {
                body["tool_choice"] = choice;
            }
        }

        body
    }

    fn parse_response(
        &self,
        response: MessagesResponse,
        json_applied: bool,
    ) -> Result<ProviderReply> {
        let usage = Usage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        };
        let stop_reason = response.stop_reason.unwrap_or_default();

        let mut message = decode_blocks("assistant", &response.content, &[]);
        if json_applied && message.role == Role::Assistant {
            message.text = json_mode::extract(PROVIDER, &message.text)?;
        }

        Ok(ProviderReply {
            finish_reason: map_stop_reason(&stop_reason),
            stop_reason,
            message,
            usage,
        })
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Errors arrive as `{"type": "error", "error": {"type", "message"}}`.
fn map_error(status: u16, body: &str) -> Attempt<MessagesResponse> {
    let parsed = serde_json::from_str::<Value>(body).unwrap_or(Value::Null);
    let error = &parsed["error"];
    let message = error["message"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| body.to_string());

    match error["type"].as_str() {
        Some("authentication_error") | Some("permission_error") => {
            Attempt::Fatal(SwitchboardError::AuthError {
                provider: PROVIDER,
                message,
            })
        }
        Some(kind @ ("rate_limit_error" | "overloaded_error" | "api_error")) => Attempt::Retry {
            reason: kind.to_string(),
        },
        Some(kind) => Attempt::Fatal(SwitchboardError::ProviderRejected {
            provider: PROVIDER,
            code: kind.to_string(),
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

fn classify(resp: &HttpResponse) -> Attempt<MessagesResponse> {
    if !resp.is_success() {
        return map_error(resp.status, &resp.body);
    }
    match parse_body::<Value>(PROVIDER, &resp.body) {
        Ok(value) if value["type"] == "error" => map_error(resp.status, &resp.body),
        Ok(value) => match serde_json::from_value::<MessagesResponse>(value) {
            Ok(parsed) if parsed.content.is_empty() => {
                Attempt::Fatal(SwitchboardError::ProviderRejected {
                    provider: PROVIDER,
                    code: "empty_content".into(),
                    body: resp.body.clone(),
                })
            }
            Ok(parsed) => Attempt::Success(parsed),
            Err(e) => Attempt::Fatal(SwitchboardError::Decode {
                provider: PROVIDER,
                message: format!("Failed to parse response JSON: {e}"),
            }),
        },
        Err(e) => Attempt::Fatal(e),
    }
}

// ---------------------------------------------------------------------------
// ProviderAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
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

        let body = self.build_request_body(request, &call.conversation);
        tracing::debug!(body = %body, "Anthropic request body");

        let http = HttpRequest::post_json(&self.config.base_url, &body)?
            .header("x-api-key", &call.api_key)
            .header("anthropic-version", &self.config.version);

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::tools::{Tool, ToolSchema};

    fn adapter(transport: Arc<ScriptedTransport>) -> AnthropicAdapter {
        AnthropicAdapter::new(
            transport,
            AnthropicConfig::default(),
            RetryPolicy::immediate(3),
        )
    }

    fn text_reply(text: &str) -> Value {
        json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "text", "text": text }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 4 }
        })
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn system_is_promoted() {
        let encoded = encode_messages(&[Message::system("be terse"), Message::user("2+2?")]);
        assert_eq!(encoded.system.as_deref(), Some("be terse"));
        assert_eq!(encoded.messages.len(), 1);
        assert_eq!(encoded.messages[0].role, "user");
    }

    #[test]
    fn tool_cycle_round_trips() {
        let conversation = vec![
            Message::system("sys"),
            Message::user("weather in Oslo?"),
            Message::tool_call("toolu_1", "get_weather", args(json!({"city": "Oslo"}))),
            Message::tool_result("toolu_1", "get_weather", "sunny"),
            Message::assistant("It is sunny."),
        ];
        let encoded = encode_messages(&conversation);
        assert_eq!(
            encoded.messages[1].content[0],
            ContentBlock::Text {
                text: TOOL_CALL_FILLER.into()
            }
        );
        assert_eq!(decode_messages(&encoded).unwrap(), conversation);
    }

    #[test]
    fn tool_call_keeps_real_text() {
        let call = Message::tool_call("t1", "f", Map::new()).with_text("Looking it up.");
        let encoded = encode_messages(&[Message::user("q"), call.clone()]);
        let decoded = decode_messages(&encoded).unwrap();
        assert_eq!(decoded[1], call);
    }

    #[test]
    fn block_wire_shapes() {
        let encoded = encode_messages(&[Message::tool_result("t1", "f", "42")]);
        let value = serde_json::to_value(&encoded.messages[0]).unwrap();
        assert_eq!(
            value,
            json!({
                "role": "user",
                "content": [{ "type": "tool_result", "tool_use_id": "t1", "content": "42" }]
            })
        );
    }

    #[test]
    fn unknown_blocks_are_ignored() {
        let blocks: Vec<ContentBlock> = serde_json::from_value(json!([
            { "type": "thinking", "thinking": "hmm" },
            { "type": "text", "text": "done" }
        ]))
        .unwrap();
        assert_eq!(blocks[0], ContentBlock::Unknown);
        assert_eq!(
            decode_blocks("assistant", &blocks, &[]),
            Message::assistant("done")
        );
    }

    #[test]
    fn tool_result_accepts_block_list() {
        let blocks = vec![ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: json!([{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }]),
        }];
        let msg = decode_blocks("user", &blocks, &[]);
        assert_eq!(msg.text, "ab");
        assert_eq!(msg.tool_name(), "");
    }

    #[test]
    fn build_request_body_structure() {
        let transport = Arc::new(ScriptedTransport::ok(200, json!({})));
        let adapter = adapter(transport);
        let request = CompletionRequest::new(
            "claude-3-5-sonnet-20241022",
            vec![Message::system("be terse"), Message::user("2+2?")],
        )
        .with_tools(vec![Tool::new("calc", "Calculator", ToolSchema::object())])
        .require_tool("calc");

        let body = adapter.build_request_body(&request, &request.conversation);
        assert_eq!(body["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["tool_choice"], json!({"type": "tool", "name": "calc"}));
        assert!(body.get("temperature").is_none());
    }

    #[tokio::test]
    async fn complete_sends_headers_and_sums_usage() {
        let transport = Arc::new(ScriptedTransport::ok(200, text_reply("4")));
        let adapter = adapter(transport.clone());
        let request = CompletionRequest::new("claude-3-haiku", vec![Message::user("2+2?")]);

        let reply = adapter
            .complete(ProviderCall::new(&request, "ant-key"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.message, Message::assistant("4"));
        assert_eq!(reply.finish_reason, FinishReason::EndTurn);
        assert_eq!(reply.usage.total_tokens, 14);

        let sent = &transport.requests()[0];
        assert_eq!(sent.url, "https://api.anthropic.com/v1/messages");
        assert!(sent
            .headers
            .contains(&("x-api-key".to_string(), "ant-key".to_string())));
        assert!(sent
            .headers
            .contains(&("anthropic-version".to_string(), "2023-06-01".to_string())));
    }

    #[tokio::test]
    async fn json_mode_extracts_response_tag() {
        let transport = Arc::new(ScriptedTransport::ok(
            200,
            text_reply("Sure.\n<response>{\"answer\": 4}</response>"),
        ));
        let adapter = adapter(transport.clone());
        let request = CompletionRequest::new("claude-3-haiku", vec![Message::user("2+2?")])
            .with_json_schema(r#"{"answer": "number"}"#);

        let reply = adapter
            .complete(ProviderCall::new(&request, "k"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.message.text, "{\"answer\": 4}");

        let sent = transport.last_body();
        let last = sent["messages"][0]["content"][0]["text"].as_str().unwrap();
        assert!(last.contains("<response></response>"));
        assert!(sent.get("system").is_none());
        assert_eq!(request.conversation[0].text, "2+2?");
    }

    #[tokio::test]
    async fn tool_use_reply_decodes_as_tool_call() {
        let transport = Arc::new(ScriptedTransport::ok(
            200,
            json!({
                "content": [
                    { "type": "text", "text": "Let me check." },
                    { "type": "tool_use", "id": "toolu_9", "name": "get_weather", "input": {"city": "Oslo"} }
                ],
                "stop_reason": "tool_use",
                "usage": { "input_tokens": 1, "output_tokens": 2 }
            }),
        ));
        let adapter = adapter(transport);
        let request = CompletionRequest::new("claude-3-haiku", vec![Message::user("weather?")]);
        let reply = adapter
            .complete(ProviderCall::new(&request, "k"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.message.role, Role::ToolCall);
        assert_eq!(reply.message.tool_use_id(), "toolu_9");
        assert_eq!(reply.message.text, "Let me check.");
        assert_eq!(reply.finish_reason, FinishReason::ToolUse);
    }

    #[tokio::test]
    async fn overloaded_is_retried_until_exhausted() {
        let transport = Arc::new(ScriptedTransport::ok(
            529,
            json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
        ));
        let adapter = adapter(transport.clone());
        let request = CompletionRequest::new("claude-3-haiku", vec![Message::user("hi")]);
        let err = adapter
            .complete(ProviderCall::new(&request, "k"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(transport.calls(), 3);
    }

    #[test]
    fn error_mapping() {
        let error = |kind: &str| {
            json!({"type": "error", "error": {"type": kind, "message": "m"}}).to_string()
        };
        assert!(matches!(
            map_error(401, &error("authentication_error")),
            Attempt::Fatal(SwitchboardError::AuthError { .. })
        ));
        assert!(matches!(
            map_error(403, &error("permission_error")),
            Attempt::Fatal(SwitchboardError::AuthError { .. })
        ));
        for kind in ["rate_limit_error", "overloaded_error", "api_error"] {
            assert!(matches!(map_error(500, &error(kind)), Attempt::Retry { .. }));
        }
        assert!(matches!(
            map_error(400, &error("invalid_request_error")),
            Attempt::Fatal(SwitchboardError::ProviderRejected { ref code, .. }) if code == "invalid_request_error"
        ));
        assert!(matches!(
            map_error(502, "<html>bad gateway</html>"),
            Attempt::Retry { .. }
        ));
    }

    #[test]
    fn empty_content_is_protocol_error() {
        let resp = HttpResponse::new(200, r#"{"content": [], "stop_reason": "end_turn"}"#);
        assert!(matches!(
            classify(&resp),
            Attempt::Fatal(SwitchboardError::ProviderRejected { .. })
        ));
    }
}
