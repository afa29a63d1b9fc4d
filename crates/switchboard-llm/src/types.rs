use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use switchboard_types::{Provider, Result, SwitchboardError};
use uuid::Uuid;

use crate::tools::{Tool, ToolChoice};

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolCall,
    ToolResult,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One turn of a conversation. The role decides which optional fields apply:
/// `tool_use_id` and `tool_name` on ToolCall and ToolResult, `tool_arguments`
/// on ToolCall only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_arguments: Option<Map<String, Value>>,
}

impl Message {
    fn plain(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tool_use_id: None,
            tool_name: None,
            tool_arguments: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::plain(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::plain(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, text)
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            role: Role::ToolCall,
            text: String::new(),
            tool_use_id: Some(id.into()),
            tool_name: Some(name.into()),
            tool_arguments: Some(arguments),
        }
    }

    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::ToolResult,
            text: text.into(),
            tool_use_id: Some(id.into()),
            tool_name: Some(name.into()),
            tool_arguments: None,
        }
    }

    /// Attach accompanying text, e.g. the model's preamble before a tool call.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn tool_use_id(&self) -> &str {
        self.tool_use_id.as_deref().unwrap_or_default()
    }

    pub fn tool_name(&self) -> &str {
        self.tool_name.as_deref().unwrap_or_default()
    }

    /// Arguments as a JSON object, empty when absent.
    pub fn arguments_value(&self) -> Value {
        Value::Object(self.tool_arguments.clone().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// CompletionRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub json_mode: bool,
    #[serde(default)]
    pub json_schema: String,
    pub conversation: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    /// Title of a tool the model must call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_tool: Option<String>,
    /// Forbid tool use for this turn. Wins over `required_tool`.
    #[serde(default)]
    pub prohibit_tool: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, conversation: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            conversation,
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_json_schema(mut self, schema: impl Into<String>) -> Self {
        self.json_mode = true;
        self.json_schema = schema.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn require_tool(mut self, title: impl Into<String>) -> Self {
        self.required_tool = Some(title.into());
        self
    }

    pub fn prohibit_tools(mut self) -> Self {
        self.prohibit_tool = true;
        self
    }

    /// Check every caller-side precondition and resolve the provider.
    /// Fails before anything touches the network.
    pub fn validate(&self) -> Result<Provider> {
        if self.model.trim().is_empty() {
            return Err(invalid("`model` cannot be empty"));
        }
        if self.json_mode && self.json_schema.trim().is_empty() {
            return Err(invalid("`json_mode` requires a non-empty `json_schema`"));
        }
        let Some(last) = self.conversation.last() else {
            return Err(invalid("the conversation cannot be empty"));
        };
        if !matches!(last.role, Role::User | Role::ToolResult) {
            return Err(invalid(
                "the last message must be a user message or a tool result",
            ));
        }

        let mut last_call: Option<&str> = None;
        for (i, msg) in self.conversation.iter().enumerate() {
            if msg.role != Role::ToolCall && msg.text.trim().is_empty() {
                return Err(invalid(format!(
                    "{:?} message at index {i} has no text",
                    msg.role
                )));
            }
            match msg.role {
                Role::System if i != 0 => {
                    return Err(invalid(format!(
                        "a system message may only appear first (found at index {i})"
                    )));
                }
                Role::ToolCall => {
                    require_tool_fields(msg, i)?;
                    last_call = msg.tool_use_id.as_deref();
                }
                Role::ToolResult => {
                    require_tool_fields(msg, i)?;
                    if last_call != msg.tool_use_id.as_deref() {
                        return Err(invalid(format!(
                            "tool result at index {i} does not answer the preceding tool call"
                        )));
                    }
                    last_call = None;
                }
                _ => last_call = None,
            }
        }

        if let Some(ref required) = self.required_tool {
            if !self.tools.iter().any(|t| &t.title == required) {
                return Err(invalid(format!(
                    "required tool '{required}' is not among the supplied tools"
                )));
            }
        }

        Provider::from_model(&self.model).ok_or_else(|| SwitchboardError::UnsupportedModel {
            model: self.model.clone(),
        })
    }

    /// The effective tool-choice directive.
    pub fn tool_choice(&self) -> ToolChoice {
        if self.prohibit_tool {
            ToolChoice::None
        } else if let Some(ref name) = self.required_tool {
            ToolChoice::Required(name.clone())
        } else {
            ToolChoice::Auto
        }
    }

    /// JSON instructions are skipped when answering a tool call.
    pub fn json_applied(&self) -> bool {
        self.json_mode
            && self
                .conversation
                .last()
                .is_some_and(|m| m.role != Role::ToolResult)
    }
}

fn invalid(message: impl Into<String>) -> SwitchboardError {
    SwitchboardError::Validation(message.into())
}

fn require_tool_fields(msg: &Message, index: usize) -> Result<()> {
    if msg.tool_use_id().is_empty() || msg.tool_name().is_empty() {
        return Err(invalid(format!(
            "{:?} message at index {index} needs a tool_use_id and a tool_name",
            msg.role
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Provider-reported token counts for one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// One accounting entry per successful completion. The id lets consumers
/// deduplicate records they have already reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl UsageRecord {
    pub fn new(model: impl Into<String>, usage: Usage) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// FinishReason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    ContentFilter,
    Other,
}

// ---------------------------------------------------------------------------
// CompletionResponse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub model: String,
    pub provider: Provider,
    /// The provider's own stop reason string, unmodified.
    pub stop_reason: String,
    pub finish_reason: FinishReason,
    pub message: Message,
    pub usage_record: UsageRecord,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
