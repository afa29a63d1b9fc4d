use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// ToolSchema
// ---------------------------------------------------------------------------

/// Recursive parameter schema, passed to every provider unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub schema_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, ToolSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ToolSchema>>,
}

impl ToolSchema {
    pub fn of_type(schema_type: impl Into<String>) -> Self {
        Self {
            schema_type: schema_type.into(),
            ..Default::default()
        }
    }

    pub fn object() -> Self {
        Self::of_type("object")
    }

    pub fn string() -> Self {
        Self::of_type("string")
    }

    pub fn array(items: ToolSchema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::of_type("array")
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, schema: ToolSchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Tool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub title: String,
    pub description: String,
    pub schema: ToolSchema,
}

impl Tool {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        schema: ToolSchema,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            schema,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider declaration shapes
// ---------------------------------------------------------------------------

pub fn to_openai(tool: &Tool) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.title,
            "description": tool.description,
            "parameters": tool.schema.to_value(),
        }
    })
}

/// All tools collapse into a single `functionDeclarations` group.
pub fn to_gemini(tools: &[Tool]) -> Option<Value> {
    if tools.is_empty() {
        return None;
    }
    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.title,
                "description": tool.description,
                "parameters": tool.schema.to_value(),
            })
        })
        .collect();
    Some(json!({ "functionDeclarations": declarations }))
}

pub fn to_anthropic(tool: &Tool) -> Value {
    json!({
        "name": tool.title,
        "description": tool.description,
        "input_schema": tool.schema.to_value(),
    })
}

// ---------------------------------------------------------------------------
// ToolChoice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    None,
    Required(String),
}

impl ToolChoice {
    pub fn for_openai(&self) -> Option<Value> {
        match self {
            ToolChoice::Auto => None,
            ToolChoice::None => Some(json!("none")),
            ToolChoice::Required(name) => Some(json!({
                "type": "function",
                "function": { "name": name }
            })),
        }
    }

    /// Emitted as the request's `toolConfig`.
    pub fn for_gemini(&self) -> Option<Value> {
        match self {
            ToolChoice::Auto => None,
            ToolChoice::None => Some(json!({
                "functionCallingConfig": { "mode": "NONE" }
            })),
            ToolChoice::Required(name) => Some(json!({
                "functionCallingConfig": {
                    "mode": "ANY",
                    "allowedFunctionNames": [name],
                }
            })),
        }
    }

    pub fn for_anthropic(&self) -> Option<Value> {
        match self {
            ToolChoice::Auto => None,
            ToolChoice::None => Some(json!({ "type": "none" })),
            ToolChoice::Required(name) => Some(json!({ "type": "tool", "name": name })),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
