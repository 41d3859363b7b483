use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A model-issued request to invoke one named capability.
///
/// `arguments` is the raw JSON text exactly as the model produced it; it is
/// decoded by the dispatcher so malformed payloads can be reported back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// One entry of the conversation. Immutable once appended to history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A string-valued tool parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
    /// Closed set of accepted values, rendered as a JSON-schema `enum`.
    pub choices: &'static [&'static str],
}

impl ParamSpec {
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: true,
            choices: &[],
        }
    }

    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: false,
            choices: &[],
        }
    }

    pub const fn with_choices(mut self, choices: &'static [&'static str]) -> Self {
        self.choices = choices;
        self
    }
}

/// Capability descriptor advertised to the model service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

impl ToolDefinition {
    /// JSON-schema object describing the parameters.
    pub fn parameters_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        for param in &self.params {
            let mut prop = serde_json::json!({
                "type": "string",
                "description": param.description,
            });
            if !param.choices.is_empty() {
                prop["enum"] = serde_json::json!(param.choices);
            }
            properties.insert(param.name.to_string(), prop);
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required_params().collect::<Vec<_>>(),
            "additionalProperties": false,
        })
    }

    pub fn required_params(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.params.iter().filter(|p| p.required).map(|p| p.name)
    }
}

/// One feedback turn's instruction. Replaced, never mutated, between turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub instruction: String,
    pub turn: usize,
    pub budget: usize,
}

impl Task {
    pub fn initial(instruction: impl Into<String>, budget: usize) -> Self {
        Self {
            instruction: instruction.into(),
            turn: 1,
            budget,
        }
    }

    pub fn next(&self, instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            turn: self.turn + 1,
            budget: self.budget,
        }
    }

    pub fn is_last(&self) -> bool {
        self.turn >= self.budget
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestClassification {
    Passed,
    Failed,
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub raw_output: String,
    pub classification: TestClassification,
}

/// Failures of the model service itself. Fatal to the current task.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model service request failed: {0:#}")]
    Transport(#[from] anyhow::Error),
    #[error("model service returned no choices")]
    NoChoices,
    #[error("request was refused: {0}")]
    Refused(String),
}

/// The hosted chat-completion service, seen as a black box: send the
/// conversation plus the tool catalog, receive one assistant message.
pub trait ChatModel: Send + Sync {
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        tools: &'a [ToolDefinition],
    ) -> Pin<Box<dyn Future<Output = Result<Message, ModelError>> + Send + 'a>>;
}
