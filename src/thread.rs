use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

const NAME_WORDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A model-issued request to run one tool. `id` correlates it with the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum ToolOutcome {
    Success(Value),
    Error(String),
}

impl ToolOutcome {
    /// Tools that report their own failures return `{"error": "..."}`; treat that shape as an error.
    pub fn from_payload(payload: Value) -> Self {
        if let Some(obj) = payload.as_object() {
            if obj.len() == 1 {
                if let Some(msg) = obj.get("error").and_then(|v| v.as_str()) {
                    return ToolOutcome::Error(msg.to_string());
                }
            }
        }
        ToolOutcome::Success(payload)
    }

    pub fn to_payload(&self) -> Value {
        match self {
            ToolOutcome::Success(v) => v.clone(),
            ToolOutcome::Error(msg) => json!({ "error": msg }),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolCallResult>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_result: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    pub fn tool_request(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::new(Role::Assistant, content.into());
        msg.tool_calls = calls;
        msg
    }

    /// The content holds the payload handed back to the model.
    pub fn tool_result(call: &ToolCallRequest, outcome: ToolOutcome) -> Self {
        let mut msg = Self::new(Role::Tool, outcome.to_payload().to_string());
        msg.tool_result = Some(ToolCallResult { call_id: call.id.clone(), name: call.name.clone(), outcome });
        msg
    }
}

/// Role/content pair shown in the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub role: Role,
    pub content: String,
}

/// Tool results and text-less tool requests are execution detail and stay hidden.
pub fn display_projection(messages: &[Message]) -> Vec<DisplayMessage> {
    messages
        .iter()
        .filter(|m| m.role != Role::Tool && !m.content.is_empty())
        .map(|m| DisplayMessage { role: m.role, content: m.content.clone() })
        .collect()
}

pub fn thread_name(messages: &[Message]) -> String {
    let Some(first) = messages.iter().find(|m| m.role == Role::User) else {
        return "New Chat".to_string();
    };
    let words: Vec<&str> = first.content.split_whitespace().collect();
    let mut name = words.iter().take(NAME_WORDS).copied().collect::<Vec<_>>().join(" ");
    if words.len() > NAME_WORDS {
        name.push_str("...");
    }
    name
}

pub fn generate_thread_id() -> String {
    Uuid::new_v4().to_string()
}
