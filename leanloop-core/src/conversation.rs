//! Chat history as typed messages.
//!
//! Tool traffic can only enter a [`Conversation`] through [`Conversation::push_tool_round`],
//! which appends the assistant's request and the matching tool result together. A request is
//! therefore always immediately followed by its result.

use crate::error::LoopError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRequest {
    pub correlation_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolInvocationRequest {
    /// The `proof` argument of a `verify_lean_proof` call.
    pub fn proof_argument(&self) -> Result<&str, LoopError> {
        match self.arguments.get("proof") {
            Some(Value::String(s)) => Ok(s.as_str()),
            Some(other) => Err(LoopError::ToolProtocol(format!(
                "tool call {} has a non-string `proof` argument: {}",
                self.correlation_id, other
            ))),
            None => Err(LoopError::ToolProtocol(format!(
                "tool call {} is missing the `proof` argument",
                self.correlation_id
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call: Option<ToolInvocationRequest>,
    },
    Tool {
        correlation_id: String,
        name: String,
        content: String,
    },
}

impl Message {
    pub fn role(&self) -> &'static str {
        match self {
            Message::System { .. } => "system",
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::Tool { .. } => "tool",
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Message::System { content }
            | Message::User { content }
            | Message::Assistant { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    pub fn tool_call(&self) -> Option<&ToolInvocationRequest> {
        match self {
            Message::Assistant { tool_call, .. } => tool_call.as_ref(),
            _ => None,
        }
    }

    /// OpenAI chat-completions shape.
    pub fn to_wire(&self) -> Value {
        match self {
            Message::System { content } => json!({ "role": "system", "content": content }),
            Message::User { content } => json!({ "role": "user", "content": content }),
            Message::Assistant {
                content,
                tool_call: None,
            } => json!({ "role": "assistant", "content": content }),
            Message::Assistant {
                content,
                tool_call: Some(call),
            } => {
                let arguments = match &call.arguments {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                json!({
                    "role": "assistant",
                    "content": if content.is_empty() { Value::Null } else { Value::String(content.clone()) },
                    "tool_calls": [{
                        "id": call.correlation_id,
                        "type": "function",
                        "function": { "name": call.tool_name, "arguments": arguments }
                    }]
                })
            }
            Message::Tool {
                correlation_id,
                name,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": correlation_id,
                "name": name,
                "content": content,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn seeded(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            messages: vec![
                Message::System {
                    content: system.into(),
                },
                Message::User {
                    content: user.into(),
                },
            ],
        }
    }

    pub fn push_answer(&mut self, content: impl Into<String>) {
        self.messages.push(Message::Assistant {
            content: content.into(),
            tool_call: None,
        });
    }

    /// Append an assistant tool request and its result as one unit.
    pub fn push_tool_round(
        &mut self,
        request: ToolInvocationRequest,
        assistant_text: impl Into<String>,
        result: impl Into<String>,
    ) {
        let correlation_id = request.correlation_id.clone();
        let name = request.tool_name.clone();
        self.messages.push(Message::Assistant {
            content: assistant_text.into(),
            tool_call: Some(request),
        });
        self.messages.push(Message::Tool {
            correlation_id,
            name,
            content: result.into(),
        });
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn tool_rounds(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| matches!(m, Message::Tool { .. }))
            .count()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn to_wire(&self) -> Vec<Value> {
        self.messages.iter().map(Message::to_wire).collect()
    }
}
