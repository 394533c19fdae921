use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::functions::{FunctionCall, Tool, ToolCall, ToolRegistry};
use crate::history::{value_text, Message, ToolRequest};
use crate::LLMError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A chat message in the OpenAI-compatible wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tool_calls: Vec<ToolCall>,
}

// Ollama answers `"tool_calls": null` on plain replies.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ToolCall>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<ToolCall>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            name: None,
            tool_call_id: Some(id.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn text(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Converts a provider reply into an assistant [`Message`]. Calls without
    /// an id get `fallback_id(index)`.
    pub fn into_assistant_message(
        self,
        fallback_id: impl Fn(usize) -> String,
    ) -> Result<Message, LLMError> {
        if self.role != MessageRole::Assistant {
            return Err(LLMError::InvalidResponse("reply was not an assistant message"));
        }

        let mut tool_requests = Vec::with_capacity(self.tool_calls.len());
        for (index, call) in self.tool_calls.into_iter().enumerate() {
            let arguments = match call.function.arguments {
                Value::Object(map) => map,
                Value::Null => serde_json::Map::new(),
                _ => {
                    return Err(LLMError::InvalidResponse(
                        "tool call arguments were not a JSON object",
                    ))
                }
            };
            let id = call
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| fallback_id(index));
            tool_requests.push(ToolRequest::new(id, call.function.name, arguments));
        }

        Ok(Message::Assistant {
            text: self.content.unwrap_or_default(),
            tool_requests,
        })
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        match message {
            Message::System { text } => ChatMessage::system(text.clone()),
            Message::Human { text } => ChatMessage::user(text.clone()),
            Message::Assistant {
                text,
                tool_requests,
            } => {
                let tool_calls = tool_requests
                    .iter()
                    .map(|request| {
                        ToolCall::new(FunctionCall::new(
                            request.name.clone(),
                            Value::Object(request.arguments.clone()),
                        ))
                        .with_id(request.id.clone())
                    })
                    .collect();
                ChatMessage {
                    role: MessageRole::Assistant,
                    content: if text.is_empty() && !tool_requests.is_empty() {
                        None
                    } else {
                        Some(text.clone())
                    },
                    name: None,
                    tool_call_id: None,
                    tool_calls,
                }
            }
            Message::ToolResult {
                call_id,
                tool_name,
                value,
            } => {
                let mut chat = ChatMessage::tool(call_id.clone(), value_text(value));
                chat.name = Some(tool_name.clone());
                chat
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
            tools: Vec::new(),
        }
    }

    pub fn from_history<'a, I>(model: impl Into<String>, history: I) -> Self
    where
        I: IntoIterator<Item = &'a Message>,
    {
        Self::new(model, history.into_iter().map(ChatMessage::from).collect())
    }

    pub fn with_max_tokens(mut self, value: u32) -> Self {
        self.max_tokens = Some(value);
        self
    }

    pub fn with_temperature(mut self, value: f32) -> Self {
        self.temperature = Some(value);
        self
    }

    pub fn with_tools<I>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = Tool>,
    {
        self.tools.extend(tools);
        self
    }

    pub fn with_tool_registry(mut self, registry: &ToolRegistry) -> Self {
        self.tools.extend(registry.tools());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub message: ChatMessage,
    pub usage: Option<TokenUsage>,
}

impl CompletionResponse {
    pub fn new(message: ChatMessage) -> Self {
        Self {
            message,
            usage: None,
        }
    }
}
