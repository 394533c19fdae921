use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("tool result for call {0} has no matching tool request")]
    OrphanToolResult(String),
    #[error("a conversation must open with a system message")]
    MissingSystemMessage,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Call identity; the matching `ToolResult` carries the same id.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        text: String,
    },
    Human {
        text: String,
    },
    Assistant {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_requests: Vec<ToolRequest>,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        value: Value,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message::System { text: text.into() }
    }

    pub fn human(text: impl Into<String>) -> Self {
        Message::Human { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Message::Assistant {
            text: text.into(),
            tool_requests: Vec::new(),
        }
    }

    pub fn assistant_with_tools(text: impl Into<String>, tool_requests: Vec<ToolRequest>) -> Self {
        Message::Assistant {
            text: text.into(),
            tool_requests,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Message::ToolResult {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            value: value.into(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Message::System { text } | Message::Human { text } | Message::Assistant { text, .. } => {
                Some(text.as_str())
            }
            Message::ToolResult { .. } => None,
        }
    }

    pub fn tool_requests(&self) -> &[ToolRequest] {
        match self {
            Message::Assistant { tool_requests, .. } => tool_requests,
            _ => &[],
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Message::Assistant { .. })
    }
}

/// Renders a tool value for humans and for the wire: strings bare, anything
/// else as JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// The ordered, append-only message sequence of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StateRecord")]
pub struct ConversationState {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct StateRecord {
    messages: Vec<Message>,
}

impl TryFrom<StateRecord> for ConversationState {
    type Error = StateError;

    fn try_from(record: StateRecord) -> Result<Self, Self::Error> {
        Self::from_messages(record.messages)
    }
}

impl ConversationState {
    pub fn new(system_text: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_text)],
        }
    }

    /// Rebuilds a state, checking every message the way [`push`](Self::push)
    /// does. The first message must be the system message.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, StateError> {
        let mut messages = messages.into_iter();
        let mut state = match messages.next() {
            Some(Message::System { text }) => Self::new(text),
            _ => return Err(StateError::MissingSystemMessage),
        };
        for message in messages {
            state.push(message)?;
        }
        Ok(state)
    }

    /// Appends `message`. A `ToolResult` is only accepted after an assistant
    /// message that requested the same call id.
    pub fn push(&mut self, message: Message) -> Result<(), StateError> {
        if let Message::ToolResult { call_id, .. } = &message {
            let requested = self
                .messages
                .iter()
                .flat_map(|earlier| earlier.tool_requests())
                .any(|request| &request.id == call_id);
            if !requested {
                return Err(StateError::OrphanToolResult(call_id.clone()));
            }
        }

        self.messages.push(message);
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages appended at or after `start`.
    pub fn since(&self, start: usize) -> &[Message] {
        &self.messages[start.min(self.messages.len())..]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Text of the last message if it is an assistant reply.
    pub fn final_reply(&self) -> Option<&str> {
        match self.messages.last() {
            Some(Message::Assistant { text, .. }) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}
