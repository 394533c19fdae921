use std::{
    collections::VecDeque,
    fs,
    path::Path,
    sync::Mutex,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    functions::{FunctionCall, ToolCall},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// One canned model reply. Either text, tool calls, both, or an error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptedReply {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ScriptedCall>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Replays a fixed queue of replies in order, for tests and offline runs.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_replies(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Loads a YAML or JSON list of replies.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LLMError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|error| LLMError::Provider(format!("{}: {error}", path.display())))?;
        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw).map_err(|error| error.to_string()),
            _ => serde_yaml::from_str(&raw).map_err(|error| error.to_string()),
        };
        let replies: Vec<ScriptedReply> = parsed
            .map_err(|error| LLMError::Provider(format!("{}: {error}", path.display())))?;
        Ok(Self::from_replies(replies))
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(ScriptedReply {
            text: text.into(),
            ..ScriptedReply::default()
        })
    }

    pub fn tool_call(self, name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.push(ScriptedReply {
            tool_calls: vec![ScriptedCall {
                name: name.into(),
                arguments,
            }],
            ..ScriptedReply::default()
        })
    }

    pub fn fail(self, message: impl Into<String>) -> Self {
        self.push(ScriptedReply {
            error: Some(message.into()),
            ..ScriptedReply::default()
        })
    }

    pub fn push(self, reply: ScriptedReply) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
        self
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|replies| replies.len()).unwrap_or(0)
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let next = self
            .replies
            .lock()
            .map_err(|_| LLMError::Provider("scripted provider lock poisoned".to_string()))?
            .pop_front();

        let reply = next.ok_or_else(|| LLMError::Provider("no more scripted responses".to_string()))?;
        if let Some(error) = reply.error {
            return Err(LLMError::Provider(error));
        }

        let tool_calls = reply
            .tool_calls
            .into_iter()
            .map(|call| ToolCall::new(FunctionCall::new(call.name, Value::Object(call.arguments))))
            .collect();

        Ok(CompletionResponse::new(
            ChatMessage::assistant(reply.text).with_tool_calls(tool_calls),
        ))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
