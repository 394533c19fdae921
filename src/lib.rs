pub mod error;
pub mod math;
pub mod functions;
pub mod plugins;
pub mod prompts;
pub mod history;
pub mod types;
pub mod providers;
pub mod agents;
pub mod trace;
pub mod web;

pub use error::LLMError;
pub use providers::LLMProvider;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use functions::{
    DynToolAdapter, FunctionCall, FunctionDefinition, FunctionParameter, Tool, ToolAdapter,
    ToolCall, ToolError, ToolRegistry, ToolRegistryBuilder,
};
pub use history::{ConversationState, Message, StateError, ToolRequest};
pub use prompts::{load_prompt, Prompt, PromptLibrary, PromptLoadError};
pub use agents::{
    route,
    Agent,
    AgentConfig,
    AgentError,
    Route,
    Session,
    ToolErrorPolicy,
    Turn,
    TurnEvent,
    TurnPhase,
};
pub use trace::{render_history, render_trace, TraceRenderer};
pub use schemars::JsonSchema;
