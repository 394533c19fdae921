use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time;

use crate::{
    functions::{format_arguments, ToolError, ToolRegistry},
    history::{ConversationState, Message, StateError},
    plugins::{finish::FinishTool, math::register_math_functions},
    prompts::{Prompt, PromptLibrary, PromptLoadError},
    trace::render_trace,
    types::{CompletionRequest, CompletionResponse},
    LLMError, LLMProvider,
};

pub const DEFAULT_MODEL: &str = "mix_77/gemma3-qat-tools:12b";
pub const MATH_PROMPT: &str = "fizban.json";
pub const REACT_PROMPT: &str = "react_bot.yaml";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Prompt(#[from] PromptLoadError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("model call failed: {0}")]
    ModelCall(#[from] LLMError),
    #[error("provider call timed out after {after_ms} ms")]
    ProviderTimeout { after_ms: u64 },
    #[error("turn exceeded {limit} model iterations")]
    TurnLimitExceeded { limit: usize },
    #[error("utterance is empty")]
    EmptyUtterance,
    #[error(transparent)]
    State(#[from] StateError),
}

/// What happens when a tool fails with a domain or argument error.
/// Unknown tool names always end the turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorPolicy {
    /// The turn ends with [`AgentError::Tool`].
    #[default]
    Fail,
    /// The error becomes the tool result (`error: <message>`) and the model
    /// gets to react to it.
    Report,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub model: String,
    pub temperature: f32,
    pub max_iterations: usize,
    pub llm_timeout_ms: u64,
    pub model_retries: u32,
    pub retry_backoff_ms: u64,
    pub tool_error_policy: ToolErrorPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.0,
            max_iterations: 8,
            llm_timeout_ms: 120_000,
            model_retries: 0,
            retry_backoff_ms: 500,
            tool_error_policy: ToolErrorPolicy::Fail,
        }
    }
}

impl AgentConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_llm_timeout_ms(mut self, ms: u64) -> Self {
        self.llm_timeout_ms = ms;
        self
    }

    pub fn with_model_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.model_retries = retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_tool_error_policy(mut self, policy: ToolErrorPolicy) -> Self {
        self.tool_error_policy = policy;
        self
    }
}

/// Where the turn state machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    AwaitingModel,
    RoutingDecision,
    InvokingTools,
    Done,
}

/// Outcome of the routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tools,
    End,
}

/// Routes to tool execution when the latest message is an assistant reply
/// that requests tools; anything else ends the turn.
pub fn route(state: &ConversationState) -> Route {
    match state.last() {
        Some(Message::Assistant { tool_requests, .. }) if !tool_requests.is_empty() => Route::Tools,
        _ => Route::End,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEvent {
    ModelReplied { text: String, tool_calls: usize },
    ToolInvoked { name: String, arguments: String, result: Value },
    ToolFailed { name: String, error: String },
    Completed { reply: String, iterations: usize },
}

/// Result of one full turn.
#[derive(Debug, Clone)]
pub struct Turn {
    /// Index of the first message appended after the human utterance.
    pub start: usize,
    pub reply: String,
    pub events: Vec<TurnEvent>,
    pub iterations: usize,
    pub phases: Vec<TurnPhase>,
}

/// A system prompt bound to a model provider and a fixed tool set.
#[derive(Clone)]
pub struct Agent {
    name: String,
    instructions: String,
    provider: Arc<dyn LLMProvider>,
    tools: Arc<ToolRegistry>,
    config: AgentConfig,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish()
    }
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        instructions: impl Into<String>,
        provider: Arc<dyn LLMProvider>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            provider,
            tools,
            config: AgentConfig::default(),
        }
    }

    /// Renders `prompt` against `tools` and uses the result as the system
    /// instruction.
    pub fn from_prompt(
        prompt: &Prompt,
        provider: Arc<dyn LLMProvider>,
        tools: Arc<ToolRegistry>,
    ) -> Result<Self, AgentError> {
        let instructions = prompt.render(&tools)?;
        Ok(Self::new(prompt.name(), instructions, provider, tools))
    }

    /// The calculator agent: the five math tools.
    pub fn math_agent(
        provider: Arc<dyn LLMProvider>,
        library: &PromptLibrary,
        prompt_name: &str,
    ) -> Result<Self, AgentError> {
        let mut builder = ToolRegistry::builder();
        register_math_functions(&mut builder);
        let tools = builder.build()?;
        let prompt = library.load(prompt_name)?;
        Self::from_prompt(&prompt, provider, Arc::new(tools))
    }

    /// The ReAct agent: the math tools plus `finish`.
    pub fn react_agent(
        provider: Arc<dyn LLMProvider>,
        library: &PromptLibrary,
        prompt_name: &str,
    ) -> Result<Self, AgentError> {
        let mut builder = ToolRegistry::builder();
        register_math_functions(&mut builder);
        let tools = builder.with_tool(Arc::new(FinishTool)).build()?;
        let prompt = library.load(prompt_name)?;
        Self::from_prompt(&prompt, provider, Arc::new(tools))
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn session(&self) -> Session {
        Session::new(self.clone())
    }

    /// Sends the whole history plus the tool descriptors to the model and
    /// returns a new state with exactly one assistant message appended.
    /// `state` is never touched.
    pub async fn agent_step(
        &self,
        state: &ConversationState,
    ) -> Result<ConversationState, AgentError> {
        let request = CompletionRequest::from_history(&self.config.model, state.iter())
            .with_temperature(self.config.temperature)
            .with_tool_registry(&self.tools);

        let response = self.complete(request).await?;
        if let Some(usage) = &response.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "model usage"
            );
        }

        let offset = state.len();
        let message = response
            .message
            .into_assistant_message(|index| format!("call_{offset}_{index}"))?;

        let mut next = state.clone();
        next.push(message)?;
        Ok(next)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, AgentError> {
        let timeout = Duration::from_millis(self.config.llm_timeout_ms);
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut attempt = 0u32;

        loop {
            let error = match time::timeout(timeout, self.provider.complete(request.clone())).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(error)) => AgentError::ModelCall(error),
                Err(_) => AgentError::ProviderTimeout {
                    after_ms: self.config.llm_timeout_ms,
                },
            };

            if attempt >= self.config.model_retries {
                return Err(error);
            }
            attempt += 1;
            tracing::warn!(
                provider = self.provider.name(),
                attempt,
                error = %error,
                "model call failed, retrying"
            );
            time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    /// Runs every tool request of the latest assistant message, in order,
    /// appending one tool result per request.
    pub async fn execute_tools(
        &self,
        state: &ConversationState,
    ) -> Result<(ConversationState, Vec<TurnEvent>), AgentError> {
        let requests = state
            .last()
            .map(|message| message.tool_requests().to_vec())
            .unwrap_or_default();

        let mut next = state.clone();
        let mut events = Vec::with_capacity(requests.len());

        for request in requests {
            let value = match self.tools.invoke(&request.name, &request.arguments).await {
                Ok(value) => {
                    events.push(TurnEvent::ToolInvoked {
                        name: request.name.clone(),
                        arguments: format_arguments(&request.arguments),
                        result: value.clone(),
                    });
                    value
                }
                Err(error @ ToolError::UnknownTool { .. }) => return Err(error.into()),
                Err(error) => match self.config.tool_error_policy {
                    ToolErrorPolicy::Fail => return Err(error.into()),
                    ToolErrorPolicy::Report => {
                        tracing::warn!(tool = %request.name, error = %error, "tool failed");
                        events.push(TurnEvent::ToolFailed {
                            name: request.name.clone(),
                            error: error.to_string(),
                        });
                        Value::String(format!("error: {error}"))
                    }
                },
            };

            next.push(Message::tool_result(request.id, request.name, value))?;
        }

        Ok((next, events))
    }
}

/// One conversation with an [`Agent`]. Owns its history; turns run one at a
/// time and a failed turn leaves the history as it was.
pub struct Session {
    agent: Agent,
    state: ConversationState,
    event_callback: Option<Arc<dyn Fn(&TurnEvent) + Send + Sync>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("agent", &self.agent.name)
            .field("messages", &self.state.len())
            .finish()
    }
}

impl Session {
    pub fn new(agent: Agent) -> Self {
        let state = ConversationState::new(agent.instructions.clone());
        Self {
            agent,
            state,
            event_callback: None,
        }
    }

    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&TurnEvent) + Send + Sync + 'static,
    ) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn messages(&self) -> &[Message] {
        self.state.messages()
    }

    fn record(&self, events: &mut Vec<TurnEvent>, event: TurnEvent) {
        if let Some(callback) = &self.event_callback {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (callback)(&event)));
        }
        events.push(event);
    }

    /// Runs one full turn for `utterance`.
    pub async fn send(&mut self, utterance: impl Into<String>) -> Result<Turn, AgentError> {
        let utterance = utterance.into();
        if utterance.trim().is_empty() {
            return Err(AgentError::EmptyUtterance);
        }

        let mut state = self.state.clone();
        state.push(Message::human(utterance))?;
        let start = state.len();

        let limit = self.agent.config.max_iterations.max(1);
        let mut events = Vec::new();
        let mut phases = Vec::new();
        let mut iterations = 0usize;

        loop {
            if iterations >= limit {
                return Err(AgentError::TurnLimitExceeded { limit });
            }
            iterations += 1;

            phases.push(TurnPhase::AwaitingModel);
            state = self.agent.agent_step(&state).await?;
            if let Some(message) = state.last() {
                let event = TurnEvent::ModelReplied {
                    text: message.text().unwrap_or_default().to_string(),
                    tool_calls: message.tool_requests().len(),
                };
                self.record(&mut events, event);
            }

            phases.push(TurnPhase::RoutingDecision);
            let next = route(&state);
            tracing::debug!(agent = %self.agent.name, iteration = iterations, route = ?next, "routed");

            match next {
                Route::End => {
                    phases.push(TurnPhase::Done);
                    break;
                }
                Route::Tools => {
                    phases.push(TurnPhase::InvokingTools);
                    let (after_tools, tool_events) = self.agent.execute_tools(&state).await?;
                    state = after_tools;
                    for event in tool_events {
                        self.record(&mut events, event);
                    }
                }
            }
        }

        let reply = state.final_reply().unwrap_or_default().to_string();
        self.record(
            &mut events,
            TurnEvent::Completed {
                reply: reply.clone(),
                iterations,
            },
        );
        self.state = state;

        Ok(Turn {
            start,
            reply,
            events,
            iterations,
            phases,
        })
    }

    /// Runs one turn and returns the final assistant text, or an empty
    /// string when the final reply has none.
    pub async fn chat(&mut self, utterance: impl Into<String>) -> Result<String, AgentError> {
        Ok(self.send(utterance).await?.reply)
    }

    /// Runs one turn and returns its ReAct trace lines.
    pub async fn chat_trace(
        &mut self,
        utterance: impl Into<String>,
    ) -> Result<Vec<String>, AgentError> {
        let turn = self.send(utterance).await?;
        Ok(render_trace(self.state.since(turn.start)).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::plugins::math::math_tools;
    use crate::providers::scripted::ScriptedProvider;

    fn agent(provider: ScriptedProvider) -> Agent {
        let tools = ToolRegistry::builder()
            .with_tools(math_tools())
            .build()
            .expect("registry");
        Agent::new("calc", "You are CalcBot.", Arc::new(provider), Arc::new(tools))
    }

    #[test]
    fn routes_on_latest_assistant_message() {
        let mut state = ConversationState::new("sys");
        assert_eq!(route(&state), Route::End);

        state.push(Message::human("add")).unwrap();
        let args = json!({"a": 4, "b": 5.2}).as_object().cloned().unwrap();
        state
            .push(Message::assistant_with_tools(
                "",
                vec![crate::history::ToolRequest::new("c0", "add_tool", args)],
            ))
            .unwrap();
        assert_eq!(route(&state), Route::Tools);

        state.push(Message::tool_result("c0", "add_tool", 9.2)).unwrap();
        assert_eq!(route(&state), Route::End);
    }

    #[tokio::test]
    async fn agent_step_appends_exactly_one_message() {
        let agent = agent(ScriptedProvider::new().reply("hello"));
        let mut state = ConversationState::new("sys");
        state.push(Message::human("hi")).unwrap();

        let next = agent.agent_step(&state).await.unwrap();
        assert_eq!(next.len(), state.len() + 1);
        assert_eq!(next.final_reply(), Some("hello"));
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn execute_tools_keeps_request_order() {
        let agent = agent(ScriptedProvider::new());
        let mut state = ConversationState::new("sys");
        state.push(Message::human("go")).unwrap();
        let requests = vec![
            crate::history::ToolRequest::new(
                "c0",
                "sqrt_tool",
                json!({"a": 625}).as_object().cloned().unwrap(),
            ),
            crate::history::ToolRequest::new(
                "c1",
                "multiply_tool",
                json!({"a": 3, "b": 4}).as_object().cloned().unwrap(),
            ),
        ];
        state
            .push(Message::assistant_with_tools("", requests))
            .unwrap();

        let (next, events) = agent.execute_tools(&state).await.unwrap();
        assert_eq!(
            next.since(state.len()),
            &[
                Message::tool_result("c0", "sqrt_tool", 25.0),
                Message::tool_result("c1", "multiply_tool", 12.0),
            ]
        );
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn report_policy_feeds_errors_back_to_the_model() {
        let provider = ScriptedProvider::new()
            .tool_call("sqrt_tool", json!({"a": -4}))
            .reply("cannot take sqrt of a negative number");
        let agent = agent(provider).with_config(
            AgentConfig::default().with_tool_error_policy(ToolErrorPolicy::Report),
        );
        let mut session = agent.session();

        let turn = session.send("sqrt of -4").await.unwrap();
        let observation = &session.messages()[3];
        match observation {
            Message::ToolResult { value, .. } => {
                assert!(value.as_str().unwrap().starts_with("error: "));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert!(turn
            .events
            .iter()
            .any(|event| matches!(event, TurnEvent::ToolFailed { name, .. } if name == "sqrt_tool")));
    }

    #[tokio::test]
    async fn fail_policy_ends_the_turn_without_touching_history() {
        let provider = ScriptedProvider::new().tool_call("sqrt_tool", json!({"a": -4}));
        let mut session = agent(provider).session();

        let error = session.send("sqrt of -4").await.unwrap_err();
        assert!(matches!(error, AgentError::Tool(ToolError::Invocation { .. })));
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn unknown_tools_are_fatal_even_when_reporting() {
        let provider = ScriptedProvider::new().tool_call("divide_tool", json!({"a": 1, "b": 2}));
        let agent = agent(provider).with_config(
            AgentConfig::default().with_tool_error_policy(ToolErrorPolicy::Report),
        );
        let mut session = agent.session();

        let error = session.send("divide").await.unwrap_err();
        assert!(matches!(
            error,
            AgentError::Tool(ToolError::UnknownTool { ref name, .. }) if name == "divide_tool"
        ));
    }

    #[tokio::test]
    async fn retries_model_errors_before_giving_up() {
        let provider = ScriptedProvider::new().fail("busy").reply("ok");
        let agent = agent(provider)
            .with_config(AgentConfig::default().with_model_retries(1, 1));
        let mut session = agent.session();
        assert_eq!(session.chat("hi").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn zero_iteration_config_still_allows_one_model_call() {
        let config = AgentConfig {
            max_iterations: 0,
            ..AgentConfig::default()
        };
        let mut session = agent(ScriptedProvider::new().reply("ok"))
            .with_config(config)
            .session();
        assert_eq!(session.chat("hi").await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn empty_utterances_are_rejected() {
        let mut session = agent(ScriptedProvider::new()).session();
        assert!(matches!(
            session.send("   ").await,
            Err(AgentError::EmptyUtterance)
        ));
    }

    #[tokio::test]
    async fn event_callback_sees_every_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let provider = ScriptedProvider::new()
            .tool_call("exp_tool", json!({"a": 0}))
            .reply("1");
        let mut session = agent(provider).session().with_event_callback(move |event| {
            sink.lock().unwrap().push(event.clone());
        });

        let turn = session.send("e^0").await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, turn.events);
        assert!(matches!(seen.last(), Some(TurnEvent::Completed { iterations: 2, .. })));
    }

    #[derive(Debug)]
    struct SlowProvider;

    #[async_trait::async_trait]
    impl LLMProvider for SlowProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LLMError> {
            time::sleep(Duration::from_millis(200)).await;
            Err(LLMError::Provider("too late".into()))
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn slow_models_time_out() {
        let tools = ToolRegistry::builder().build().unwrap();
        let agent = Agent::new("slow", "sys", Arc::new(SlowProvider), Arc::new(tools))
            .with_config(AgentConfig::default().with_llm_timeout_ms(10));
        let mut session = agent.session();

        let error = session.send("hi").await.unwrap_err();
        assert!(matches!(error, AgentError::ProviderTimeout { after_ms: 10 }));
        assert_eq!(session.messages().len(), 1);
    }
}
