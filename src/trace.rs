use std::collections::VecDeque;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    functions::format_arguments,
    history::{value_text, Message, ToolRequest},
};

static REASONING_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(Thought|Observation):").expect("valid reasoning marker regex"));

/// Lazy, one-shot rendering of a turn's messages as ReAct trace lines.
///
/// - `System` and `Human` become `System: …` and `You: …`.
/// - An assistant message with tool requests yields one `Action: name(k=v, …)`
///   line per request.
/// - Assistant text that starts with `Thought:` or `Observation:` is emitted
///   verbatim, one line per non-blank line; any other text becomes
///   `Answer: …`.
/// - A tool result becomes `Observation: <value>`.
#[derive(Debug)]
pub struct TraceRenderer<'a> {
    messages: std::slice::Iter<'a, Message>,
    pending: VecDeque<String>,
}

impl<'a> TraceRenderer<'a> {
    pub fn new(messages: &'a [Message]) -> Self {
        Self {
            messages: messages.iter(),
            pending: VecDeque::new(),
        }
    }

    fn expand(&mut self, message: &Message) {
        match message {
            Message::System { text } => self.pending.push_back(format!("System: {text}")),
            Message::Human { text } => self.pending.push_back(format!("You: {text}")),
            Message::Assistant {
                tool_requests,
                ..
            } if !tool_requests.is_empty() => {
                self.pending
                    .extend(tool_requests.iter().map(|request| format!("Action: {}", call(request))));
            }
            Message::Assistant { text, .. } => {
                let text = text.trim();
                if REASONING_MARKER.is_match(text) {
                    self.pending.extend(
                        text.lines()
                            .map(str::trim_end)
                            .filter(|line| !line.trim().is_empty())
                            .map(str::to_string),
                    );
                } else {
                    self.pending.push_back(format!("Answer: {text}"));
                }
            }
            Message::ToolResult { value, .. } => {
                self.pending
                    .push_back(format!("Observation: {}", value_text(value)));
            }
        }
    }
}

impl Iterator for TraceRenderer<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            let message = self.messages.next()?;
            self.expand(message);
        }
    }
}

pub fn render_trace(messages: &[Message]) -> TraceRenderer<'_> {
    TraceRenderer::new(messages)
}

/// Renders every message of a session, one line per message (one per tool
/// request for assistant tool calls).
pub fn render_history(messages: &[Message]) -> Vec<String> {
    let mut lines = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            Message::System { text } => lines.push(format!("System: {text}")),
            Message::Human { text } => lines.push(format!("You: {text}")),
            Message::Assistant {
                text,
                tool_requests,
            } => {
                if tool_requests.is_empty() {
                    lines.push(format!("Agent: {text}"));
                } else {
                    lines.extend(
                        tool_requests
                            .iter()
                            .map(|request| format!("Agent (tool call): {}", call(request))),
                    );
                }
            }
            Message::ToolResult { value, .. } => {
                lines.push(format!("Observation: {}", value_text(value)))
            }
        }
    }
    lines
}

fn call(request: &ToolRequest) -> String {
    format!("{}({})", request.name, format_arguments(&request.arguments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sqrt_request() -> ToolRequest {
        ToolRequest::new(
            "call_0",
            "sqrt_tool",
            json!({"a": 625}).as_object().cloned().unwrap(),
        )
    }

    #[test]
    fn renders_react_turn() {
        let turn = vec![
            Message::assistant_with_tools("", vec![sqrt_request()]),
            Message::tool_result("call_0", "sqrt_tool", 25.0),
            Message::assistant("Thought: done\nAnswer: 25"),
        ];

        let lines: Vec<String> = render_trace(&turn).collect();
        assert_eq!(
            lines,
            ["Action: sqrt_tool(a=625)", "Observation: 25.0", "Thought: done", "Answer: 25"]
        );
    }

    #[test]
    fn plain_text_becomes_an_answer() {
        let turn = vec![
            Message::system("sys"),
            Message::human("What is 4 + 5.2?"),
            Message::assistant("9.2"),
        ];
        let lines: Vec<String> = render_trace(&turn).collect();
        assert_eq!(lines, ["System: sys", "You: What is 4 + 5.2?", "Answer: 9.2"]);
    }

    #[test]
    fn is_lazy_and_one_shot() {
        let turn = vec![Message::assistant("Observation: 3\n\nThought: next")];
        let mut renderer = render_trace(&turn);
        assert_eq!(renderer.next().as_deref(), Some("Observation: 3"));
        assert_eq!(renderer.next().as_deref(), Some("Thought: next"));
        assert_eq!(renderer.next(), None);
        assert_eq!(renderer.next(), None);
    }

    #[test]
    fn marker_must_lead_the_text() {
        let turn = vec![Message::assistant("The Thought: is mine")];
        let lines: Vec<String> = render_trace(&turn).collect();
        assert_eq!(lines, ["Answer: The Thought: is mine"]);
    }

    #[test]
    fn full_history_lists_tool_calls() {
        let args = json!({"a": 4, "b": 5.2}).as_object().cloned().unwrap();
        let messages = vec![
            Message::system("You are Fizban."),
            Message::human("Add 4 and 5.2"),
            Message::assistant_with_tools("", vec![ToolRequest::new("c0", "add_tool", args)]),
            Message::tool_result("c0", "add_tool", 9.2),
            Message::assistant("9.2"),
        ];

        assert_eq!(
            render_history(&messages),
            [
                "System: You are Fizban.",
                "You: Add 4 and 5.2",
                "Agent (tool call): add_tool(a=4, b=5.2)",
                "Observation: 9.2",
                "Agent: 9.2",
            ]
        );
    }
}
