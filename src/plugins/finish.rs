use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::functions::{
    json_schema_for, FunctionDefinition, FunctionParameter, ToolAdapter, ToolError,
};

pub const FINISH_TOOL: &str = "finish";

/// No-op tool a ReAct model calls to say it has its answer. It computes
/// nothing; the observation simply echoes the answer back.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinishTool;

#[async_trait]
impl ToolAdapter for FinishTool {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition::new(FINISH_TOOL)
            .with_description("Signal that the final answer is known.")
            .with_parameter(
                FunctionParameter::new("answer", json_schema_for::<String>())
                    .with_description("The final answer, if any.")
                    .optional(),
            )
    }

    async fn invoke(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let answer = match arguments.get("answer") {
            Some(Value::String(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Some(Value::Null) | None => "done".to_string(),
            Some(Value::String(_)) => "done".to_string(),
            Some(other) => other.to_string(),
        };
        Ok(Value::String(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echoes_answer_or_done() {
        let with_answer = json!({"answer": " 25 "}).as_object().cloned().unwrap();
        assert_eq!(FinishTool.invoke(&with_answer).await.unwrap(), json!("25"));
        assert_eq!(FinishTool.invoke(&Map::new()).await.unwrap(), json!("done"));
    }

    #[test]
    fn answer_is_optional() {
        let definition = FinishTool.definition();
        assert_eq!(definition.name, FINISH_TOOL);
        assert!(definition.parameters.required.is_empty());
        assert!(definition.parameters.properties.contains_key("answer"));
    }
}
