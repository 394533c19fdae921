use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Number, Value};

use crate::functions::{
    format_arguments, json_schema_for, DynToolAdapter, FunctionDefinition, FunctionParameter,
    ToolAdapter, ToolError, ToolRegistryBuilder,
};
use crate::math;

/// The five arithmetic tools. The set is closed: the model can only ever
/// reach one of these variants by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathTool {
    Add,
    Multiply,
    SquareRoot,
    Exponential,
    NaturalLog,
}

impl MathTool {
    pub const ALL: [MathTool; 5] = [
        MathTool::Add,
        MathTool::Multiply,
        MathTool::SquareRoot,
        MathTool::Exponential,
        MathTool::NaturalLog,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MathTool::Add => "add_tool",
            MathTool::Multiply => "multiply_tool",
            MathTool::SquareRoot => "sqrt_tool",
            MathTool::Exponential => "exp_tool",
            MathTool::NaturalLog => "ln_tool",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            MathTool::Add => "Return a + b.",
            MathTool::Multiply => "Return a * b.",
            MathTool::SquareRoot => "Return sqrt(a).",
            MathTool::Exponential => "Return exp(a).",
            MathTool::NaturalLog => "Return ln(a).",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    fn is_binary(self) -> bool {
        matches!(self, MathTool::Add | MathTool::Multiply)
    }

    /// Applies the underlying math function; `b` is ignored by unary tools.
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            MathTool::Add => math::add_numbers(a, b),
            MathTool::Multiply => math::multiply_numbers(a, b),
            MathTool::SquareRoot => math::square_root(a),
            MathTool::Exponential => math::exponential(a),
            MathTool::NaturalLog => math::ln(a),
        }
    }

    /// Evaluates the tool against raw arguments. A non-finite result is a
    /// domain error, never a value.
    pub fn evaluate(self, arguments: &Map<String, Value>) -> Result<f64, ToolError> {
        let a = self.number(arguments, "a")?;
        let b = if self.is_binary() {
            self.number(arguments, "b")?
        } else {
            0.0
        };

        let result = self.apply(a, b);
        if !result.is_finite() {
            return Err(ToolError::Invocation {
                tool: self.name().to_string(),
                message: format!(
                    "{} is outside the domain of {} (result {result})",
                    format_arguments(arguments),
                    self.name()
                ),
            });
        }

        Ok(result)
    }

    fn number(self, arguments: &Map<String, Value>, key: &str) -> Result<f64, ToolError> {
        let value = arguments.get(key).ok_or_else(|| ToolError::InvalidArguments {
            tool: self.name().to_string(),
            message: format!("missing argument '{key}'"),
        })?;

        let number = match value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        };

        number.ok_or_else(|| ToolError::InvalidArguments {
            tool: self.name().to_string(),
            message: format!("argument '{key}' is not a number: {value}"),
        })
    }
}

#[async_trait]
impl ToolAdapter for MathTool {
    fn definition(&self) -> FunctionDefinition {
        let mut definition =
            FunctionDefinition::new(self.name()).with_description(self.description());
        definition.add_parameter(
            FunctionParameter::new("a", json_schema_for::<f64>())
                .with_description(if self.is_binary() {
                    "First operand."
                } else {
                    "The operand."
                }),
        );
        if self.is_binary() {
            definition.add_parameter(
                FunctionParameter::new("b", json_schema_for::<f64>())
                    .with_description("Second operand."),
            );
        }
        definition
    }

    async fn invoke(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let result = self.evaluate(arguments)?;
        Number::from_f64(result)
            .map(Value::Number)
            .ok_or_else(|| ToolError::Invocation {
                tool: self.name().to_string(),
                message: format!("result {result} is not representable"),
            })
    }
}

pub fn math_tools() -> Vec<DynToolAdapter> {
    MathTool::ALL
        .into_iter()
        .map(|tool| Arc::new(tool) as DynToolAdapter)
        .collect()
}

pub fn register_math_functions(builder: &mut ToolRegistryBuilder) {
    for tool in math_tools() {
        builder.register(tool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::ToolRegistry;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn registry() -> ToolRegistry {
        let mut builder = ToolRegistry::builder();
        register_math_functions(&mut builder);
        builder.build().expect("registry")
    }

    #[tokio::test]
    async fn adapters_match_direct_math_calls() {
        let registry = registry();
        let cases: [(&str, Value, f64); 5] = [
            ("add_tool", json!({"a": 4, "b": 5.2}), math::add_numbers(4.0, 5.2)),
            ("multiply_tool", json!({"a": 3, "b": -2.5}), math::multiply_numbers(3.0, -2.5)),
            ("sqrt_tool", json!({"a": 625}), math::square_root(625.0)),
            ("exp_tool", json!({"a": 1.5}), math::exponential(1.5)),
            ("ln_tool", json!({"a": 5}), math::ln(5.0)),
        ];

        for (name, arguments, expected) in cases {
            let value = registry.invoke(name, &args(arguments)).await.expect(name);
            assert_eq!(value.as_f64(), Some(expected), "{name}");
        }
    }

    #[tokio::test]
    async fn sqrt_of_negative_is_an_invocation_error() {
        let error = registry()
            .invoke("sqrt_tool", &args(json!({"a": -4})))
            .await
            .unwrap_err();
        match error {
            ToolError::Invocation { tool, message } => {
                assert_eq!(tool, "sqrt_tool");
                assert!(message.contains("a=-4"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ln_of_zero_and_exp_overflow_are_invocation_errors() {
        let registry = registry();
        let ln_zero = registry.invoke("ln_tool", &args(json!({"a": 0}))).await;
        assert!(matches!(ln_zero, Err(ToolError::Invocation { .. })));

        let overflow = registry.invoke("exp_tool", &args(json!({"a": 1000}))).await;
        assert!(matches!(overflow, Err(ToolError::Invocation { .. })));
    }

    #[test]
    fn binary_tools_require_both_operands() {
        let error = MathTool::Add.evaluate(&args(json!({"a": 1}))).unwrap_err();
        assert!(matches!(error, ToolError::InvalidArguments { .. }));
        assert_eq!(MathTool::SquareRoot.evaluate(&args(json!({"a": "9"}))).unwrap(), 3.0);
    }

    #[test]
    fn names_round_trip() {
        for tool in MathTool::ALL {
            assert_eq!(MathTool::from_name(tool.name()), Some(tool));
        }
        assert_eq!(MathTool::from_name("ADD_TOOL"), None);
    }

    #[test]
    fn definitions_describe_parameters() {
        let add = MathTool::Add.definition();
        assert_eq!(add.parameters.required, vec!["a", "b"]);
        let sqrt = MathTool::SquareRoot.definition();
        assert_eq!(sqrt.parameters.required, vec!["a"]);
        assert_eq!(sqrt.description.as_deref(), Some("Return sqrt(a)."));
    }
}
