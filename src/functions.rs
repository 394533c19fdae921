use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use schemars::JsonSchema;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {name}{}", suggestion_hint(.suggestion))]
    UnknownTool {
        name: String,
        suggestion: Option<String>,
    },

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("tool {tool} failed: {message}")]
    Invocation { tool: String, message: String },

    #[error("tool {tool} has an invalid parameter schema: {message}")]
    Schema { tool: String, message: String },

    #[error("tool {0} is registered twice")]
    Duplicate(String),
}

fn suggestion_hint(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(name) => format!(" (did you mean {name}?)"),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: FunctionParameters,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: FunctionParameters::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameter(mut self, parameter: FunctionParameter) -> Self {
        self.add_parameter(parameter);
        self
    }

    pub fn add_parameter(&mut self, parameter: FunctionParameter) {
        let FunctionParameter {
            name,
            mut schema,
            description,
            required,
        } = parameter;

        if let Some(description) = description {
            if let Some(object) = schema.as_object_mut() {
                object.insert("description".to_string(), Value::String(description));
            }
        }

        if required {
            self.parameters.required.push(name.clone());
        }

        self.parameters.properties.insert(name, schema);
    }

    pub fn to_tool(&self) -> Tool {
        Tool::from(self.clone())
    }

    fn is_numeric_parameter(&self, name: &str) -> bool {
        self.parameters
            .properties
            .get(name)
            .and_then(|schema| schema.get("type"))
            .and_then(Value::as_str)
            .map_or(false, |kind| kind == "number")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionParameters {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(
        rename = "additionalProperties",
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_properties: Option<bool>,
}

impl FunctionParameters {
    pub fn new() -> Self {
        Self {
            kind: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: Some(false),
        }
    }
}

impl Default for FunctionParameters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct FunctionParameter {
    pub name: String,
    pub schema: Value,
    pub description: Option<String>,
    pub required: bool,
}

impl FunctionParameter {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            description: None,
            required: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Tool descriptor in the shape OpenAI-compatible chat endpoints expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: ToolType,
    pub function: FunctionDefinition,
}

impl From<FunctionDefinition> for Tool {
    fn from(function: FunctionDefinition) -> Self {
        Self {
            kind: ToolType::Function,
            function,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Function,
}

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
    pub raw_arguments: Option<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            raw_arguments: None,
        }
    }
}

/// A tool call as it travels over the wire; `arguments` is a JSON string there.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: Option<String>,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(function: FunctionCall) -> Self {
        Self { id: None, function }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl Serialize for ToolCall {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("ToolCall", 3)?;
        if let Some(id) = &self.id {
            state.serialize_field("id", id)?;
        }
        state.serialize_field("type", &ToolType::Function)?;
        state.serialize_field("function", &SerializableFunctionCall(&self.function))?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ToolCall {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawArguments {
            Encoded(String),
            Object(Value),
        }

        #[derive(Deserialize)]
        struct RawFunctionCall {
            name: String,
            #[serde(default)]
            arguments: Option<RawArguments>,
        }

        #[derive(Deserialize)]
        struct RawToolCall {
            id: Option<String>,
            #[serde(rename = "type", default)]
            kind: Option<String>,
            function: RawFunctionCall,
        }

        let raw = RawToolCall::deserialize(deserializer)?;
        if let Some(other) = raw.kind.as_deref().filter(|kind| *kind != "function") {
            return Err(serde::de::Error::custom(format!(
                "unsupported tool call type '{other}'"
            )));
        }

        // Some servers send arguments as an object instead of an encoded string.
        let (arguments, raw_arguments) = match raw.function.arguments {
            Some(RawArguments::Encoded(text)) if text.trim().is_empty() => {
                (Value::Object(Map::new()), Some(text))
            }
            Some(RawArguments::Encoded(text)) => {
                let value = serde_json::from_str(&text).map_err(|error| {
                    serde::de::Error::custom(format!("failed to parse function arguments: {error}"))
                })?;
                (value, Some(text))
            }
            Some(RawArguments::Object(value)) => (value, None),
            None => (Value::Object(Map::new()), None),
        };

        Ok(Self {
            id: raw.id,
            function: FunctionCall {
                name: raw.function.name,
                arguments,
                raw_arguments,
            },
        })
    }
}

struct SerializableFunctionCall<'a>(&'a FunctionCall);

impl<'a> Serialize for SerializableFunctionCall<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("function", 2)?;
        state.serialize_field("name", &self.0.name)?;
        let raw = if let Some(raw) = &self.0.raw_arguments {
            raw.clone()
        } else {
            serde_json::to_string(&self.0.arguments)
                .map_err(|error| serde::ser::Error::custom(error.to_string()))?
        };
        state.serialize_field("arguments", &raw)?;
        state.end()
    }
}

/// A named, described callable the model can select by name.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    fn definition(&self) -> FunctionDefinition;

    async fn invoke(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError>;
}

pub type DynToolAdapter = Arc<dyn ToolAdapter>;

struct RegisteredTool {
    adapter: DynToolAdapter,
    definition: FunctionDefinition,
    validator: JSONSchema,
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    adapters: Vec<DynToolAdapter>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: DynToolAdapter) {
        self.adapters.push(adapter);
    }

    pub fn with_tool(mut self, adapter: DynToolAdapter) -> Self {
        self.register(adapter);
        self
    }

    pub fn with_tools<I>(mut self, adapters: I) -> Self
    where
        I: IntoIterator<Item = DynToolAdapter>,
    {
        self.adapters.extend(adapters);
        self
    }

    pub fn build(self) -> Result<ToolRegistry, ToolError> {
        let mut tools = BTreeMap::new();

        for adapter in self.adapters {
            let definition = adapter.definition();
            let schema = serde_json::to_value(&definition.parameters).map_err(|error| {
                ToolError::Schema {
                    tool: definition.name.clone(),
                    message: error.to_string(),
                }
            })?;
            let validator = JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&schema)
                .map_err(|error| ToolError::Schema {
                    tool: definition.name.clone(),
                    message: error.to_string(),
                })?;

            let name = definition.name.clone();
            if tools.contains_key(&name) {
                return Err(ToolError::Duplicate(name));
            }

            tools.insert(
                name,
                RegisteredTool {
                    adapter,
                    definition,
                    validator,
                },
            );
        }

        Ok(ToolRegistry { tools })
    }
}

/// Closed name → adapter mapping. Built once, never mutated afterwards.
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.tools
            .values()
            .map(|tool| tool.definition.clone())
            .collect()
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.tools
            .values()
            .map(|tool| tool.definition.to_tool())
            .collect()
    }

    /// Looks up `name` exactly (case-sensitive), validates the arguments
    /// against the tool's schema and invokes it.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let tool = self.tools.get(name).ok_or_else(|| self.unknown(name))?;

        tracing::info!("[{name}] called with {}.", format_arguments(arguments));

        let arguments = coerce_numeric_strings(&tool.definition, arguments);
        let instance = Value::Object(arguments.clone());
        if let Err(errors) = tool.validator.validate(&instance) {
            let message = errors
                .map(|error| error.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ToolError::InvalidArguments {
                tool: name.to_string(),
                message,
            });
        }

        tool.adapter.invoke(&arguments).await
    }

    fn unknown(&self, name: &str) -> ToolError {
        let mut best: Option<(&String, usize)> = None;
        for candidate in self.tools.keys() {
            let distance = strsim::levenshtein(name, candidate);
            if best.map_or(true, |(_, current)| distance < current) {
                best = Some((candidate, distance));
            }
        }

        ToolError::UnknownTool {
            name: name.to_string(),
            suggestion: best
                .filter(|(_, distance)| *distance <= 3)
                .map(|(candidate, _)| candidate.clone()),
        }
    }
}

// Models regularly quote numbers; accept "4" where a number is expected.
fn coerce_numeric_strings(
    definition: &FunctionDefinition,
    arguments: &Map<String, Value>,
) -> Map<String, Value> {
    arguments
        .iter()
        .map(|(key, value)| {
            let coerced = match value {
                Value::String(text) if definition.is_numeric_parameter(key) => text
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| value.clone()),
                other => other.clone(),
            };
            (key.clone(), coerced)
        })
        .collect()
}

/// `a=4, b=5.2`, in key order.
pub fn format_arguments(arguments: &Map<String, Value>) -> String {
    let mut entries: Vec<_> = arguments.iter().collect();
    entries.sort_by(|left, right| left.0.cmp(right.0));
    entries
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(text) => format!("{key}={text}"),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema.schema).unwrap_or_else(|_| Value::Object(Map::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolAdapter for Echo {
        fn definition(&self) -> FunctionDefinition {
            FunctionDefinition::new("echo_tool")
                .with_description("Return a.")
                .with_parameter(FunctionParameter::new("a", json_schema_for::<f64>()))
        }

        async fn invoke(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
            Ok(arguments["a"].clone())
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::builder()
            .with_tool(Arc::new(Echo))
            .build()
            .expect("registry")
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn invokes_by_exact_name() {
        let result = registry()
            .invoke("echo_tool", &args(json!({"a": 2.5})))
            .await
            .expect("invoke");
        assert_eq!(result, json!(2.5));
    }

    #[tokio::test]
    async fn unknown_name_is_an_error_with_suggestion() {
        let error = registry()
            .invoke("Echo_tool", &args(json!({"a": 1})))
            .await
            .unwrap_err();
        match error {
            ToolError::UnknownTool { name, suggestion } => {
                assert_eq!(name, "Echo_tool");
                assert_eq!(suggestion.as_deref(), Some("echo_tool"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn distant_names_get_no_suggestion() {
        let error = registry()
            .invoke("launch_rockets", &args(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ToolError::UnknownTool { suggestion: None, .. }
        ));
    }

    #[tokio::test]
    async fn numeric_strings_are_coerced() {
        let result = registry()
            .invoke("echo_tool", &args(json!({"a": " 4 "})))
            .await
            .expect("invoke");
        assert_eq!(result.as_f64(), Some(4.0));
    }

    #[tokio::test]
    async fn schema_rejects_missing_and_extra_arguments() {
        let registry = registry();
        let missing = registry.invoke("echo_tool", &args(json!({}))).await;
        assert!(matches!(missing, Err(ToolError::InvalidArguments { .. })));

        let extra = registry
            .invoke("echo_tool", &args(json!({"a": 1, "b": 2})))
            .await;
        assert!(matches!(extra, Err(ToolError::InvalidArguments { .. })));

        let wrong_type = registry
            .invoke("echo_tool", &args(json!({"a": "four"})))
            .await;
        assert!(matches!(wrong_type, Err(ToolError::InvalidArguments { .. })));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = ToolRegistry::builder()
            .with_tool(Arc::new(Echo))
            .with_tool(Arc::new(Echo))
            .build();
        assert!(matches!(result, Err(ToolError::Duplicate(name)) if name == "echo_tool"));
    }

    #[test]
    fn tool_call_accepts_string_or_object_arguments() {
        let encoded: ToolCall = serde_json::from_value(json!({
            "id": "call_1",
            "type": "function",
            "function": {"name": "add_tool", "arguments": "{\"a\": 4, \"b\": 5.2}"}
        }))
        .expect("encoded");
        assert_eq!(encoded.function.arguments, json!({"a": 4, "b": 5.2}));

        let object: ToolCall = serde_json::from_value(json!({
            "function": {"name": "sqrt_tool", "arguments": {"a": 625}}
        }))
        .expect("object");
        assert_eq!(object.id, None);
        assert_eq!(object.function.arguments, json!({"a": 625}));
    }

    #[test]
    fn tool_call_serializes_arguments_as_string() {
        let call = ToolCall::new(FunctionCall::new("sqrt_tool", json!({"a": 625})))
            .with_id("call_0");
        let value = serde_json::to_value(&call).expect("serialize");
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["arguments"], "{\"a\":625}");
    }

    #[test]
    fn formats_arguments_in_key_order() {
        let formatted = format_arguments(&args(json!({"b": 5.2, "a": 4})));
        assert_eq!(formatted, "a=4, b=5.2");
    }
}
