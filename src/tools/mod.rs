//! Tool declarations, calls, and results
//!
//! Requests carry OpenAI-style tool declarations. Both the nested form
//! (`{"type": "function", "function": {...}}`) and the flat form
//! (`{"name": ..., "parameters": ...}`) are accepted; the canonical schema
//! is always re-serialized in the nested form.

pub mod cache;
pub mod emulated;
pub mod orchestrator;
pub mod schema;

pub use cache::{CacheStats, CompatibilityFlags, ToolInvocationCache, ToolInvocationCacheEntry};
pub use orchestrator::{
    Execution, FunctionCallingMode, FunctionCallingOrchestrator, InvocationPlan,
    InvocationStrategy, TurnInterceptor,
};
pub use schema::TypeCase;

use crate::types::ToolCallMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One declared function
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    /// JSON Schema of the arguments object
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Parse a nested or flat OpenAI tool declaration
    pub fn from_value(value: &Value) -> Option<Self> {
        let function = value.get("function").filter(|f| f.is_object()).unwrap_or(value);
        let name = function
            .get("name")
            .or_else(|| value.get("name"))
            .and_then(Value::as_str)?
            .trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            description: function
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            parameters: function
                .get("parameters")
                .filter(|p| p.is_object())
                .cloned()
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}})),
        })
    }

    /// Nested OpenAI form
    pub fn to_value(&self) -> Value {
        let mut function = serde_json::Map::new();
        function.insert("name".to_string(), Value::String(self.name.clone()));
        if let Some(description) = &self.description {
            function.insert(
                "description".to_string(),
                Value::String(description.clone()),
            );
        }
        function.insert("parameters".to_string(), self.parameters.clone());
        serde_json::json!({ "type": "function", "function": function })
    }
}

/// The set of tools presented in a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct ToolSchema {
    tools: Vec<ToolDefinition>,
}

impl ToolSchema {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Stable fingerprint of the declared schema set
    ///
    /// Key order inside a declaration does not matter; declaration order does.
    pub fn fingerprint(&self) -> Fingerprint {
        if self.tools.is_empty() {
            return Fingerprint("empty".to_string());
        }
        let canonical = canonical_json(&Value::Array(
            self.tools.iter().map(ToolDefinition::to_value).collect(),
        ));
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Fingerprint(digest[..16].to_string())
    }
}

impl TryFrom<Vec<Value>> for ToolSchema {
    type Error = String;

    fn try_from(values: Vec<Value>) -> Result<Self, Self::Error> {
        let mut tools = Vec::with_capacity(values.len());
        for (idx, value) in values.iter().enumerate() {
            match ToolDefinition::from_value(value) {
                Some(tool) => tools.push(tool),
                None => return Err(format!("tool declaration {} has no function name", idx)),
            }
        }
        Ok(Self { tools })
    }
}

impl From<ToolSchema> for Vec<Value> {
    fn from(schema: ToolSchema) -> Self {
        schema.tools.iter().map(ToolDefinition::to_value).collect()
    }
}

/// Short hex digest identifying a tool schema set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serialize with object keys sorted at every level
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Value::String(k.clone()),
                        canonical_json(&map[k.as_str()])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Caller's tool-choice hint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum ToolChoice {
    #[default]
    Auto,
    /// Never call tools; the catalog is not injected
    None,
    Required,
    /// Force a specific function
    Function(String),
}

impl TryFrom<Value> for ToolChoice {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::Null => Ok(ToolChoice::Auto),
            Value::String(s) => Ok(match s.to_lowercase().as_str() {
                "auto" => ToolChoice::Auto,
                "none" | "no" | "off" => ToolChoice::None,
                "required" | "any" => ToolChoice::Required,
                _ => ToolChoice::Function(s.clone()),
            }),
            Value::Object(map) => map
                .get("function")
                .and_then(|f| f.get("name"))
                .or_else(|| map.get("name"))
                .and_then(Value::as_str)
                .map(|name| ToolChoice::Function(name.to_string()))
                .ok_or_else(|| "tool_choice object has no function name".to_string()),
            other => Err(format!("unsupported tool_choice: {}", other)),
        }
    }
}

impl From<ToolChoice> for Value {
    fn from(choice: ToolChoice) -> Self {
        match choice {
            ToolChoice::Auto => Value::String("auto".into()),
            ToolChoice::None => Value::String("none".into()),
            ToolChoice::Required => Value::String("required".into()),
            ToolChoice::Function(name) => {
                serde_json::json!({"type": "function", "function": {"name": name}})
            }
        }
    }
}

/// A tool call produced by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: new_call_id(),
            name: name.into(),
            arguments,
            thought_signature: None,
        }
    }

    pub fn with_thought_signature(mut self, signature: Option<String>) -> Self {
        self.thought_signature = signature;
        self
    }

    /// Form recorded on an assistant message
    pub fn to_message(&self) -> ToolCallMessage {
        ToolCallMessage {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.to_string(),
            thought_signature: self.thought_signature.clone(),
        }
    }
}

/// `call_` followed by 24 hex characters
pub fn new_call_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..24])
}

/// Structured, caller-visible tool failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    pub mode: InvocationStrategy,
    pub message: String,
    /// Offending model output, truncated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// Outcome of a tool-enabled turn
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallResult {
    /// The model answered without calling a tool
    NoCall,
    Calls(Vec<ToolCall>),
    Error(ToolError),
}

impl ToolCallResult {
    pub fn calls(&self) -> &[ToolCall] {
        match self {
            ToolCallResult::Calls(calls) => calls,
            _ => &[],
        }
    }
}
