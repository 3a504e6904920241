//! Serialization-boundary transforms for tool schemas
//!
//! The canonical schema is never modified. Native declarations are derived
//! from it on the way out: unsupported keys are dropped, unions collapse to
//! their first non-null member, and type tokens are optionally uppercased.

use super::{ToolDefinition, ToolSchema};
use serde_json::{Map, Value};

/// Case convention for JSON Schema `type` tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeCase {
    #[default]
    Lower,
    Upper,
}

impl TypeCase {
    pub fn from_uppercase_flag(uppercase: bool) -> Self {
        if uppercase {
            TypeCase::Upper
        } else {
            TypeCase::Lower
        }
    }

    fn apply(&self, token: &str) -> String {
        match self {
            TypeCase::Lower => token.to_lowercase(),
            TypeCase::Upper => token.to_uppercase(),
        }
    }
}

/// Keys the remote declaration surface accepts
const ALLOWED_KEYS: &[&str] = &[
    "type",
    "format",
    "description",
    "nullable",
    "enum",
    "maxItems",
    "minItems",
    "properties",
    "required",
    "items",
    "minProperties",
    "maxProperties",
    "minimum",
    "maximum",
    "minLength",
    "maxLength",
    "pattern",
    "propertyOrdering",
];

/// Rewrite every `type` token in a schema to the given case
///
/// Property names are left alone even when a property is called `type`.
pub fn normalize_type_case(schema: &Value, case: TypeCase) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                let value = match (key.as_str(), value) {
                    ("type", Value::String(token)) => Value::String(case.apply(token)),
                    ("type", Value::Array(tokens)) => Value::Array(
                        tokens
                            .iter()
                            .map(|t| match t {
                                Value::String(s) => Value::String(case.apply(s)),
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    ("properties", Value::Object(props)) => Value::Object(
                        props
                            .iter()
                            .map(|(name, prop)| (name.clone(), normalize_type_case(prop, case)))
                            .collect(),
                    ),
                    (_, nested) => normalize_type_case(nested, case),
                };
                out.insert(key.clone(), value);
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| normalize_type_case(v, case)).collect())
        }
        other => other.clone(),
    }
}

/// Inverse of `normalize_type_case`: back to lowercase tokens
pub fn restore_type_case(schema: &Value) -> Value {
    normalize_type_case(schema, TypeCase::Lower)
}

/// Reduce a JSON Schema to the subset native declarations accept
pub fn clean_parameters(schema: &Value) -> Value {
    let Value::Object(map) = schema else {
        return schema.clone();
    };
    let mut cleaned = Map::new();

    for union in ["anyOf", "oneOf", "allOf"] {
        if let Some(Value::Array(options)) = map.get(union) {
            let nullable = options
                .iter()
                .any(|o| o.get("type").and_then(Value::as_str) == Some("null"));
            if let Some(first) = options
                .iter()
                .find(|o| o.is_object() && o.get("type").and_then(Value::as_str) != Some("null"))
            {
                if let Value::Object(merged) = clean_parameters(first) {
                    cleaned.extend(merged);
                }
            }
            if nullable {
                cleaned.insert("nullable".to_string(), Value::Bool(true));
            }
            if !cleaned.is_empty() {
                return Value::Object(cleaned);
            }
        }
    }

    if let Some(constant) = map.get("const") {
        cleaned.insert("enum".to_string(), Value::Array(vec![constant.clone()]));
    }

    if let Some(raw) = map.get("type") {
        let mut nullable = map.get("nullable").and_then(Value::as_bool).unwrap_or(false);
        let token = match raw {
            Value::Array(tokens) => {
                let strings: Vec<&str> = tokens.iter().filter_map(Value::as_str).collect();
                nullable |= strings.contains(&"null");
                strings
                    .into_iter()
                    .find(|t| *t != "null")
                    .unwrap_or("string")
                    .to_string()
            }
            Value::String(token) => token.clone(),
            _ => "string".to_string(),
        };
        if nullable {
            cleaned.insert("nullable".to_string(), Value::Bool(true));
        }
        cleaned.insert("type".to_string(), Value::String(token));
    }

    if let Some(Value::Object(props)) = map.get("properties") {
        cleaned.insert(
            "properties".to_string(),
            Value::Object(
                props
                    .iter()
                    .map(|(name, prop)| (name.clone(), clean_parameters(prop)))
                    .collect(),
            ),
        );
    }
    if let Some(items) = map.get("items").filter(|i| i.is_object()) {
        cleaned.insert("items".to_string(), clean_parameters(items));
    }

    for (key, value) in map {
        if ALLOWED_KEYS.contains(&key.as_str()) && !cleaned.contains_key(key) {
            cleaned.insert(key.clone(), value.clone());
        }
    }
    Value::Object(cleaned)
}

/// Native function declaration for one tool
pub fn to_declaration(tool: &ToolDefinition, case: TypeCase) -> Value {
    let mut declaration = Map::new();
    declaration.insert("name".to_string(), Value::String(tool.name.clone()));
    if let Some(description) = &tool.description {
        declaration.insert(
            "description".to_string(),
            Value::String(description.clone()),
        );
    }
    declaration.insert(
        "parameters".to_string(),
        normalize_type_case(&clean_parameters(&tool.parameters), case),
    );
    Value::Object(declaration)
}

/// Native declarations for a whole schema set
pub fn to_declarations(schema: &ToolSchema, case: TypeCase) -> Value {
    Value::Array(
        schema
            .tools()
            .iter()
            .map(|t| to_declaration(t, case))
            .collect(),
    )
}
