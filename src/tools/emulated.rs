//! Emulated tool calling
//!
//! Tools are described to the model in a plain-text catalog and calls come
//! back as text blocks of the form:
//!
//! ```text
//! Request function call: get_weather
//! Parameters:
//! {"city": "Paris"}
//! ```
//!
//! Prior calls and tool results in the conversation history are rendered in
//! the same form so the model sees a consistent transcript.

use super::{ToolCall, ToolChoice, ToolSchema};
use crate::types::{ChatMessage, Role};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Marker opening an emulated call block
pub const CALL_MARKER: &str = "Request function call:";

const NAME_PREFIXES: &[&str] = &["default_api:", "default_api_", "functions.", "tools."];

fn call_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)Request\s+function\s+call:\s*([A-Za-z0-9_.:\-]+)").unwrap()
    })
}

fn params_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)Parameters:\s*").unwrap())
}

fn control_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<ctrl\d+>").unwrap())
}

/// Text catalog injected ahead of the conversation
///
/// Returns `None` when there is nothing to declare or the caller asked for
/// no tool use.
pub fn render_catalog(schema: &ToolSchema, choice: &ToolChoice) -> Option<String> {
    if schema.is_empty() || *choice == ToolChoice::None {
        return None;
    }
    let mut lines = vec!["Available Tools Catalog:".to_string()];
    for tool in schema.tools() {
        lines.push(format!("- Function: {}", tool.name));
        if let Some(description) = &tool.description {
            lines.push(format!("  Description: {}", description));
        }
        lines.push(format!("  Parameter Schema: {}", tool.parameters));
    }
    match choice {
        ToolChoice::Function(name) => lines.push(format!("Recommended function to use: {}", name)),
        ToolChoice::Required => {
            lines.push("A function call is required for this turn.".to_string())
        }
        ToolChoice::Auto | ToolChoice::None => {}
    }
    Some(format!("{}\n---\n", lines.join("\n")))
}

/// Render one call the way the model is expected to write it
pub fn format_call(name: &str, arguments: &Value) -> String {
    let pretty = serde_json::to_string_pretty(arguments).unwrap_or_else(|_| arguments.to_string());
    format!("{} {}\nParameters:\n{}", CALL_MARKER, name, pretty)
}

/// Rewrite tool calls and tool results in history into text form
pub fn visualize_history(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|message| match message.role {
            Role::Assistant if !message.tool_calls.is_empty() => {
                let calls: Vec<String> = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        let arguments = serde_json::from_str::<Value>(&call.arguments)
                            .unwrap_or_else(|_| Value::String(call.arguments.clone()));
                        format_call(&call.name, &arguments)
                    })
                    .collect();
                let mut content = message.content.trim().to_string();
                if !content.is_empty() {
                    content.push_str("\n\n");
                }
                content.push_str(&calls.join("\n"));
                ChatMessage::assistant(content)
            }
            Role::Tool => {
                let content = match &message.tool_call_id {
                    Some(id) => format!("Tool result (tool_call_id={}):\n{}", id, message.content),
                    None => message.content.clone(),
                };
                ChatMessage::new(Role::Tool, content)
            }
            _ => message.clone(),
        })
        .collect()
}

/// Strip the prefixes models like to put in front of function names
pub fn clean_function_name(name: &str) -> String {
    let name = name.trim().trim_end_matches(':').trim();
    for prefix in NAME_PREFIXES {
        if let Some(stripped) = name.strip_prefix(prefix) {
            return stripped.to_string();
        }
    }
    name.to_string()
}

/// Remove `<ctrlNN>` control tokens
pub fn strip_control_tokens(text: &str) -> String {
    control_token_pattern().replace_all(text, "").into_owned()
}

/// Byte offset of the first call marker, case-insensitive
pub fn find_marker(text: &str) -> Option<usize> {
    call_pattern().find(text).map(|m| m.start())
}

/// Result of scanning model output for emulated calls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCalls {
    /// Text before the first call block
    pub text: String,
    pub calls: Vec<ToolCall>,
    /// One message per call block that could not be parsed
    pub errors: Vec<String>,
}

/// Extract emulated calls from model output
///
/// Identical calls (same name and arguments) are reported once. When the
/// schema is non-empty, calls to undeclared functions count as errors.
pub fn parse_calls(text: &str, schema: &ToolSchema) -> ParsedCalls {
    let starts: Vec<usize> = call_pattern().find_iter(text).map(|m| m.start()).collect();
    let Some(&first) = starts.first() else {
        return ParsedCalls {
            text: text.to_string(),
            ..Default::default()
        };
    };

    let mut parsed = ParsedCalls {
        text: text[..first].trim_end().to_string(),
        ..Default::default()
    };

    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(text.len());
        let block = &text[start..end];

        match parse_block(block, schema) {
            Ok((name, arguments)) => {
                let duplicate = parsed
                    .calls
                    .iter()
                    .any(|c| c.name == name && c.arguments == arguments);
                if !duplicate {
                    parsed.calls.push(ToolCall::new(name, arguments));
                }
            }
            Err(reason) => {
                tracing::debug!(reason = %reason, "Unparseable emulated call block");
                parsed.errors.push(reason);
            }
        }
    }
    parsed
}

fn parse_block(block: &str, schema: &ToolSchema) -> Result<(String, Value), String> {
    let captures = call_pattern()
        .captures(block)
        .ok_or_else(|| "call marker without a function name".to_string())?;
    let name = clean_function_name(captures.get(1).map(|m| m.as_str()).unwrap_or_default());
    if name.is_empty() {
        return Err("empty function name".to_string());
    }
    if !schema.is_empty() && schema.get(&name).is_none() {
        return Err(format!("unknown function '{}'", name));
    }

    let rest = &block[captures.get(0).map(|m| m.end()).unwrap_or(0)..];
    let arguments = match params_pattern().find(rest) {
        Some(m) => {
            let body = strip_control_tokens(&rest[m.end()..]);
            let json = extract_json_object(&body)
                .ok_or_else(|| format!("no JSON object in parameters of '{}'", name))?;
            let value: Value = serde_json::from_str(json)
                .map_err(|e| format!("invalid parameters for '{}': {}", name, e))?;
            if !value.is_object() {
                return Err(format!("parameters for '{}' are not an object", name));
            }
            value
        }
        None if rest.trim_start().starts_with('{') => {
            // Inline form: name{...}
            let body = strip_control_tokens(rest);
            let json = extract_json_object(&body)
                .ok_or_else(|| format!("unterminated inline parameters for '{}'", name))?;
            serde_json::from_str(json)
                .map_err(|e| format!("invalid parameters for '{}': {}", name, e))?
        }
        None => Value::Object(serde_json::Map::new()),
    };
    Ok((name, arguments))
}

/// First balanced `{...}` in `text`, respecting string literals
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Length of the longest suffix of `text` that could start a call marker
///
/// Streaming output holds this many bytes back so a marker split across
/// chunks is never leaked to the caller. Case is ignored, as in
/// `find_marker`.
pub fn partial_marker_len(text: &str) -> usize {
    let marker = CALL_MARKER.as_bytes();
    let tail = text.as_bytes();
    let max = marker.len().min(tail.len());
    (1..=max)
        .rev()
        .find(|&n| {
            text.is_char_boundary(tail.len() - n)
                && marker[..n].eq_ignore_ascii_case(&tail[tail.len() - n..])
        })
        .unwrap_or(0)
}
