//! OpenAI-compatible wire format
//!
//! Parses `/v1/chat/completions` request bodies into `ChatRequest` and turns
//! `StreamChunk`s into `chat.completion.chunk` objects, SSE lines, or a
//! single aggregated `chat.completion` body.

use crate::error::{BridgeError, Result};
use crate::tools::{ToolChoice, ToolSchema};
use crate::types::{
    ChatMessage, ChatRequest, ChunkKind, RequestId, Role, SamplingParams, StreamChunk,
    ToolCallMessage,
};
use serde_json::{json, Value};

/// Terminating SSE line
pub const SSE_DONE: &str = "data: [DONE]\n\n";

/// Parse a chat-completions request body
pub fn parse_request(body: &Value) -> Result<ChatRequest> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| BridgeError::Config("request has no model".to_string()))?
        .to_string();

    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| BridgeError::Config("request has no messages array".to_string()))?
        .iter()
        .map(parse_message)
        .collect::<Result<Vec<_>>>()?;

    let tools: ToolSchema = match body.get("tools") {
        None | Some(Value::Null) => ToolSchema::default(),
        Some(tools) => serde_json::from_value(tools.clone())?,
    };
    let tool_choice: ToolChoice = match body.get("tool_choice") {
        None | Some(Value::Null) => ToolChoice::default(),
        Some(choice) => serde_json::from_value(choice.clone())?,
    };

    Ok(ChatRequest {
        model,
        messages,
        sampling: parse_sampling(body),
        tools,
        tool_choice,
        stream: body.get("stream").and_then(Value::as_bool).unwrap_or(false),
    })
}

fn parse_message(value: &Value) -> Result<ChatMessage> {
    let role = match value.get("role").and_then(Value::as_str) {
        Some("system") | Some("developer") => Role::System,
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some("tool") | Some("function") => Role::Tool,
        other => {
            return Err(BridgeError::Config(format!(
                "unsupported message role {:?}",
                other
            )))
        }
    };

    let mut message = ChatMessage::new(role, content_text(value.get("content")));
    message.tool_call_id = value
        .get("tool_call_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(calls) = value.get("tool_calls").and_then(Value::as_array) {
        message.tool_calls = calls.iter().filter_map(parse_tool_call).collect();
    }
    Ok(message)
}

/// Plain string content, or the text parts of a content array
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                _ => part.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_tool_call(value: &Value) -> Option<ToolCallMessage> {
    let function = value.get("function")?;
    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) => raw.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };
    Some(ToolCallMessage {
        id: value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(crate::tools::new_call_id),
        name: function.get("name")?.as_str()?.to_string(),
        arguments,
        thought_signature: value
            .get("thought_signature")
            .or_else(|| value.get("thoughtSignature"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn parse_sampling(body: &Value) -> SamplingParams {
    let float = |key: &str| body.get(key).and_then(Value::as_f64).map(|v| v as f32);
    let stop = match body.get("stop") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    SamplingParams {
        temperature: float("temperature"),
        top_p: float("top_p"),
        max_output_tokens: body
            .get("max_completion_tokens")
            .or_else(|| body.get("max_tokens"))
            .and_then(Value::as_u64)
            .map(|v| v.min(u32::MAX as u64) as u32),
        stop,
        reasoning_effort: body
            .get("reasoning_effort")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Converts one request's chunks into `chat.completion.chunk` objects
pub struct ChunkFormatter {
    id: String,
    model: String,
    created: i64,
    tool_calls: usize,
}

impl ChunkFormatter {
    pub fn new(request_id: &RequestId, model: impl Into<String>) -> Self {
        Self {
            id: completion_id(request_id),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            tool_calls: 0,
        }
    }

    fn envelope(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }

    /// JSON object for a chunk
    pub fn format(&mut self, chunk: &StreamChunk) -> Value {
        match chunk.kind {
            ChunkKind::ContentDelta => self.envelope(
                json!({"role": "assistant", "content": chunk.payload}),
                None,
            ),
            ChunkKind::ReasoningDelta => self.envelope(
                json!({"role": "assistant", "reasoning_content": chunk.payload}),
                None,
            ),
            ChunkKind::ToolCallDelta => {
                let payload: Value =
                    serde_json::from_str(&chunk.payload).unwrap_or(Value::Null);
                if payload.get("type").and_then(Value::as_str) == Some("tool_error") {
                    let mut value = self.envelope(json!({}), None);
                    value["tool_error"] = payload;
                    value
                } else {
                    self.tool_calls += 1;
                    self.envelope(
                        json!({"role": "assistant", "tool_calls": [payload]}),
                        None,
                    )
                }
            }
            ChunkKind::Done => {
                let reason = if self.tool_calls > 0 { "tool_calls" } else { "stop" };
                let mut value = self.envelope(json!({}), Some(reason));
                if let Some(usage) = chunk.usage {
                    value["usage"] = json!({
                        "prompt_tokens": usage.prompt_tokens,
                        "completion_tokens": usage.completion_tokens,
                        "total_tokens": usage.total(),
                    });
                }
                value
            }
            ChunkKind::Error => json!({ "error": error_body(&chunk.payload) }),
        }
    }

    /// SSE frame(s) for a chunk; terminal chunks are followed by `[DONE]`
    pub fn sse(&mut self, chunk: &StreamChunk) -> String {
        let mut frame = format!("data: {}\n\n", self.format(chunk));
        if chunk.is_terminal() {
            frame.push_str(SSE_DONE);
        }
        frame
    }
}

fn completion_id(request_id: &RequestId) -> String {
    format!("chatcmpl-{}", request_id.as_str().trim_start_matches("req-"))
}

fn error_body(payload: &str) -> Value {
    let parsed: Value =
        serde_json::from_str(payload).unwrap_or_else(|_| json!({ "message": payload }));
    json!({
        "type": parsed.get("kind").cloned().unwrap_or_else(|| json!("execution_failed")),
        "message": parsed.get("message").cloned().unwrap_or_else(|| json!(payload)),
    })
}

/// Aggregate a finished stream into a non-streaming `chat.completion` body
///
/// A stream that ended in an `Error` chunk yields `{"error": {...}}`.
pub fn collect_completion(request_id: &RequestId, model: &str, chunks: &[StreamChunk]) -> Value {
    if let Some(error) = chunks.iter().find(|c| c.kind == ChunkKind::Error) {
        return json!({ "error": error_body(&error.payload) });
    }

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    let mut tool_error = None;
    let mut usage = None;

    for chunk in chunks {
        match chunk.kind {
            ChunkKind::ContentDelta => content.push_str(&chunk.payload),
            ChunkKind::ReasoningDelta => reasoning.push_str(&chunk.payload),
            ChunkKind::ToolCallDelta => {
                let mut payload: Value =
                    serde_json::from_str(&chunk.payload).unwrap_or(Value::Null);
                if payload.get("type").and_then(Value::as_str) == Some("tool_error") {
                    tool_error = Some(payload);
                } else {
                    if let Some(map) = payload.as_object_mut() {
                        map.remove("index");
                    }
                    tool_calls.push(payload);
                }
            }
            ChunkKind::Done => usage = chunk.usage,
            ChunkKind::Error => {}
        }
    }

    let content = if content.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        Value::String(content)
    };
    let mut message = json!({
        "role": "assistant",
        "content": content,
    });
    if !reasoning.is_empty() {
        message["reasoning_content"] = Value::String(reasoning);
    }
    let finish_reason = if tool_calls.is_empty() { "stop" } else { "tool_calls" };
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    let mut body = json!({
        "id": completion_id(request_id),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = usage {
        body["usage"] = json!({
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total(),
        });
    }
    if let Some(error) = tool_error {
        body["tool_error"] = error;
    }
    body
}
