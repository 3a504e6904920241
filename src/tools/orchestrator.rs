//! Function-calling strategy selection and execution
//!
//! ## Modes
//!
//! - `native`: declarations go through the remote service's own tool
//!   surface; UI failures are retried and then reported as errors.
//! - `emulated`: a text catalog is injected and calls are parsed back out of
//!   the model's text.
//! - `auto`: native first; on failure, emulated for the rest of the
//!   conversation. The fallback is recorded in the invocation cache so later
//!   requests with the same schema never probe native again. There is no
//!   transition from emulated back to native.
//!
//! The strategy for a turn is an explicit field of `InvocationPlan`, never
//! inferred from control flow.

use super::cache::{CompatibilityFlags, ToolInvocationCache, ToolInvocationCacheEntry};
use super::emulated::{self, partial_marker_len};
use super::schema::{to_declarations, TypeCase};
use super::{Fingerprint, ToolCall, ToolCallResult, ToolChoice, ToolError, ToolSchema};
use crate::boundary::{ExecutionBoundary, NativeToolError, SessionHandle, TurnTools};
use crate::config::ToolsConfig;
use crate::error::{BridgeError, Result};
use crate::types::{ChatMessage, ChunkKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const NATIVE_RETRY_DELAY: Duration = Duration::from_millis(500);
const RAW_EXCERPT_LEN: usize = 500;

/// Configured function-calling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionCallingMode {
    Native,
    #[default]
    Emulated,
    Auto,
}

impl std::str::FromStr for FunctionCallingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(FunctionCallingMode::Native),
            "emulated" => Ok(FunctionCallingMode::Emulated),
            "auto" => Ok(FunctionCallingMode::Auto),
            other => Err(format!("unknown function calling mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for FunctionCallingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FunctionCallingMode::Native => "native",
            FunctionCallingMode::Emulated => "emulated",
            FunctionCallingMode::Auto => "auto",
        };
        f.write_str(s)
    }
}

/// Strategy actually used for a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStrategy {
    Native,
    Emulated,
}

impl std::fmt::Display for InvocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationStrategy::Native => f.write_str("native"),
            InvocationStrategy::Emulated => f.write_str("emulated"),
        }
    }
}

/// Resolved tool plan for one request
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationPlan {
    pub fingerprint: Fingerprint,
    /// `None` when the turn carries no tools
    pub strategy: Option<InvocationStrategy>,
    pub mode: FunctionCallingMode,
    pub choice: ToolChoice,
    /// Strategy came from the invocation cache
    pub cached: bool,
    /// Native was attempted and abandoned for this plan
    pub fell_back: bool,
    pub native_error: Option<String>,
    flags: CompatibilityFlags,
    schema: ToolSchema,
    model: String,
}

impl InvocationPlan {
    pub fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    pub fn has_tools(&self) -> bool {
        self.strategy.is_some()
    }
}

/// Model output of a finished turn, as seen by the orchestrator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnTranscript {
    pub content: String,
    /// Raw native call payloads from `ToolCallDelta` chunks
    pub native_calls: Vec<Value>,
}

/// Result of `execute`
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Completed(ToolCallResult),
    /// Native output was unusable under `auto`; emulated from now on
    Fallback { reason: String },
}

pub struct FunctionCallingOrchestrator {
    config: ToolsConfig,
    cache: Arc<ToolInvocationCache>,
}

impl FunctionCallingOrchestrator {
    pub fn new(config: ToolsConfig) -> Self {
        let cache = Arc::new(ToolInvocationCache::new(
            config.cache_enabled,
            config.cache_ttl_secs,
        ));
        Self { config, cache }
    }

    pub fn mode(&self) -> FunctionCallingMode {
        self.config.mode
    }

    pub fn cache(&self) -> &Arc<ToolInvocationCache> {
        &self.cache
    }

    fn type_case(&self) -> TypeCase {
        TypeCase::from_uppercase_flag(self.config.uppercase_types)
    }

    /// Choose a strategy for a request's tool schema
    pub fn prepare(&self, schema: &ToolSchema, choice: &ToolChoice, model: &str) -> InvocationPlan {
        let fingerprint = schema.fingerprint();
        let mut plan = InvocationPlan {
            fingerprint: fingerprint.clone(),
            strategy: None,
            mode: self.config.mode,
            choice: choice.clone(),
            cached: false,
            fell_back: false,
            native_error: None,
            flags: CompatibilityFlags::default(),
            schema: schema.clone(),
            model: model.to_string(),
        };
        if schema.is_empty() || *choice == ToolChoice::None {
            return plan;
        }

        if let Some(entry) = self.cache.lookup(&fingerprint, model) {
            plan.strategy = Some(entry.strategy);
            plan.cached = true;
            plan.fell_back = entry.flags.fell_back;
            plan.flags = entry.flags;
        } else {
            plan.strategy = Some(match self.config.mode {
                FunctionCallingMode::Emulated => InvocationStrategy::Emulated,
                FunctionCallingMode::Native | FunctionCallingMode::Auto => {
                    InvocationStrategy::Native
                }
            });
        }

        tracing::debug!(
            fingerprint = %fingerprint,
            tools = schema.len(),
            strategy = ?plan.strategy,
            cached = plan.cached,
            "Tool plan prepared"
        );
        plan
    }

    /// Configure the session for the plan's strategy
    ///
    /// Native declarations are retried on UI failures. Under `auto` a final
    /// failure switches the plan to emulated and overwrites the cache entry;
    /// under `native` it is returned as `ToolInvocation`.
    pub async fn activate(
        &self,
        plan: &mut InvocationPlan,
        boundary: &dyn ExecutionBoundary,
        session: &SessionHandle,
    ) -> Result<()> {
        match plan.strategy {
            Some(InvocationStrategy::Native) => {}
            Some(InvocationStrategy::Emulated) | None => return Ok(()),
        }
        if self.cache.is_declared(&plan.fingerprint) {
            tracing::debug!(
                fingerprint = %plan.fingerprint,
                "Native declarations already set"
            );
            return Ok(());
        }

        let declarations = to_declarations(&plan.schema, self.type_case());
        let attempts = self.config.native_retries.max(1);
        let ui_timeout = Duration::from_millis(self.config.ui_timeout_ms);
        let mut last_error: Option<NativeToolError> = None;

        for attempt in 1..=attempts {
            let outcome = match tokio::time::timeout(
                ui_timeout,
                boundary.configure_native_tools(session, &declarations),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(NativeToolError::Timeout(format!(
                    "no response within {}ms",
                    self.config.ui_timeout_ms
                ))),
            };

            match outcome {
                Ok(()) => {
                    plan.flags = CompatibilityFlags {
                        toggle_enabled: true,
                        declarations_set: true,
                        fell_back: false,
                    };
                    self.cache.record(
                        plan.fingerprint.clone(),
                        ToolInvocationCacheEntry::new(InvocationStrategy::Native, plan.flags)
                            .with_model(&plan.model),
                    );
                    self.cache.set_declared(Some(plan.fingerprint.clone()));
                    tracing::info!(
                        fingerprint = %plan.fingerprint,
                        attempt,
                        "Native tool declarations configured"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "Native tool setup failed");
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                    if attempt < attempts {
                        tokio::time::sleep(NATIVE_RETRY_DELAY).await;
                    }
                }
            }
        }

        // The panel may be half-configured now
        self.cache.set_declared(None);
        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "native tool setup failed".to_string());

        if self.config.mode == FunctionCallingMode::Auto {
            self.fall_back(plan, &reason);
            Ok(())
        } else {
            Err(BridgeError::ToolInvocation {
                mode: InvocationStrategy::Native,
                fallback_attempted: false,
                reason,
            })
        }
    }

    fn fall_back(&self, plan: &mut InvocationPlan, reason: &str) {
        plan.strategy = Some(InvocationStrategy::Emulated);
        plan.fell_back = true;
        plan.native_error = Some(reason.to_string());
        plan.flags = CompatibilityFlags {
            fell_back: true,
            ..Default::default()
        };
        self.cache.record(
            plan.fingerprint.clone(),
            ToolInvocationCacheEntry::new(InvocationStrategy::Emulated, plan.flags)
                .with_model(&plan.model),
        );
        tracing::info!(
            fingerprint = %plan.fingerprint,
            reason,
            "Falling back to emulated tool calling"
        );
    }

    /// Messages as the execution boundary should see them
    pub fn render_messages(
        &self,
        plan: &InvocationPlan,
        messages: &[ChatMessage],
    ) -> Vec<ChatMessage> {
        let mut rendered = match plan.strategy {
            Some(InvocationStrategy::Emulated) => {
                let mut out = Vec::with_capacity(messages.len() + 1);
                if let Some(catalog) = emulated::render_catalog(&plan.schema, &plan.choice) {
                    out.push(ChatMessage::system(catalog));
                }
                out.extend(emulated::visualize_history(messages));
                out
            }
            _ => messages.to_vec(),
        };

        if !self.config.propagate_thought_signature {
            for message in rendered.iter_mut() {
                for call in message.tool_calls.iter_mut() {
                    call.thought_signature = None;
                }
            }
        }
        rendered
    }

    /// Tool section of the turn sent to the boundary
    pub fn turn_tools(&self, plan: &InvocationPlan) -> Option<TurnTools> {
        let strategy = plan.strategy?;
        Some(TurnTools {
            strategy,
            declarations: (strategy == InvocationStrategy::Native)
                .then(|| to_declarations(&plan.schema, self.type_case())),
        })
    }

    /// Interpret a finished turn
    pub fn execute(&self, plan: &InvocationPlan, turn: &TurnTranscript) -> Execution {
        match plan.strategy {
            None => Execution::Completed(ToolCallResult::NoCall),
            Some(InvocationStrategy::Emulated) => {
                let result = self.parse_emulated(plan, &turn.content);
                if matches!(result, ToolCallResult::Calls(_)) {
                    self.cache.mark_success(&plan.fingerprint);
                }
                Execution::Completed(result)
            }
            Some(InvocationStrategy::Native) => match self.parse_native(plan, &turn.native_calls) {
                Ok(calls) if !calls.is_empty() => {
                    self.cache.mark_success(&plan.fingerprint);
                    Execution::Completed(ToolCallResult::Calls(calls))
                }
                // Model wrote a call as text despite native declarations
                Ok(_) if emulated::find_marker(&turn.content).is_some() => {
                    Execution::Completed(self.parse_emulated(plan, &turn.content))
                }
                Ok(_) => Execution::Completed(ToolCallResult::NoCall),
                Err(reason) if plan.mode == FunctionCallingMode::Auto => {
                    let mut fallback = plan.clone();
                    self.fall_back(&mut fallback, &reason);
                    Execution::Fallback { reason }
                }
                Err(reason) => Execution::Completed(ToolCallResult::Error(ToolError {
                    mode: InvocationStrategy::Native,
                    message: reason,
                    raw: None,
                })),
            },
        }
    }

    /// Streaming filter for one turn
    pub fn interceptor(self: &Arc<Self>, plan: InvocationPlan) -> TurnInterceptor {
        TurnInterceptor {
            orchestrator: self.clone(),
            plan,
            transcript: TurnTranscript::default(),
            emitted: 0,
            holding: false,
            result: None,
        }
    }

    fn parse_emulated(&self, plan: &InvocationPlan, content: &str) -> ToolCallResult {
        let parsed = emulated::parse_calls(content, &plan.schema);
        if !parsed.calls.is_empty() {
            if !parsed.errors.is_empty() {
                tracing::warn!(
                    dropped = parsed.errors.len(),
                    kept = parsed.calls.len(),
                    "Dropped unparseable emulated calls"
                );
            }
            return ToolCallResult::Calls(parsed.calls);
        }
        if parsed.errors.is_empty() {
            return ToolCallResult::NoCall;
        }

        let raw = emulated::find_marker(content)
            .map(|start| content[start..].chars().take(RAW_EXCERPT_LEN).collect());
        tracing::warn!(errors = ?parsed.errors, "Emulated tool call could not be parsed");
        ToolCallResult::Error(ToolError {
            mode: InvocationStrategy::Emulated,
            message: parsed.errors.join("; "),
            raw,
        })
    }

    fn parse_native(
        &self,
        plan: &InvocationPlan,
        payloads: &[Value],
    ) -> std::result::Result<Vec<ToolCall>, String> {
        let mut calls: Vec<ToolCall> = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let function = payload.get("function").unwrap_or(payload);
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .map(emulated::clean_function_name)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| format!("native call without a name: {}", payload))?;
            if !plan.schema.is_empty() && plan.schema.get(&name).is_none() {
                return Err(format!("native call to undeclared function '{}'", name));
            }

            let arguments = match function.get("arguments").or_else(|| function.get("args")) {
                None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
                Some(Value::String(raw)) => {
                    serde_json::from_str(&emulated::strip_control_tokens(raw))
                        .map_err(|e| format!("invalid arguments for '{}': {}", name, e))?
                }
                Some(other) => other.clone(),
            };
            if !arguments.is_object() {
                return Err(format!("arguments for '{}' are not an object", name));
            }

            let signature = payload
                .get("thoughtSignature")
                .or_else(|| payload.get("thought_signature"))
                .and_then(Value::as_str)
                .filter(|_| self.config.propagate_thought_signature)
                .map(str::to_string);

            let mut call = ToolCall::new(name, arguments).with_thought_signature(signature);
            if let Some(id) = payload.get("id").and_then(Value::as_str) {
                call.id = id.to_string();
            }
            if !calls
                .iter()
                .any(|c| c.name == call.name && c.arguments == call.arguments)
            {
                calls.push(call);
            }
        }
        Ok(calls)
    }
}

/// Per-turn stream filter
///
/// Content is forwarded as it arrives, except that emulated call text is
/// held back: once a call marker appears nothing after it is forwarded, and
/// a trailing fragment that could begin a marker waits for the next chunk.
/// Native call payloads are collected. `finish` emits the resolved tool
/// calls (or a structured tool error) as `ToolCallDelta` chunks.
pub struct TurnInterceptor {
    orchestrator: Arc<FunctionCallingOrchestrator>,
    plan: InvocationPlan,
    transcript: TurnTranscript,
    emitted: usize,
    holding: bool,
    result: Option<ToolCallResult>,
}

impl TurnInterceptor {
    pub fn plan(&self) -> &InvocationPlan {
        &self.plan
    }

    /// Resolved outcome, available after `finish`
    pub fn result(&self) -> Option<&ToolCallResult> {
        self.result.as_ref()
    }

    /// Full content text seen so far
    pub fn content(&self) -> &str {
        &self.transcript.content
    }

    /// Transform one non-terminal chunk into zero or more chunks to forward
    pub fn on_chunk(&mut self, kind: ChunkKind, payload: String) -> Vec<(ChunkKind, String)> {
        match kind {
            ChunkKind::ContentDelta => {
                self.transcript.content.push_str(&payload);
                if !self.plan.has_tools() {
                    self.emitted = self.transcript.content.len();
                    return vec![(kind, payload)];
                }
                self.release_content()
            }
            ChunkKind::ToolCallDelta => {
                match serde_json::from_str::<Value>(&payload) {
                    Ok(Value::Array(items)) => self.transcript.native_calls.extend(items),
                    Ok(value) => self.transcript.native_calls.push(value),
                    Err(e) => {
                        tracing::warn!(error = %e, "Discarding malformed native call payload");
                        self.transcript
                            .native_calls
                            .push(Value::String(payload));
                    }
                }
                Vec::new()
            }
            _ => vec![(kind, payload)],
        }
    }

    fn release_content(&mut self) -> Vec<(ChunkKind, String)> {
        if self.holding {
            return Vec::new();
        }
        let content = &self.transcript.content;
        let end = match emulated::find_marker(content) {
            Some(start) => {
                self.holding = true;
                start
            }
            None => {
                let trimmed = content.trim_end();
                trimmed.len() - partial_marker_len(trimmed)
            }
        };
        if end <= self.emitted {
            return Vec::new();
        }
        let fragment = content[self.emitted..end].to_string();
        self.emitted = end;
        vec![(ChunkKind::ContentDelta, fragment)]
    }

    /// Flush held content and emit the turn's tool outcome
    pub fn finish(&mut self) -> Vec<(ChunkKind, String)> {
        let mut out = Vec::new();
        if !self.plan.has_tools() {
            self.result = Some(ToolCallResult::NoCall);
            return out;
        }

        let result = match self.orchestrator.execute(&self.plan, &self.transcript) {
            Execution::Completed(result) => result,
            Execution::Fallback { reason } => {
                tracing::info!(reason = %reason, "Native output unusable; reading emulated text");
                self.orchestrator
                    .parse_emulated(&self.plan, &self.transcript.content)
            }
        };

        if !self.holding && self.emitted < self.transcript.content.len() {
            let rest = self.transcript.content[self.emitted..].to_string();
            self.emitted = self.transcript.content.len();
            out.push((ChunkKind::ContentDelta, rest));
        }

        match &result {
            ToolCallResult::Calls(calls) => {
                for (index, call) in calls.iter().enumerate() {
                    out.push((ChunkKind::ToolCallDelta, call_payload(index, call)));
                }
            }
            ToolCallResult::Error(error) => {
                let mut payload = serde_json::json!({
                    "type": "tool_error",
                    "mode": error.mode,
                    "message": error.message,
                });
                if let Some(raw) = &error.raw {
                    payload["raw"] = Value::String(raw.clone());
                }
                out.push((ChunkKind::ToolCallDelta, payload.to_string()));
            }
            ToolCallResult::NoCall => {}
        }
        self.result = Some(result);
        out
    }
}

/// OpenAI-style tool call delta payload
fn call_payload(index: usize, call: &ToolCall) -> String {
    let mut payload = serde_json::json!({
        "index": index,
        "id": call.id,
        "type": "function",
        "function": {
            "name": call.name,
            "arguments": call.arguments.to_string(),
        },
    });
    if let Some(signature) = &call.thought_signature {
        payload["thoughtSignature"] = Value::String(signature.clone());
    }
    payload.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{ChunkProducer, TurnRequest};
    use crate::credential::CredentialProfile;
    use crate::tools::ToolDefinition;
    use crate::types::ToolCallMessage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Boundary whose native tool surface fails a fixed number of times
    struct NativeSurface {
        failures: usize,
        error: NativeToolError,
        calls: AtomicUsize,
        /// First declared function name currently loaded in the panel
        loaded: std::sync::Mutex<Option<String>>,
    }

    impl NativeSurface {
        fn failing(failures: usize, error: NativeToolError) -> Self {
            Self {
                failures,
                error,
                calls: AtomicUsize::new(0),
                loaded: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl ExecutionBoundary for NativeSurface {
        async fn activate_profile(&self, profile: &CredentialProfile) -> Result<SessionHandle> {
            Ok(SessionHandle::new(&profile.id, 1))
        }

        async fn start_turn(&self, _turn: TurnRequest) -> Result<ChunkProducer> {
            Err(BridgeError::Execution("not used".into()))
        }

        async fn interrupt(&self, _session: &SessionHandle) -> Result<()> {
            Ok(())
        }

        async fn is_session_healthy(&self, _session: &SessionHandle) -> bool {
            true
        }

        async fn configure_native_tools(
            &self,
            _session: &SessionHandle,
            declarations: &Value,
        ) -> std::result::Result<(), NativeToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            *self.loaded.lock().unwrap() = declarations[0]["name"].as_str().map(str::to_string);
            Ok(())
        }
    }

    fn schema() -> ToolSchema {
        ToolSchema::new(vec![ToolDefinition::new(
            "get_weather",
            json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        )])
    }

    fn orchestrator(mode: FunctionCallingMode) -> Arc<FunctionCallingOrchestrator> {
        Arc::new(FunctionCallingOrchestrator::new(ToolsConfig {
            mode,
            ..Default::default()
        }))
    }

    fn session() -> SessionHandle {
        SessionHandle::new("alpha", 1)
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "AUTO".parse::<FunctionCallingMode>().unwrap(),
            FunctionCallingMode::Auto
        );
        assert!("sometimes".parse::<FunctionCallingMode>().is_err());
        assert_eq!(FunctionCallingMode::Native.to_string(), "native");
    }

    #[test]
    fn test_no_tools_plan() {
        let orch = orchestrator(FunctionCallingMode::Auto);
        let plan = orch.prepare(&ToolSchema::default(), &ToolChoice::Auto, "m");
        assert!(!plan.has_tools());
        assert!(orch.turn_tools(&plan).is_none());

        let plan = orch.prepare(&schema(), &ToolChoice::None, "m");
        assert!(!plan.has_tools());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_falls_back_and_caches() {
        let orch = orchestrator(FunctionCallingMode::Auto);
        let boundary = NativeSurface::failing(
            usize::MAX,
            NativeToolError::ElementNotFound("toggle".into()),
        );

        let mut plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        assert_eq!(plan.strategy, Some(InvocationStrategy::Native));
        orch.activate(&mut plan, &boundary, &session()).await.unwrap();

        assert_eq!(plan.strategy, Some(InvocationStrategy::Emulated));
        assert!(plan.fell_back);
        assert_eq!(boundary.calls.load(Ordering::SeqCst), 2);

        // Same fingerprint: straight to emulated, no native probing
        let mut next = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        assert!(next.cached);
        assert_eq!(next.strategy, Some(InvocationStrategy::Emulated));
        orch.activate(&mut next, &boundary, &session()).await.unwrap();
        assert_eq!(boundary.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_retries_then_succeeds() {
        let orch = orchestrator(FunctionCallingMode::Native);
        let boundary = NativeSurface::failing(1, NativeToolError::Timeout("panel".into()));

        let mut plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        orch.activate(&mut plan, &boundary, &session()).await.unwrap();
        assert_eq!(plan.strategy, Some(InvocationStrategy::Native));
        assert_eq!(boundary.calls.load(Ordering::SeqCst), 2);

        // Declarations are cached for the session
        let mut again = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        orch.activate(&mut again, &boundary, &session()).await.unwrap();
        assert_eq!(boundary.calls.load(Ordering::SeqCst), 2);

        let tools = orch.turn_tools(&again).unwrap();
        assert_eq!(tools.declarations.unwrap()[0]["name"], "get_weather");
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_schemas_redeclares() {
        let orch = orchestrator(FunctionCallingMode::Native);
        let boundary = NativeSurface::failing(0, NativeToolError::Timeout("panel".into()));
        let named = |name: &str| {
            ToolSchema::new(vec![ToolDefinition::new(name, json!({"type": "object"}))])
        };

        for name in ["tool_a", "tool_b", "tool_a"] {
            let mut plan = orch.prepare(&named(name), &ToolChoice::Auto, "m");
            orch.activate(&mut plan, &boundary, &session()).await.unwrap();
            assert_eq!(boundary.loaded.lock().unwrap().as_deref(), Some(name));
        }
        assert_eq!(boundary.calls.load(Ordering::SeqCst), 3);

        // Same set again: already in the panel
        let mut plan = orch.prepare(&named("tool_a"), &ToolChoice::Auto, "m");
        orch.activate(&mut plan, &boundary, &session()).await.unwrap();
        assert_eq!(boundary.calls.load(Ordering::SeqCst), 3);

        // A replaced session starts with an empty panel
        orch.cache().invalidate_all("session replaced");
        let mut plan = orch.prepare(&named("tool_a"), &ToolChoice::Auto, "m");
        orch.activate(&mut plan, &boundary, &session()).await.unwrap();
        assert_eq!(boundary.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_native_mode_reports_failure() {
        let orch = orchestrator(FunctionCallingMode::Native);
        let boundary = NativeSurface::failing(
            usize::MAX,
            NativeToolError::Unsupported("model".into()),
        );

        let mut plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        let err = orch
            .activate(&mut plan, &boundary, &session())
            .await
            .unwrap_err();
        match err {
            BridgeError::ToolInvocation {
                mode,
                fallback_attempted,
                ..
            } => {
                assert_eq!(mode, InvocationStrategy::Native);
                assert!(!fallback_attempted);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Unsupported is not retried
        assert_eq!(boundary.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emulated_render() {
        let orch = orchestrator(FunctionCallingMode::Emulated);
        let plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("weather?"),
        ];
        let rendered = orch.render_messages(&plan, &messages);
        assert_eq!(rendered.len(), 3);
        assert!(rendered[0].content.starts_with("Available Tools Catalog:"));
        assert_eq!(rendered[1], messages[0]);
    }

    #[test]
    fn test_thought_signature_stripped_when_disabled() {
        let orch = Arc::new(FunctionCallingOrchestrator::new(ToolsConfig {
            mode: FunctionCallingMode::Native,
            propagate_thought_signature: false,
            ..Default::default()
        }));
        let plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        let history = vec![ChatMessage::assistant("").with_tool_calls(vec![ToolCallMessage {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: "{}".into(),
            thought_signature: Some("sig".into()),
        }])];
        let rendered = orch.render_messages(&plan, &history);
        assert!(rendered[0].tool_calls[0].thought_signature.is_none());

        let keep = orchestrator(FunctionCallingMode::Native);
        let rendered = keep.render_messages(&plan, &history);
        assert_eq!(
            rendered[0].tool_calls[0].thought_signature.as_deref(),
            Some("sig")
        );
    }

    #[test]
    fn test_interceptor_holds_back_call_text() {
        let orch = orchestrator(FunctionCallingMode::Emulated);
        let plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        let mut interceptor = orch.interceptor(plan);

        let mut forwarded = String::new();
        for piece in [
            "Checking. Req",
            "uest function call: get_",
            "weather\nParameters:\n{\"city\": \"Oslo\"}",
        ] {
            let out = interceptor.on_chunk(ChunkKind::ContentDelta, piece.to_string());
            for (kind, payload) in out {
                assert_eq!(kind, ChunkKind::ContentDelta);
                forwarded.push_str(&payload);
            }
        }
        assert_eq!(forwarded, "Checking. ");

        let tail = interceptor.finish();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].0, ChunkKind::ToolCallDelta);
        let payload: Value = serde_json::from_str(&tail[0].1).unwrap();
        assert_eq!(payload["function"]["name"], "get_weather");
        assert_eq!(payload["function"]["arguments"], r#"{"city":"Oslo"}"#);
        assert!(matches!(interceptor.result(), Some(ToolCallResult::Calls(c)) if c.len() == 1));
    }

    #[test]
    fn test_interceptor_holds_lowercase_split_marker() {
        let orch = orchestrator(FunctionCallingMode::Emulated);
        let plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        let mut interceptor = orch.interceptor(plan);

        let mut forwarded = String::new();
        for piece in [
            "Sure. request func",
            "tion call: get_weather\nParameters:\n{\"city\": \"Lima\"}",
        ] {
            let out = interceptor.on_chunk(ChunkKind::ContentDelta, piece.to_string());
            for (_, payload) in out {
                forwarded.push_str(&payload);
            }
        }
        assert_eq!(forwarded, "Sure. ");
        assert_eq!(interceptor.finish()[0].0, ChunkKind::ToolCallDelta);
    }

    #[test]
    fn test_interceptor_flushes_plain_text() {
        let orch = orchestrator(FunctionCallingMode::Emulated);
        let plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        let mut interceptor = orch.interceptor(plan);

        let first = interceptor.on_chunk(ChunkKind::ContentDelta, "It is sunny. Re".into());
        assert_eq!(first[0].1, "It is sunny. ");
        let tail = interceptor.finish();
        assert_eq!(tail, vec![(ChunkKind::ContentDelta, "Re".to_string())]);
        assert_eq!(interceptor.result(), Some(&ToolCallResult::NoCall));
    }

    #[test]
    fn test_emulated_parse_failure_is_structured() {
        let orch = orchestrator(FunctionCallingMode::Emulated);
        let plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        let mut interceptor = orch.interceptor(plan);
        interceptor.on_chunk(
            ChunkKind::ContentDelta,
            "Request function call: get_weather\nParameters:\n{\"city\": ".into(),
        );
        let tail = interceptor.finish();
        let payload: Value = serde_json::from_str(&tail[0].1).unwrap();
        assert_eq!(payload["type"], "tool_error");
        assert_eq!(payload["mode"], "emulated");
        assert!(matches!(interceptor.result(), Some(ToolCallResult::Error(_))));
    }

    #[test]
    fn test_native_calls_collected() {
        let orch = orchestrator(FunctionCallingMode::Native);
        let plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        let mut interceptor = orch.interceptor(plan);
        let forwarded = interceptor.on_chunk(
            ChunkKind::ToolCallDelta,
            json!({
                "name": "default_api:get_weather",
                "arguments": "{\"city\": \"Lima\"}",
                "thoughtSignature": "sig-9"
            })
            .to_string(),
        );
        assert!(forwarded.is_empty());

        let tail = interceptor.finish();
        let payload: Value = serde_json::from_str(&tail[0].1).unwrap();
        assert_eq!(payload["function"]["name"], "get_weather");
        assert_eq!(payload["thoughtSignature"], "sig-9");
    }

    #[test]
    fn test_auto_native_garbage_falls_back() {
        let orch = orchestrator(FunctionCallingMode::Auto);
        let plan = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        let turn = TurnTranscript {
            content: String::new(),
            native_calls: vec![json!({"arguments": {}})],
        };
        assert!(matches!(orch.execute(&plan, &turn), Execution::Fallback { .. }));

        let next = orch.prepare(&schema(), &ToolChoice::Auto, "m");
        assert_eq!(next.strategy, Some(InvocationStrategy::Emulated));
        assert!(next.cached);
    }

    #[test]
    fn test_no_tool_plan_passes_content_through() {
        let orch = orchestrator(FunctionCallingMode::Emulated);
        let plan = orch.prepare(&ToolSchema::default(), &ToolChoice::Auto, "m");
        let mut interceptor = orch.interceptor(plan);
        let out = interceptor.on_chunk(ChunkKind::ContentDelta, "Request function call: x".into());
        assert_eq!(out.len(), 1);
        assert!(interceptor.finish().is_empty());
    }
}
