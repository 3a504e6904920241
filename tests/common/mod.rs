//! Scripted collaborators shared by the integration tests
#![allow(dead_code)]

use a3s_bridge::boundary::ChunkProducer;
use a3s_bridge::{
    Bridge, BridgeConfig, ChunkKind, CredentialProfile, ExecutionBoundary, MemoryCredentialStore,
    NativeToolError, PathChunk, PathError, PathErrorKind, PathEvent, RelaySource, RequestId,
    SessionHandle, StreamChunk, TokenUsage, TurnRequest,
};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a producing path does for one turn
#[derive(Debug, Clone)]
pub enum Step {
    Text(&'static str),
    Reasoning(&'static str),
    /// Native tool-call payload (JSON)
    ToolCall(&'static str),
    Done(Option<u64>),
    Fail(PathErrorKind, &'static str),
    Pause(u64),
}

/// A turn script: steps separated by `step_ms`, then either close or hold
#[derive(Debug, Clone)]
pub struct Script {
    pub steps: Vec<Step>,
    pub step_ms: u64,
    pub hold_open: bool,
}

impl Script {
    /// Text fragments followed by `Done` reporting `tokens` completion tokens
    pub fn reply(parts: &[&'static str], tokens: u64) -> Self {
        let mut steps: Vec<Step> = parts.iter().map(|p| Step::Text(*p)).collect();
        steps.push(Step::Done(Some(tokens)));
        Self {
            steps,
            step_ms: 10,
            hold_open: false,
        }
    }

    pub fn steps(steps: Vec<Step>) -> Self {
        Self {
            steps,
            step_ms: 10,
            hold_open: false,
        }
    }

    /// Produces nothing and keeps the channel open until interrupted
    pub fn stall() -> Self {
        Self {
            steps: Vec::new(),
            step_ms: 10,
            hold_open: true,
        }
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn step_ms(mut self, step_ms: u64) -> Self {
        self.step_ms = step_ms;
        self
    }
}

/// Feed a script into a path channel, stopping early on `stop`
async fn play(script: Script, tx: mpsc::Sender<PathEvent>, stop: CancellationToken) {
    let mut seq = 0;
    for step in script.steps {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(script.step_ms)) => {}
        }
        let event = match step {
            Step::Text(text) => {
                seq += 1;
                PathEvent::Chunk(PathChunk::new(seq, ChunkKind::ContentDelta, text))
            }
            Step::Reasoning(text) => {
                seq += 1;
                PathEvent::Chunk(PathChunk::new(seq, ChunkKind::ReasoningDelta, text))
            }
            Step::ToolCall(payload) => {
                seq += 1;
                PathEvent::Chunk(PathChunk::new(seq, ChunkKind::ToolCallDelta, payload))
            }
            Step::Done(tokens) => {
                seq += 1;
                let chunk = PathChunk::done(seq);
                PathEvent::Chunk(match tokens {
                    Some(completion_tokens) => chunk.with_usage(TokenUsage {
                        prompt_tokens: 0,
                        completion_tokens,
                    }),
                    None => chunk,
                })
            }
            Step::Fail(kind, message) => PathEvent::Error(PathError::new(kind, message)),
            Step::Pause(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                continue;
            }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
    if script.hold_open {
        stop.cancelled().await;
    }
}

/// Execution boundary driven by per-turn scripts
///
/// Turns pop scripts in order; when the list is empty `fallback` is used.
pub struct ScriptedBoundary {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    unhealthy: Mutex<HashSet<String>>,
    native: Mutex<VecDeque<Result<(), NativeToolError>>>,
    current: Mutex<Option<CancellationToken>>,
    in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
    pub turns: Mutex<Vec<TurnRequest>>,
    pub activations: Mutex<Vec<String>>,
    pub interrupts: AtomicUsize,
    pub native_calls: AtomicUsize,
    pub snapshots: AtomicUsize,
}

impl ScriptedBoundary {
    pub fn new(fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            unhealthy: Mutex::new(HashSet::new()),
            native: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            turns: Mutex::new(Vec::new()),
            activations: Mutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
            native_calls: AtomicUsize::new(0),
            snapshots: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, script: Script) -> &Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }

    pub fn mark_unhealthy(&self, profile_id: &str) {
        self.unhealthy.lock().unwrap().insert(profile_id.to_string());
    }

    /// Queue outcomes for successive native-tool configuration attempts
    pub fn native_outcomes(&self, outcomes: Vec<Result<(), NativeToolError>>) {
        self.native.lock().unwrap().extend(outcomes);
    }

    pub fn turn_count(&self) -> usize {
        self.turns.lock().unwrap().len()
    }

    /// Profile each turn ran on, in order
    pub fn turn_profiles(&self) -> Vec<String> {
        self.turns
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.session.profile_id.clone())
            .collect()
    }

    /// Last user message of each turn, in order
    pub fn turn_prompts(&self) -> Vec<String> {
        self.turns
            .lock()
            .unwrap()
            .iter()
            .filter_map(|t| t.messages.last().map(|m| m.content.clone()))
            .collect()
    }
}

#[async_trait]
impl ExecutionBoundary for ScriptedBoundary {
    async fn activate_profile(
        &self,
        profile: &CredentialProfile,
    ) -> a3s_bridge::Result<SessionHandle> {
        let mut activations = self.activations.lock().unwrap();
        activations.push(profile.id.clone());
        Ok(SessionHandle::new(&profile.id, activations.len() as u64))
    }

    async fn start_turn(&self, turn: TurnRequest) -> a3s_bridge::Result<ChunkProducer> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.turns.lock().unwrap().push(turn);

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let stop = CancellationToken::new();
        *self.current.lock().unwrap() = Some(stop.clone());

        let (tx, rx) = mpsc::channel(4);
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let guard = InFlight(in_flight);
            play(script, tx, stop).await;
            drop(guard);
        });
        Ok(rx)
    }

    async fn interrupt(&self, _session: &SessionHandle) -> a3s_bridge::Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if let Some(stop) = self.current.lock().unwrap().take() {
            stop.cancel();
        }
        Ok(())
    }

    async fn is_session_healthy(&self, session: &SessionHandle) -> bool {
        !self.unhealthy.lock().unwrap().contains(&session.profile_id)
    }

    async fn configure_native_tools(
        &self,
        _session: &SessionHandle,
        _declarations: &serde_json::Value,
    ) -> Result<(), NativeToolError> {
        self.native_calls.fetch_add(1, Ordering::SeqCst);
        self.native
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(NativeToolError::ElementNotFound("tools panel".into())))
    }

    async fn snapshot_session(
        &self,
        session: &SessionHandle,
    ) -> a3s_bridge::Result<Option<serde_json::Value>> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(Some(serde_json::json!({ "cookies": [session.profile_id] })))
    }
}

/// Decrements the in-flight counter when the producer finishes
///
/// A turn stays counted until its producer has sent its last event or was
/// interrupted.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Relay driven by scripts, one per opened feed
pub struct ScriptedRelay {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    pub opened: Mutex<Vec<RequestId>>,
}

impl ScriptedRelay {
    pub fn new(fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: Script) -> &Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }
}

#[async_trait]
impl RelaySource for ScriptedRelay {
    async fn open(&self, request_id: &RequestId) -> a3s_bridge::Result<ChunkProducer> {
        self.opened.lock().unwrap().push(request_id.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let (tx, rx) = mpsc::channel(4);
        // Relay feeds end with the receiver; no interrupt of their own.
        tokio::spawn(play(script, tx, CancellationToken::new()));
        Ok(rx)
    }

    fn name(&self) -> &str {
        "scripted-relay"
    }
}

/// Config with timers short enough for paused-clock tests
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.queue.admission_wait_ms = 1_000;
    config.queue.cancel_grace_ms = 200;
    config.stream.relay_silence_ms = 300;
    config.stream.silence_timeout_ms = 2_000;
    config.stream.total_timeout_ms = 20_000;
    config.quota.select_best_on_startup = false;
    config.quota.max_rotations_per_minute = 0;
    config.refresh.interval_secs = 0;
    config.refresh.every_n_requests = 0;
    config
}

/// Build and start a bridge over the given profiles
pub fn start_bridge(
    config: BridgeConfig,
    boundary: Arc<ScriptedBoundary>,
    relay: Option<Arc<ScriptedRelay>>,
    profiles: &[&str],
) -> Bridge {
    let store = Arc::new(MemoryCredentialStore::with_profiles(
        profiles.iter().copied(),
    ));
    let mut builder = Bridge::builder(config, boundary, store);
    if let Some(relay) = relay {
        builder = builder.relay(relay);
    }
    let bridge = builder.build().unwrap();
    bridge.start().unwrap();
    bridge
}

/// Concatenated content deltas
pub fn content(chunks: &[StreamChunk]) -> String {
    chunks
        .iter()
        .filter(|c| c.kind == ChunkKind::ContentDelta)
        .map(|c| c.payload.as_str())
        .collect()
}

/// Assert caller-visible sequence numbers run 1..=n without gaps
pub fn assert_gapless(chunks: &[StreamChunk]) {
    for (idx, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.seq, idx as u64 + 1, "gap before {:?}", chunk);
    }
}
