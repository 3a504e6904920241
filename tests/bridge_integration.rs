//! Bridge integration tests
//!
//! End-to-end tests driving the full `Bridge` (queue, executor, assembler,
//! orchestrator, credential pool) against scripted sessions and relays.
//! All tests run on a paused clock so timeouts resolve instantly.

mod common;

use a3s_bridge::openai::{collect_completion, parse_request, ChunkFormatter, SSE_DONE};
use a3s_bridge::{
    AdmissionStatus, BridgeError, ChatMessage, ChatRequest, ChunkKind, ErrorKind,
    FunctionCallingMode, InvocationStrategy, NativeToolError, PathErrorKind, ProfileStatus,
    RequestState, ToolDefinition, ToolSchema,
};
use common::{
    assert_gapless, content, start_bridge, test_config, Script, ScriptedBoundary, ScriptedRelay,
    Step,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const MODEL: &str = "gemini-2.5-pro";

fn request(prompt: &str) -> ChatRequest {
    ChatRequest::new(MODEL, vec![ChatMessage::user(prompt)])
}

fn weather_tools() -> ToolSchema {
    ToolSchema::new(vec![ToolDefinition::new(
        "get_weather",
        json!({"type": "object", "properties": {"city": {"type": "string"}}}),
    )
    .with_description("Weather by city")])
}

fn profile_status(bridge: &a3s_bridge::Bridge, id: &str) -> ProfileStatus {
    bridge
        .credentials()
        .profiles()
        .unwrap()
        .into_iter()
        .find(|p| p.id == id)
        .unwrap()
        .status
}

// ─── Admission & Ordering ────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_requests_run_one_at_a_time_in_submission_order() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(
        &["one ", "two ", "three"],
        5,
    )));
    let bridge = start_bridge(test_config(), boundary.clone(), None, &["alpha"]);

    let handles: Vec<_> = ["A", "B", "C"]
        .iter()
        .map(|p| bridge.submit(request(p)).unwrap())
        .collect();

    for handle in handles {
        let chunks = handle.into_stream().collect_all().await;
        assert_eq!(content(&chunks), "one two three");
        assert_eq!(chunks.last().unwrap().kind, ChunkKind::Done);
        assert_gapless(&chunks);
    }

    assert_eq!(boundary.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(boundary.turn_prompts(), vec!["A", "B", "C"]);
    assert_eq!(bridge.credentials().quota().usage("alpha", MODEL), 15);
}

#[tokio::test(start_paused = true)]
async fn test_admission_timeout_reports_still_queued() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["fast"], 1)));
    // Two steps of 1.5s each keep A Active past several admission intervals
    boundary.push(Script::reply(&["slow"], 1).step_ms(1_500));
    let bridge = start_bridge(test_config(), boundary.clone(), None, &["alpha"]);

    let mut a = bridge.submit(request("A")).unwrap();
    let mut b = bridge.submit(request("B")).unwrap();
    assert_eq!(a.admitted().await.unwrap(), RequestState::Active);

    let err = b.admitted().await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::AdmissionTimeout { position: 0, .. }
    ));
    assert!(!err.is_terminal());
    assert_eq!(b.admission(), AdmissionStatus::Queued { position: 0 });
    assert_eq!(bridge.queue().depth(), 1);

    let state = loop {
        match b.admitted().await {
            Ok(state) => break state,
            Err(BridgeError::AdmissionTimeout { .. }) => continue,
            Err(e) => panic!("unexpected admission error: {}", e),
        }
    };
    assert_ne!(state, RequestState::Queued);
    assert_eq!(a.finished().await, RequestState::Completed);
    assert_eq!(b.finished().await, RequestState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_submit_fails_fast_without_credentials() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["never"], 1)));
    let bridge = start_bridge(test_config(), boundary.clone(), None, &[]);

    let err = bridge.submit(request("A")).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::CredentialExhausted);
    assert!(bridge.inspect().is_empty());
    assert_eq!(boundary.turn_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_inspect_reports_queue_rows() {
    let mut config = test_config();
    config.queue.retention_ms = 0;
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["ok"], 1)));
    boundary.push(Script::reply(&["slow"], 1).step_ms(200));
    let bridge = start_bridge(config, boundary, None, &["alpha"]);

    let mut a = bridge.submit(request("A")).unwrap();
    let mut b = bridge.submit(request("B")).unwrap();
    a.admitted().await.unwrap();

    let rows = bridge.inspect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, *a.id());
    assert_eq!(rows[0].state, RequestState::Active);
    assert_eq!(rows[1].state, RequestState::Queued);
    assert_eq!(rows[1].model, MODEL);
    assert!(!rows[1].cancelled);

    a.finished().await;
    b.finished().await;
    // Zero retention evicts finished rows on the next inspection
    assert!(bridge.inspect().is_empty());
    assert_eq!(bridge.state_of(b.id()), None);
}

// ─── Cancellation ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cancel_queued_request_never_reaches_session() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["done"], 7)));
    boundary.push(Script::reply(&["a1", "a2", "a3"], 7).step_ms(100));
    let bridge = start_bridge(test_config(), boundary.clone(), None, &["alpha"]);

    let mut a = bridge.submit(request("A")).unwrap();
    let b = bridge.submit(request("B")).unwrap();
    let mut c = bridge.submit(request("C")).unwrap();
    a.admitted().await.unwrap();

    assert!(bridge.cancel(b.id()));
    assert_eq!(b.state(), RequestState::Cancelled);
    assert!(!bridge.cancel(b.id()));

    let row = bridge
        .inspect()
        .into_iter()
        .find(|r| &r.id == b.id())
        .unwrap();
    assert!(row.cancelled);
    assert_eq!(row.state, RequestState::Cancelled);

    let chunks = b.into_stream().collect_all().await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].seq, 1);
    assert_eq!(chunks[0].kind, ChunkKind::Error);
    assert!(chunks[0].payload.contains("cancelled"));

    assert_eq!(a.finished().await, RequestState::Completed);
    assert_eq!(c.finished().await, RequestState::Completed);
    assert_eq!(boundary.turn_prompts(), vec!["A", "C"]);
    assert_eq!(boundary.interrupts.load(Ordering::SeqCst), 0);
    assert_eq!(bridge.credentials().quota().usage("alpha", MODEL), 14);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_active_request_interrupts_and_moves_on() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["next"], 1)));
    boundary.push(Script::stall());
    let bridge = start_bridge(test_config(), boundary.clone(), None, &["alpha"]);

    let mut a = bridge.submit(request("A")).unwrap();
    let mut b = bridge.submit(request("B")).unwrap();
    assert_eq!(assert_ok!(a.admitted().await), RequestState::Active);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(bridge.cancel(a.id()));
    assert_eq!(a.finished().await, RequestState::Cancelled);
    let chunks = a.into_stream().collect_all().await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].kind, ChunkKind::Error);
    assert!(chunks[0].payload.contains("cancelled"));
    assert_eq!(boundary.interrupts.load(Ordering::SeqCst), 1);

    assert_eq!(b.finished().await, RequestState::Completed);
    assert_eq!(boundary.turn_prompts(), vec!["A", "B"]);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_handle_abandons_queued_request() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["ok"], 1)));
    boundary.push(Script::reply(&["slow"], 1).step_ms(100));
    let bridge = start_bridge(test_config(), boundary.clone(), None, &["alpha"]);

    let mut a = bridge.submit(request("A")).unwrap();
    let b = bridge.submit(request("B")).unwrap();
    let b_id = b.id().clone();
    let mut c = bridge.submit(request("C")).unwrap();
    drop(b);

    a.finished().await;
    c.finished().await;
    assert_eq!(bridge.state_of(&b_id), Some(RequestState::Cancelled));
    assert_eq!(boundary.turn_prompts(), vec!["A", "C"]);
}

// ─── Stream Assembly ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_silent_relay_falls_back_to_direct_path() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["Hello", " world"], 2)));
    let relay = Arc::new(ScriptedRelay::new(Script::stall()));
    let bridge = start_bridge(
        test_config(),
        boundary.clone(),
        Some(relay.clone()),
        &["alpha"],
    );

    let handle = bridge.submit(request("A")).unwrap();
    let chunks = handle.into_stream().collect_all().await;

    assert_eq!(content(&chunks), "Hello world");
    assert_eq!(chunks.last().unwrap().kind, ChunkKind::Done);
    assert_gapless(&chunks);
    assert_eq!(relay.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_relay_and_direct_never_duplicate() {
    let script = Script::reply(&["Hello", " there", " world"], 3);
    let boundary = Arc::new(ScriptedBoundary::new(script.clone()));
    let relay = Arc::new(ScriptedRelay::new(Script::reply(&["x"], 1)));
    // Relay delivers the first fragment, then goes quiet
    relay.push(Script::steps(vec![Step::Text("Hello")]).hold_open());
    let bridge = start_bridge(test_config(), boundary, Some(relay), &["alpha"]);

    let handle = bridge.submit(request("A")).unwrap();
    let chunks = handle.into_stream().collect_all().await;

    assert_eq!(content(&chunks), "Hello there world");
    assert_gapless(&chunks);
    assert_eq!(chunks.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_direct_silence_times_out_request() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["ok"], 1)));
    boundary.push(Script::steps(vec![Step::Text("partial")]).hold_open());
    let bridge = start_bridge(test_config(), boundary.clone(), None, &["alpha"]);

    let mut a = bridge.submit(request("A")).unwrap();
    let mut b = bridge.submit(request("B")).unwrap();
    assert_eq!(a.finished().await, RequestState::Failed);

    let chunks = a.into_stream().collect_all().await;
    assert_eq!(content(&chunks), "partial");
    let last = chunks.last().unwrap();
    assert_eq!(last.kind, ChunkKind::Error);
    assert!(last.payload.contains("execution_timeout"));
    assert_gapless(&chunks);
    assert_eq!(boundary.interrupts.load(Ordering::SeqCst), 1);

    assert_eq!(b.finished().await, RequestState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_reasoning_and_content_keep_order() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::steps(vec![
        Step::Reasoning("thinking"),
        Step::Text("answer"),
        Step::Done(None),
    ])));
    let bridge = start_bridge(test_config(), boundary, None, &["alpha"]);

    let chunks = bridge
        .submit(request("A"))
        .unwrap()
        .into_stream()
        .collect_all()
        .await;
    let kinds: Vec<ChunkKind> = chunks.iter().map(|c| c.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ChunkKind::ReasoningDelta,
            ChunkKind::ContentDelta,
            ChunkKind::Done
        ]
    );
    // No reported usage: estimated from characters
    assert!(chunks[2].usage.unwrap().completion_tokens > 0);
}

// ─── Credential Rotation ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_hard_crossing_moves_next_request_to_another_profile() {
    let mut config = test_config();
    config.quota.soft_limit = 50;
    config.quota.hard_limit = 100;
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["ok"], 150)));
    let bridge = start_bridge(config, boundary.clone(), None, &["alpha", "beta"]);

    let mut a = bridge.submit(request("A")).unwrap();
    let mut b = bridge.submit(request("B")).unwrap();
    assert_eq!(a.finished().await, RequestState::Completed);
    assert_eq!(b.finished().await, RequestState::Completed);

    assert_eq!(boundary.turn_profiles(), vec!["alpha", "beta"]);
    assert_eq!(profile_status(&bridge, "alpha"), ProfileStatus::Exhausted);
    assert_eq!(bridge.credentials().active_profile().unwrap().id, "beta");
}

#[tokio::test(start_paused = true)]
async fn test_soft_crossing_rotates_before_next_admission() {
    let mut config = test_config();
    config.quota.soft_limit = 50;
    config.quota.hard_limit = 1_000;
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["ok"], 1)));
    boundary.push(Script::reply(&["long ", "answer"], 60).step_ms(100));
    let bridge = start_bridge(config, boundary.clone(), None, &["alpha", "beta"]);

    let mut a = bridge.submit(request("A")).unwrap();
    let mut b = bridge.submit(request("B")).unwrap();

    // The crossing request itself is never aborted
    assert_eq!(a.finished().await, RequestState::Completed);
    assert_eq!(b.finished().await, RequestState::Completed);
    assert_eq!(boundary.turn_profiles(), vec!["alpha", "beta"]);
    assert_ne!(profile_status(&bridge, "alpha"), ProfileStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_last_profile_exhausted_fails_next_submit() {
    let mut config = test_config();
    config.quota.soft_limit = 50;
    config.quota.hard_limit = 100;
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["ok"], 150)));
    let bridge = start_bridge(config, boundary.clone(), None, &["alpha"]);

    let mut a = bridge.submit(request("A")).unwrap();
    assert_eq!(a.finished().await, RequestState::Completed);

    let err = bridge.submit(request("B")).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::CredentialExhausted);
    assert_eq!(boundary.turn_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_quota_signal_exhausts_profile() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["ok"], 1)));
    boundary.push(Script::steps(vec![
        Step::Text("par"),
        Step::Fail(PathErrorKind::QuotaExceeded, "quota exceeded"),
    ]));
    let bridge = start_bridge(test_config(), boundary.clone(), None, &["alpha", "beta"]);

    let mut a = bridge.submit(request("A")).unwrap();
    let mut b = bridge.submit(request("B")).unwrap();
    assert_eq!(a.finished().await, RequestState::Failed);
    assert_eq!(b.finished().await, RequestState::Completed);

    assert_eq!(profile_status(&bridge, "alpha"), ProfileStatus::Exhausted);
    assert_eq!(boundary.turn_profiles(), vec!["alpha", "beta"]);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_session_rotates_profile() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["ok"], 1)));
    boundary.mark_unhealthy("alpha");
    let bridge = start_bridge(test_config(), boundary.clone(), None, &["alpha", "beta"]);

    let mut a = bridge.submit(request("A")).unwrap();
    assert_eq!(a.finished().await, RequestState::Completed);
    assert_eq!(boundary.turn_profiles(), vec!["beta"]);
    assert_eq!(
        *boundary.activations.lock().unwrap(),
        vec!["alpha".to_string(), "beta".to_string()]
    );
}

// ─── Function Calling ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_auto_mode_falls_back_once_per_schema() {
    let mut config = test_config();
    config.tools.mode = FunctionCallingMode::Auto;
    config.tools.native_retries = 2;
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["no tools needed"], 3)));
    boundary.native_outcomes(vec![
        Err(NativeToolError::ElementNotFound("tools panel".into())),
        Err(NativeToolError::Timeout("toggle".into())),
    ]);
    let bridge = start_bridge(config, boundary.clone(), None, &["alpha"]);

    for prompt in ["A", "B"] {
        let mut handle = bridge
            .submit(request(prompt).with_tools(weather_tools()))
            .unwrap();
        assert_eq!(handle.finished().await, RequestState::Completed);
    }

    // Two attempts for the first request, none for the second
    assert_eq!(boundary.native_calls.load(Ordering::SeqCst), 2);
    let turns = boundary.turns.lock().unwrap();
    for turn in turns.iter() {
        let tools = turn.tools.as_ref().unwrap();
        assert_eq!(tools.strategy, InvocationStrategy::Emulated);
        assert!(tools.declarations.is_none());
        assert!(turn.messages[0].content.contains("get_weather"));
    }
    drop(turns);

    let stats = bridge.orchestrator().cache().stats();
    assert!(stats.hits >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_emulated_tool_call_reaches_caller() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(
        &[
            "Let me check. Request func",
            "tion call: get_weather\nParameters:\n{\"city\": ",
            "\"Oslo\"}",
        ],
        12,
    )));
    let bridge = start_bridge(test_config(), boundary, None, &["alpha"]);

    let handle = bridge
        .submit(request("weather?").with_tools(weather_tools()))
        .unwrap();
    let id = handle.id().clone();
    let chunks = handle.into_stream().collect_all().await;
    assert_gapless(&chunks);
    assert!(!content(&chunks).contains("Request function"));

    let body = collect_completion(&id, MODEL, &chunks);
    let message = &body["choices"][0]["message"];
    assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
    assert_eq!(message["tool_calls"][0]["function"]["name"], "get_weather");
    let arguments: serde_json::Value = serde_json::from_str(
        message["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(arguments, json!({"city": "Oslo"}));
}

#[tokio::test(start_paused = true)]
async fn test_native_tool_call_reaches_caller() {
    let mut config = test_config();
    config.tools.mode = FunctionCallingMode::Native;
    let boundary = Arc::new(ScriptedBoundary::new(Script::steps(vec![
        Step::ToolCall(r#"{"id": "call_n1", "name": "get_weather", "args": {"city": "Rome"}}"#),
        Step::Done(Some(4)),
    ])));
    boundary.native_outcomes(vec![Ok(())]);
    let bridge = start_bridge(config, boundary.clone(), None, &["alpha"]);

    let handle = bridge
        .submit(request("weather?").with_tools(weather_tools()))
        .unwrap();
    let id = handle.id().clone();
    let chunks = handle.into_stream().collect_all().await;

    let body = collect_completion(&id, MODEL, &chunks);
    let call = &body["choices"][0]["message"]["tool_calls"][0];
    assert_eq!(call["id"], "call_n1");
    assert_eq!(call["function"]["name"], "get_weather");

    let turns = boundary.turns.lock().unwrap();
    let tools = turns[0].tools.as_ref().unwrap();
    assert_eq!(tools.strategy, InvocationStrategy::Native);
    assert!(tools.declarations.is_some());
    assert_eq!(boundary.native_calls.load(Ordering::SeqCst), 1);
}

// ─── OpenAI Surface ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_openai_request_streams_as_sse() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["Hi", " there"], 2)));
    let bridge = start_bridge(test_config(), boundary, None, &["alpha"]);

    let request = parse_request(&json!({
        "model": MODEL,
        "stream": true,
        "messages": [{"role": "user", "content": "hello"}],
    }))
    .unwrap();
    let handle = bridge.submit(request).unwrap();
    let mut formatter = ChunkFormatter::new(handle.id(), MODEL);
    let chunks = handle.into_stream().collect_all().await;

    let body: String = chunks.iter().map(|c| formatter.sse(c)).collect();
    assert_eq!(body.matches("data: ").count(), chunks.len() + 1);
    assert!(body.contains("\"content\":\"Hi\""));
    assert!(body.contains("\"finish_reason\":\"stop\""));
    assert!(body.ends_with(SSE_DONE));
}

// ─── Shutdown ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_queued_and_refreshes_session() {
    let boundary = Arc::new(ScriptedBoundary::new(Script::reply(&["ok"], 1)));
    boundary.push(Script::reply(&["slow"], 1).step_ms(200));
    let bridge = start_bridge(test_config(), boundary.clone(), None, &["alpha"]);

    let mut a = bridge.submit(request("A")).unwrap();
    let b = bridge.submit(request("B")).unwrap();
    assert_ok!(a.admitted().await);

    bridge.shutdown().await;

    assert_eq!(a.finished().await, RequestState::Completed);
    assert_eq!(b.state(), RequestState::Cancelled);
    assert_eq!(boundary.turn_prompts(), vec!["A"]);
    assert_eq!(boundary.snapshots.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.refresh().refresh_count(), 1);
    assert!(bridge.submit(request("C")).is_err());
}
