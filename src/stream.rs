//! Stream assembly
//!
//! Two production paths carry the same response: an optional low-latency
//! relay and the direct execution boundary. The assembler prefers the relay
//! and falls back to the direct path, for the rest of the request, when the
//! relay goes silent for `relay_silence` or fails past its retry budget.
//!
//! Each path tags fragments with its own position in the response. Only a
//! fragment whose position exceeds the highest one already forwarded is
//! delivered, so switching paths never duplicates content. Caller-visible
//! sequence numbers are assigned here: 1, 2, 3, ... with no gaps.
//!
//! The caller sink is a bounded channel; when the caller stops reading, the
//! assembler stops pulling from the paths, whose own bounded channels then
//! block the producers.

use crate::boundary::{
    ChunkProducer, ExecutionBoundary, PathChunk, PathError, PathErrorKind, PathEvent, RelaySource,
    SessionHandle, TurnRequest,
};
use crate::config::StreamConfig;
use crate::error::BridgeError;
use crate::tools::{ToolCallResult, TurnInterceptor};
use crate::types::{ChunkKind, RequestId, StreamChunk, TokenUsage};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Terminal status of an assembled stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStatus {
    Completed,
    Failed,
    Cancelled,
}

/// What happened while assembling one request
#[derive(Debug)]
pub struct AssemblyOutcome {
    pub status: AssemblyStatus,
    /// Reported by the remote side, or estimated from text length
    pub usage: TokenUsage,
    /// Chunks delivered to the caller, terminal chunk included
    pub delivered: u64,
    /// Relay was abandoned and the direct path finished the request
    pub fell_back: bool,
    /// Classified direct-path failure, if any
    pub signal: Option<PathErrorKind>,
    pub tool_result: Option<ToolCallResult>,
    pub error: Option<BridgeError>,
}

/// Caller-facing chunk stream
///
/// Dropping the stream cancels the request it belongs to.
pub struct ChunkStream {
    inner: ReceiverStream<StreamChunk>,
    cancel: CancellationToken,
}

impl ChunkStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamChunk>, cancel: CancellationToken) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
            cancel,
        }
    }

    /// Ask the producer to stop
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Receive the next chunk; `None` once the stream has closed
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        use tokio_stream::StreamExt;
        self.inner.next().await
    }

    /// Drain the stream to its terminal chunk
    pub async fn collect_all(mut self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            let terminal = chunk.is_terminal();
            chunks.push(chunk);
            if terminal {
                break;
            }
        }
        chunks
    }
}

impl Stream for ChunkStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Merges relay and direct output into one ordered stream
pub struct StreamAssembler {
    config: StreamConfig,
    cancel_grace: Duration,
    boundary: Arc<dyn ExecutionBoundary>,
    relay: Option<Arc<dyn RelaySource>>,
}

impl StreamAssembler {
    pub fn new(
        config: StreamConfig,
        cancel_grace: Duration,
        boundary: Arc<dyn ExecutionBoundary>,
    ) -> Self {
        Self {
            config,
            cancel_grace,
            boundary,
            relay: None,
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn RelaySource>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Spawn assembly for a turn and return the caller's stream
    ///
    /// The stream ends after its `Done` or `Error` chunk and cannot be
    /// restarted.
    pub fn open(
        self: &Arc<Self>,
        turn: TurnRequest,
        interceptor: TurnInterceptor,
        buffer: usize,
    ) -> (ChunkStream, JoinHandle<AssemblyOutcome>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        let assembler = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { assembler.run(turn, interceptor, tx, token).await });
        (ChunkStream::new(rx, cancel), task)
    }

    /// Drive one turn to its terminal chunk, writing into `sink`
    pub async fn run(
        &self,
        turn: TurnRequest,
        interceptor: TurnInterceptor,
        sink: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> AssemblyOutcome {
        let request_id = turn.request_id.clone();
        let session = turn.session.clone();
        let prompt_chars = turn.messages.iter().map(|m| m.content.chars().count()).sum();
        let started = Instant::now();
        let deadline = started + self.config.total_timeout();

        let mut run = Run {
            request_id: request_id.clone(),
            sink,
            cancel: cancel.clone(),
            grace: self.cancel_grace,
            interceptor,
            next_seq: 1,
            high_water: 0,
            usage: None,
            prompt_chars,
            completion_chars: 0,
            fell_back: false,
        };

        let mut relay = match &self.relay {
            Some(source) => open_relay(source.as_ref(), &request_id).await,
            None => None,
        };
        run.fell_back = self.relay.is_some() && relay.is_none();

        let mut direct = match self.boundary.start_turn(turn).await {
            Ok(producer) => producer,
            Err(e) => return run.fail(e, None).await,
        };

        let mut last_activity = Instant::now();
        let mut relay_attempts = 0u32;

        while let Some(feed) = relay.as_mut() {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.cancelled(run, &session, &mut direct).await;
                }
                _ = sleep_until(deadline) => {
                    return self
                        .timed_out(
                            run,
                            &session,
                            &mut direct,
                            "total duration exceeded",
                            started,
                        )
                        .await;
                }
                event = timeout_at(
                    last_activity + self.config.relay_silence(),
                    feed.recv(),
                ) => event,
            };

            match event {
                Err(_) => {
                    tracing::warn!(
                        request_id = %request_id,
                        silence_ms = self.config.relay_silence_ms,
                        "Relay silent, switching to direct path"
                    );
                    relay = None;
                }
                Ok(None) => {
                    tracing::warn!(
                        request_id = %request_id,
                        "Relay closed early, switching to direct path"
                    );
                    relay = None;
                }
                Ok(Some(PathEvent::Chunk(chunk))) if chunk.kind == ChunkKind::Error => {
                    tracing::warn!(
                        request_id = %request_id,
                        error = %chunk.payload,
                        "Relay reported an error, switching to direct path"
                    );
                    relay = None;
                }
                Ok(Some(PathEvent::Chunk(chunk))) => {
                    last_activity = Instant::now();
                    match run.accept(chunk).await {
                        Step::Continue => {}
                        Step::Done => return run.complete().await,
                        Step::ConsumerGone => {
                            return self.cancelled(run, &session, &mut direct).await;
                        }
                    }
                }
                Ok(Some(PathEvent::Error(error))) => {
                    relay = self
                        .recover_relay(&request_id, &error, &mut relay_attempts, &cancel)
                        .await;
                    last_activity = Instant::now();
                }
            }
            if relay.is_none() {
                run.fell_back = true;
            }
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.cancelled(run, &session, &mut direct).await;
                }
                _ = sleep_until(deadline) => {
                    return self
                        .timed_out(
                            run,
                            &session,
                            &mut direct,
                            "total duration exceeded",
                            started,
                        )
                        .await;
                }
                event = timeout_at(
                    last_activity + self.config.silence_timeout(),
                    direct.recv(),
                ) => event,
            };

            match event {
                Err(_) => {
                    let reason = format!("no output for {}ms", self.config.silence_timeout_ms);
                    return self
                        .timed_out(run, &session, &mut direct, &reason, started)
                        .await;
                }
                Ok(None) => {
                    let error =
                        BridgeError::Execution("direct path closed before completion".to_string());
                    return run.fail(error, None).await;
                }
                Ok(Some(PathEvent::Chunk(chunk))) if chunk.kind == ChunkKind::Error => {
                    return run.fail(BridgeError::Execution(chunk.payload), None).await;
                }
                Ok(Some(PathEvent::Chunk(chunk))) => {
                    last_activity = Instant::now();
                    match run.accept(chunk).await {
                        Step::Continue => {}
                        Step::Done => return run.complete().await,
                        Step::ConsumerGone => {
                            return self.cancelled(run, &session, &mut direct).await;
                        }
                    }
                }
                Ok(Some(PathEvent::Error(error))) => {
                    let signal = error.kind;
                    return run.fail(path_failure(error), Some(signal)).await;
                }
            }
        }
    }

    /// Reopen the relay after a transient error, within the retry budget
    async fn recover_relay(
        &self,
        request_id: &RequestId,
        error: &PathError,
        attempts: &mut u32,
        cancel: &CancellationToken,
    ) -> Option<ChunkProducer> {
        let source = self.relay.as_ref()?;
        if error.kind != PathErrorKind::Transient || *attempts >= self.config.relay_retries {
            tracing::warn!(
                request_id = %request_id,
                error = %error.message,
                attempts = *attempts,
                "Relay failed, switching to direct path"
            );
            return None;
        }

        let delay = self.config.relay_retry_delay(*attempts);
        *attempts += 1;
        tracing::debug!(
            request_id = %request_id,
            attempt = *attempts,
            delay_ms = delay.as_millis() as u64,
            "Reopening relay"
        );
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        open_relay(source.as_ref(), request_id).await
    }

    async fn timed_out(
        &self,
        run: Run,
        session: &SessionHandle,
        direct: &mut ChunkProducer,
        reason: &str,
        started: Instant,
    ) -> AssemblyOutcome {
        self.stop_turn(&run.request_id, session, direct).await;
        let error = BridgeError::ExecutionTimeout {
            reason: reason.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        run.fail(error, None).await
    }

    async fn cancelled(
        &self,
        run: Run,
        session: &SessionHandle,
        direct: &mut ChunkProducer,
    ) -> AssemblyOutcome {
        tracing::info!(request_id = %run.request_id, "Interrupting cancelled request");
        self.stop_turn(&run.request_id, session, direct).await;
        run.abandon().await
    }

    /// Interrupt the boundary and wait, up to the grace period, for output to stop
    async fn stop_turn(
        &self,
        request_id: &RequestId,
        session: &SessionHandle,
        direct: &mut ChunkProducer,
    ) {
        if let Err(e) = self.boundary.interrupt(session).await {
            tracing::warn!(request_id = %request_id, error = %e, "Interrupt failed");
        }
        let grace = tokio::time::sleep(self.cancel_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut grace => {
                    tracing::warn!(
                        request_id = %request_id,
                        grace_ms = self.cancel_grace.as_millis() as u64,
                        "Turn still producing after grace period"
                    );
                    return;
                }
                event = direct.recv() => match event {
                    None | Some(PathEvent::Error(_)) => return,
                    Some(PathEvent::Chunk(chunk)) if chunk.kind.is_terminal() => return,
                    Some(PathEvent::Chunk(_)) => {}
                },
            }
        }
    }
}

async fn open_relay(source: &dyn RelaySource, request_id: &RequestId) -> Option<ChunkProducer> {
    match source.open(request_id).await {
        Ok(feed) => Some(feed),
        Err(e) => {
            tracing::warn!(
                request_id = %request_id,
                relay = source.name(),
                error = %e,
                "Relay unavailable, using direct path"
            );
            None
        }
    }
}

fn path_failure(error: PathError) -> BridgeError {
    match error.kind {
        PathErrorKind::SessionLost => BridgeError::SessionUnhealthy(error.message),
        _ => BridgeError::Execution(error.message),
    }
}

enum Step {
    Continue,
    Done,
    ConsumerGone,
}

/// Per-request assembly state
struct Run {
    request_id: RequestId,
    sink: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
    grace: Duration,
    interceptor: TurnInterceptor,
    next_seq: u64,
    high_water: u64,
    usage: Option<TokenUsage>,
    prompt_chars: usize,
    completion_chars: usize,
    fell_back: bool,
}

impl Run {
    async fn accept(&mut self, chunk: PathChunk) -> Step {
        if chunk.seq <= self.high_water {
            tracing::trace!(
                request_id = %self.request_id,
                seq = chunk.seq,
                "Dropping duplicate fragment"
            );
            return Step::Continue;
        }
        self.high_water = chunk.seq;
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if chunk.kind == ChunkKind::Done {
            return Step::Done;
        }
        if matches!(chunk.kind, ChunkKind::ContentDelta | ChunkKind::ReasoningDelta) {
            self.completion_chars += chunk.payload.chars().count();
        }

        for (kind, payload) in self.interceptor.on_chunk(chunk.kind, chunk.payload) {
            if !self.emit(kind, payload, None).await {
                return Step::ConsumerGone;
            }
        }
        Step::Continue
    }

    /// Deliver one chunk; false when the caller is gone or cancelled
    async fn emit(&mut self, kind: ChunkKind, payload: String, usage: Option<TokenUsage>) -> bool {
        let chunk = StreamChunk {
            seq: self.next_seq,
            kind,
            payload,
            usage,
        };
        let delivered = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.sink.send(chunk) => sent.is_ok(),
        };
        if delivered {
            self.next_seq += 1;
        }
        delivered
    }

    fn final_usage(&self) -> TokenUsage {
        self.usage
            .unwrap_or_else(|| TokenUsage::estimate(self.prompt_chars, self.completion_chars))
    }

    async fn complete(mut self) -> AssemblyOutcome {
        for (kind, payload) in self.interceptor.finish() {
            if !self.emit(kind, payload, None).await {
                return self.abandon().await;
            }
        }
        let usage = self.final_usage();
        if !self.emit(ChunkKind::Done, String::new(), Some(usage)).await {
            return self.abandon().await;
        }
        tracing::debug!(
            request_id = %self.request_id,
            chunks = self.next_seq - 1,
            tokens = usage.total(),
            "Stream completed"
        );
        self.finish(AssemblyStatus::Completed, None, None)
    }

    async fn fail(mut self, error: BridgeError, signal: Option<PathErrorKind>) -> AssemblyOutcome {
        tracing::error!(request_id = %self.request_id, error = %error, "Stream failed");
        self.emit(ChunkKind::Error, error.to_payload().to_string(), None)
            .await;
        self.finish(AssemblyStatus::Failed, signal, Some(error))
    }

    /// End as cancelled, closing the stream with the cancellation error
    ///
    /// A caller that stopped reading gets `grace` to make room for it; a
    /// dropped caller gets nothing.
    async fn abandon(mut self) -> AssemblyOutcome {
        let error = BridgeError::Cancelled(self.request_id.to_string());
        let chunk = StreamChunk::new(
            self.next_seq,
            ChunkKind::Error,
            error.to_payload().to_string(),
        );
        match self.sink.send_timeout(chunk, self.grace).await {
            Ok(()) => self.next_seq += 1,
            Err(e) => tracing::debug!(
                request_id = %self.request_id,
                error = %e,
                "Cancellation chunk not delivered"
            ),
        }
        self.finish(AssemblyStatus::Cancelled, None, Some(error))
    }

    fn finish(
        self,
        status: AssemblyStatus,
        signal: Option<PathErrorKind>,
        error: Option<BridgeError>,
    ) -> AssemblyOutcome {
        AssemblyOutcome {
            status,
            usage: self.final_usage(),
            delivered: self.next_seq - 1,
            fell_back: self.fell_back,
            signal,
            tool_result: self.interceptor.result().cloned(),
            error,
        }
    }
}
