//! Admission control for the single execution resource
//!
//! Requests are admitted strictly FIFO by a single worker task, so at most
//! one request is Active at any time. Cancelling a Queued request removes it
//! without touching the execution boundary or the quota counters; cancelling
//! the Active request interrupts it through the stream assembler, and the
//! worker moves on once the turn stops or the grace period runs out.
//!
//! ```text
//! Queued ──► Active ──► Completed | Failed | Cancelled
//!    └──────────────► Cancelled
//! ```

use crate::config::QueueConfig;
use crate::error::{BridgeError, Result};
use crate::executor::RequestExecutor;
use crate::stream::ChunkStream;
use crate::types::{ChatRequest, ChunkKind, QueueEntryInfo, RequestId, RequestState, StreamChunk};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Admission status reported to a waiting caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStatus {
    /// Still waiting; `position` is 0-based among queued requests
    Queued { position: usize },
    /// Left the queue in this state
    Admitted(RequestState),
}

struct Entry {
    id: RequestId,
    model: String,
    request: Option<ChatRequest>,
    sink: Option<mpsc::Sender<StreamChunk>>,
    cancel: CancellationToken,
    state: RequestState,
    cancel_requested: bool,
    submitted_at: Instant,
    admitted_at: Option<Instant>,
    finished_at: Option<Instant>,
    state_tx: watch::Sender<RequestState>,
}

impl Entry {
    fn set_state(&mut self, next: RequestState) {
        if !self.state.can_transition_to(next) {
            tracing::debug!(
                request_id = %self.id,
                from = %self.state,
                to = %next,
                "Ignoring illegal state transition"
            );
            return;
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Instant::now());
            self.sink = None;
            self.request = None;
        }
        self.state_tx.send_replace(next);
    }

    fn waited_ms(&self) -> u64 {
        let until = self.admitted_at.or(self.finished_at).unwrap_or_else(Instant::now);
        until.duration_since(self.submitted_at).as_millis() as u64
    }
}

struct QueueState {
    entries: VecDeque<Entry>,
    accepting: bool,
}

struct QueueInner {
    config: QueueConfig,
    executor: Arc<RequestExecutor>,
    state: Mutex<QueueState>,
    wakeup: Notify,
    shutdown: CancellationToken,
}

/// One job handed to the worker
struct Job {
    id: RequestId,
    request: ChatRequest,
    sink: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
}

/// FIFO admission queue in front of the request executor
pub struct RequestQueueManager {
    inner: Arc<QueueInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestQueueManager {
    pub fn new(config: QueueConfig, executor: Arc<RequestExecutor>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                executor,
                state: Mutex::new(QueueState {
                    entries: VecDeque::new(),
                    accepting: true,
                }),
                wakeup: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the admission worker (idempotent)
    pub fn start(&self) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|e| BridgeError::Store(format!("Failed to acquire worker lock: {}", e)))?;
        if worker.is_none() {
            let inner = self.inner.clone();
            *worker = Some(tokio::spawn(async move { inner.run().await }));
            tracing::info!("Request queue worker started");
        }
        Ok(())
    }

    /// Enqueue a request and return the caller's handle
    ///
    /// Fails fast with `CredentialExhausted` when no profile can serve it.
    pub fn submit(&self, request: ChatRequest) -> Result<RequestHandle> {
        self.check_credentials()?;

        let id = RequestId::new();
        let (tx, rx) = mpsc::channel(self.inner.config.stream_buffer.max(1));
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(RequestState::Queued);

        let depth = {
            let mut state = self.inner.lock()?;
            if !state.accepting {
                return Err(BridgeError::Execution(
                    "request queue is shutting down".to_string(),
                ));
            }
            self.inner.evict_expired(&mut state);
            state.entries.push_back(Entry {
                id: id.clone(),
                model: request.model.clone(),
                request: Some(request),
                sink: Some(tx),
                cancel: cancel.clone(),
                state: RequestState::Queued,
                cancel_requested: false,
                submitted_at: Instant::now(),
                admitted_at: None,
                finished_at: None,
                state_tx,
            });
            queued_count(&state)
        };

        if depth > self.inner.config.soft_warning_depth {
            tracing::warn!(
                request_id = %id,
                depth,
                threshold = self.inner.config.soft_warning_depth,
                "Request queue depth above warning threshold"
            );
        } else {
            tracing::info!(request_id = %id, depth, "Request queued");
        }
        self.inner.wakeup.notify_one();

        Ok(RequestHandle {
            id,
            stream: ChunkStream::new(rx, cancel),
            state: state_rx,
            inner: self.inner.clone(),
        })
    }

    fn check_credentials(&self) -> Result<()> {
        let credentials = self.inner.executor.credentials();
        if credentials.active_profile().is_ok() {
            return Ok(());
        }
        credentials.rotate_if_needed()?;
        credentials.active_profile().map(|_| ())
    }

    /// Cancel a Queued or Active request
    ///
    /// Returns false for unknown ids and requests already terminal.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let Ok(mut state) = self.inner.lock() else {
            return false;
        };
        let Some(entry) = state.entries.iter_mut().find(|e| &e.id == id) else {
            return false;
        };

        match entry.state {
            RequestState::Queued => {
                entry.cancel_requested = true;
                entry.cancel.cancel();
                if let Some(sink) = &entry.sink {
                    let error = BridgeError::Cancelled(id.to_string());
                    let _ = sink.try_send(StreamChunk::new(
                        1,
                        ChunkKind::Error,
                        error.to_payload().to_string(),
                    ));
                }
                entry.set_state(RequestState::Cancelled);
                tracing::info!(request_id = %id, "Queued request cancelled");
                true
            }
            RequestState::Active => {
                entry.cancel_requested = true;
                entry.cancel.cancel();
                tracing::info!(request_id = %id, "Active request cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Queued, active, and recently finished requests in submission order
    pub fn inspect(&self) -> Vec<QueueEntryInfo> {
        let Ok(mut state) = self.inner.lock() else {
            return Vec::new();
        };
        self.inner.evict_expired(&mut state);
        state
            .entries
            .iter()
            .map(|e| QueueEntryInfo {
                id: e.id.clone(),
                state: e.state,
                waited_ms: e.waited_ms(),
                cancelled: e.cancel_requested,
                model: e.model.clone(),
            })
            .collect()
    }

    /// Number of requests waiting for admission
    pub fn depth(&self) -> usize {
        self.inner.lock().map(|s| queued_count(&s)).unwrap_or(0)
    }

    /// Current state of a request, if it is still tracked
    pub fn state_of(&self, id: &RequestId) -> Option<RequestState> {
        let state = self.inner.lock().ok()?;
        state.entries.iter().find(|e| &e.id == id).map(|e| e.state)
    }

    /// Stop accepting, cancel queued requests, let the Active one finish
    ///
    /// Runs the shutdown session refresh once the worker has stopped.
    pub async fn shutdown(&self) {
        let queued: Vec<RequestId> = match self.inner.lock() {
            Ok(mut state) => {
                state.accepting = false;
                state
                    .entries
                    .iter()
                    .filter(|e| e.state == RequestState::Queued)
                    .map(|e| e.id.clone())
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        for id in &queued {
            self.cancel(id);
        }

        self.inner.shutdown.cancel();
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        if let Some(refresh) = self.inner.executor.refresh() {
            refresh.shutdown().await;
        }
        tracing::info!(cancelled = queued.len(), "Request queue shut down");
    }
}

fn queued_count(state: &QueueState) -> usize {
    state
        .entries
        .iter()
        .filter(|e| e.state == RequestState::Queued)
        .count()
}

impl QueueInner {
    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|e| BridgeError::Store(format!("Failed to acquire queue lock: {}", e)))
    }

    fn evict_expired(&self, state: &mut QueueState) {
        let retention = self.config.retention();
        state.entries.retain(|e| {
            e.finished_at
                .map(|t| t.elapsed() < retention)
                .unwrap_or(true)
        });
    }

    /// Take the oldest live Queued request and mark it Active
    fn next_job(&self) -> Option<Job> {
        let mut state = self.lock().ok()?;
        for entry in state.entries.iter_mut() {
            if entry.state != RequestState::Queued {
                continue;
            }
            // Handle dropped while still waiting
            if entry.cancel.is_cancelled() {
                entry.cancel_requested = true;
                entry.set_state(RequestState::Cancelled);
                tracing::info!(request_id = %entry.id, "Abandoned request removed from queue");
                continue;
            }
            let (Some(request), Some(sink)) = (entry.request.take(), entry.sink.take()) else {
                continue;
            };
            entry.admitted_at = Some(Instant::now());
            entry.set_state(RequestState::Active);
            tracing::info!(
                request_id = %entry.id,
                waited_ms = entry.waited_ms(),
                "Request admitted"
            );
            return Some(Job {
                id: entry.id.clone(),
                request,
                sink,
                cancel: entry.cancel.clone(),
            });
        }
        None
    }

    fn finish(&self, id: &RequestId, next: RequestState) {
        if let Ok(mut state) = self.lock() {
            if let Some(entry) = state.entries.iter_mut().find(|e| &e.id == id) {
                entry.set_state(next);
            }
        }
    }

    fn position(&self, id: &RequestId) -> Option<usize> {
        let state = self.lock().ok()?;
        state
            .entries
            .iter()
            .filter(|e| e.state == RequestState::Queued)
            .position(|e| &e.id == id)
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.next_job() {
                Some(job) => {
                    let report = self
                        .executor
                        .execute(&job.id, &job.request, job.sink, job.cancel)
                        .await;
                    self.finish(&job.id, report.state);
                }
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wakeup.notified() => {}
                    }
                }
            }
        }
        tracing::debug!("Request queue worker stopped");
    }
}

/// Caller's view of a submitted request
///
/// Dropping the handle (or its stream) cancels the request.
pub struct RequestHandle {
    id: RequestId,
    stream: ChunkStream,
    state: watch::Receiver<RequestState>,
    inner: Arc<QueueInner>,
}

impl RequestHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn state(&self) -> RequestState {
        *self.state.borrow()
    }

    /// The chunk stream, for callers that consume it directly
    pub fn stream(&mut self) -> &mut ChunkStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> ChunkStream {
        self.stream
    }

    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        self.stream.next_chunk().await
    }

    /// Non-blocking admission check
    pub fn admission(&self) -> AdmissionStatus {
        match self.state() {
            RequestState::Queued => AdmissionStatus::Queued {
                position: self.inner.position(&self.id).unwrap_or(0),
            },
            other => AdmissionStatus::Admitted(other),
        }
    }

    /// Wait until the request leaves the queue
    ///
    /// After the configured admission interval this returns
    /// `AdmissionTimeout` while the request stays queued; call again to keep
    /// waiting.
    pub async fn admitted(&mut self) -> Result<RequestState> {
        let wait = self.inner.config.admission_wait();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            wait,
            self.state.wait_for(|s| *s != RequestState::Queued),
        )
        .await;
        match outcome {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(BridgeError::NotFound(self.id.to_string())),
            Err(_) => Err(BridgeError::AdmissionTimeout {
                waited_ms: started.elapsed().as_millis() as u64,
                position: self.inner.position(&self.id).unwrap_or(0),
            }),
        }
    }

    /// Wait for a terminal state
    pub async fn finished(&mut self) -> RequestState {
        if let Ok(state) = self.state.wait_for(|s| s.is_terminal()).await {
            return *state;
        }
        *self.state.borrow()
    }
}
