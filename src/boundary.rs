//! External collaborator seams
//!
//! The UI-automation layer that actually drives the remote page implements
//! `ExecutionBoundary`; an optional low-latency relay implements
//! `RelaySource`. Both produce `PathEvent`s over bounded channels so the
//! assembler can apply backpressure.

use crate::credential::CredentialProfile;
use crate::error::Result;
use crate::tools::InvocationStrategy;
use crate::types::{ChatMessage, ChunkKind, RequestId, SamplingParams, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Identity of the live session on the execution boundary
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    /// Credential profile the session was opened with
    pub profile_id: String,
    /// Bumped every time the session is replaced
    pub generation: u64,
}

impl SessionHandle {
    pub fn new(profile_id: impl Into<String>, generation: u64) -> Self {
        Self {
            profile_id: profile_id.into(),
            generation,
        }
    }
}

/// Tool plan as exposed to the execution boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnTools {
    pub strategy: InvocationStrategy,
    /// Serialized native declarations (None in emulated mode or without tools)
    pub declarations: Option<serde_json::Value>,
}

/// Everything the boundary needs to run one turn
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub request_id: RequestId,
    pub session: SessionHandle,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub sampling: SamplingParams,
    pub tools: Option<TurnTools>,
}

/// A fragment tagged with the producing path's sequence counter
///
/// Both paths count over the same response, so a fragment with sequence
/// number `n` from either path carries the same content.
#[derive(Debug, Clone, PartialEq)]
pub struct PathChunk {
    pub seq: u64,
    pub kind: ChunkKind,
    pub payload: String,
    pub usage: Option<TokenUsage>,
}

impl PathChunk {
    pub fn new(seq: u64, kind: ChunkKind, payload: impl Into<String>) -> Self {
        Self {
            seq,
            kind,
            payload: payload.into(),
            usage: None,
        }
    }

    pub fn done(seq: u64) -> Self {
        Self::new(seq, ChunkKind::Done, "")
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Classified path failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathErrorKind {
    /// Retryable hiccup (relay reconnect, transient network error)
    Transient,
    /// Non-recoverable failure of this path
    Fatal,
    /// Remote side reports the credential's quota as exhausted
    QuotaExceeded,
    /// Remote side is rate limiting the credential
    RateLimited,
    /// Session is gone (logged out, page crashed)
    SessionLost,
}

/// Error reported in-band by a producing path
#[derive(Debug, Clone, PartialEq)]
pub struct PathError {
    pub kind: PathErrorKind,
    pub message: String,
}

impl PathError {
    pub fn new(kind: PathErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Event emitted by a producing path
#[derive(Debug, Clone, PartialEq)]
pub enum PathEvent {
    Chunk(PathChunk),
    Error(PathError),
}

/// Receiving side of a producing path
pub type ChunkProducer = mpsc::Receiver<PathEvent>;

/// UI-level failure while configuring native tool declarations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NativeToolError {
    #[error("UI operation timed out: {0}")]
    Timeout(String),
    #[error("Element not found: {0}")]
    ElementNotFound(String),
    #[error("Unexpected UI structure: {0}")]
    UnexpectedStructure(String),
    #[error("Native tool calling unsupported: {0}")]
    Unsupported(String),
}

impl NativeToolError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, NativeToolError::Unsupported(_))
    }
}

/// The UI-automation layer driving the single remote session
#[async_trait]
pub trait ExecutionBoundary: Send + Sync {
    /// Load a credential profile into the session, replacing the current one
    async fn activate_profile(&self, profile: &CredentialProfile) -> Result<SessionHandle>;

    /// Submit a turn and return the direct-path chunk producer
    async fn start_turn(&self, turn: TurnRequest) -> Result<ChunkProducer>;

    /// Stop the in-flight turn, best effort
    async fn interrupt(&self, session: &SessionHandle) -> Result<()>;

    /// Whether the session can accept a turn
    async fn is_session_healthy(&self, session: &SessionHandle) -> bool;

    /// Declare tools through the remote service's built-in tool-call surface
    ///
    /// Default implementation reports native tools as unsupported.
    async fn configure_native_tools(
        &self,
        _session: &SessionHandle,
        _declarations: &serde_json::Value,
    ) -> std::result::Result<(), NativeToolError> {
        Err(NativeToolError::Unsupported(
            "boundary has no native tool surface".to_string(),
        ))
    }

    /// Capture the session's persistable state (cookies, storage)
    ///
    /// Default implementation returns `None`, meaning nothing to persist.
    async fn snapshot_session(
        &self,
        _session: &SessionHandle,
    ) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }
}

/// Optional lower-latency chunk source keyed by request id
#[async_trait]
pub trait RelaySource: Send + Sync {
    /// Open the relay feed for a request
    async fn open(&self, request_id: &RequestId) -> Result<ChunkProducer>;

    /// Relay name for logging
    fn name(&self) -> &str {
        "relay"
    }
}
