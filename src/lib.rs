//! # a3s-bridge
//!
//! Admission control, stream assembly, function calling, and credential
//! rotation for a chat-completion bridge that drives a single interactive
//! session.
//!
//! ## Overview
//!
//! The remote session can only serve one turn at a time. `a3s-bridge` puts a
//! FIFO queue in front of it, merges the relay and direct output paths into
//! one ordered chunk stream, offers tool calling natively or through prompt
//! emulation, and rotates across a pool of credential profiles as quota runs
//! out.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_bridge::openai::{parse_request, ChunkFormatter};
//! use a3s_bridge::{ChunkKind, RequestId, StreamChunk};
//!
//! # fn example() -> a3s_bridge::Result<()> {
//! let request = parse_request(&serde_json::json!({
//!     "model": "gemini-2.5-pro",
//!     "stream": true,
//!     "messages": [{"role": "user", "content": "Hello"}],
//! }))?;
//! assert_eq!(request.messages.len(), 1);
//!
//! let mut formatter = ChunkFormatter::new(&RequestId::new(), &request.model);
//! let frame = formatter.sse(&StreamChunk::new(1, ChunkKind::ContentDelta, "Hi"));
//! assert!(frame.starts_with("data: "));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! ## Architecture
//!
//! - **ExecutionBoundary** trait: the live session (turns, interrupts,
//!   native tool panel, session state)
//! - **RelaySource** trait: optional low-latency side channel for output
//! - **RequestQueueManager**: FIFO admission, at most one Active request
//! - **StreamAssembler**: relay-preferred, direct-fallback chunk merging
//! - **FunctionCallingOrchestrator**: native / emulated / auto tool calls
//! - **CredentialRotationManager**: quota-driven profile rotation
//! - **SessionRefreshScheduler**: periodic session-state persistence
//! - **Bridge**: wires all of the above from a `BridgeConfig`

pub mod boundary;
pub mod bridge;
pub mod config;
pub mod credential;
pub mod error;
pub mod executor;
pub mod logging;
pub mod openai;
pub mod queue;
pub mod quota;
pub mod refresh;
pub mod state;
pub mod stream;
pub mod tools;
pub mod types;

// Re-export core types
pub use boundary::{
    ExecutionBoundary, NativeToolError, PathChunk, PathError, PathErrorKind, PathEvent,
    RelaySource, SessionHandle, TurnRequest, TurnTools,
};
pub use bridge::{Bridge, BridgeBuilder};
pub use config::{BridgeConfig, QueueConfig, QuotaConfig, RefreshConfig, StreamConfig, ToolsConfig};
pub use credential::{
    CredentialProfile, CredentialRotationManager, CredentialStore, FileCredentialStore,
    MemoryCredentialStore, ProfileStatus, RotationEvent, RotationReason,
};
pub use error::{BridgeError, ErrorKind, Result};
pub use executor::{ExecutionReport, RequestExecutor};
pub use logging::init_logging;
pub use queue::{AdmissionStatus, RequestHandle, RequestQueueManager};
pub use quota::{QuotaLevel, QuotaThresholds, QuotaTracker, UsageRecord};
pub use refresh::{RefreshTrigger, SessionRefreshScheduler};
pub use state::{FileQuotaStore, MemoryQuotaStore, QuotaSnapshot, QuotaStateStore};
pub use stream::{AssemblyOutcome, AssemblyStatus, ChunkStream, StreamAssembler};
pub use tools::{
    Fingerprint, FunctionCallingMode, FunctionCallingOrchestrator, InvocationStrategy,
    ToolCall, ToolCallResult, ToolChoice, ToolDefinition, ToolError, ToolInvocationCache,
    ToolSchema,
};
pub use types::{
    ChatMessage, ChatRequest, ChunkKind, QueueEntryInfo, RequestId, RequestState, Role,
    SamplingParams, StreamChunk, TokenUsage, ToolCallMessage,
};
