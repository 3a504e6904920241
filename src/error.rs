//! Error types for a3s-bridge

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tools::InvocationStrategy;

/// Errors that can occur while admitting, executing, or streaming a request
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Queue wait exceeded the admission interval; the request is still queued
    #[error("Request still queued after {waited_ms}ms (position {position})")]
    AdmissionTimeout { waited_ms: u64, position: usize },

    /// Silence window or total request duration exceeded
    #[error("Execution timed out after {elapsed_ms}ms: {reason}")]
    ExecutionTimeout { reason: String, elapsed_ms: u64 },

    /// The execution boundary reports the session as unusable
    #[error("Session unhealthy: {0}")]
    SessionUnhealthy(String),

    /// A native or emulated tool invocation failed
    #[error("Tool invocation failed in {mode} mode (fallback attempted: {fallback_attempted}): {reason}")]
    ToolInvocation {
        mode: InvocationStrategy,
        fallback_attempted: bool,
        reason: String,
    },

    /// No credential profile is eligible to serve requests
    #[error("No eligible credential profile: {0}")]
    CredentialExhausted(String),

    /// Relay path is down; callers fall back to the direct path
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Request was cancelled by its caller
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Unknown request or profile
    #[error("Not found: {0}")]
    NotFound(String),

    /// Non-recoverable failure on the direct execution path
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence failure (quota state, credential store)
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Machine-readable error kind surfaced to API callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AdmissionTimeout,
    ExecutionTimeout,
    SessionUnhealthy,
    ToolInvocationError,
    CredentialExhausted,
    RelayUnavailable,
    Cancelled,
    NotFound,
    ExecutionFailed,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AdmissionTimeout => "admission_timeout",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::SessionUnhealthy => "session_unhealthy",
            ErrorKind::ToolInvocationError => "tool_invocation_error",
            ErrorKind::CredentialExhausted => "credential_exhausted",
            ErrorKind::RelayUnavailable => "relay_unavailable",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BridgeError {
    /// Machine-readable kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::AdmissionTimeout { .. } => ErrorKind::AdmissionTimeout,
            BridgeError::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            BridgeError::SessionUnhealthy(_) => ErrorKind::SessionUnhealthy,
            BridgeError::ToolInvocation { .. } => ErrorKind::ToolInvocationError,
            BridgeError::CredentialExhausted(_) => ErrorKind::CredentialExhausted,
            BridgeError::RelayUnavailable(_) => ErrorKind::RelayUnavailable,
            BridgeError::Cancelled(_) => ErrorKind::Cancelled,
            BridgeError::NotFound(_) => ErrorKind::NotFound,
            BridgeError::Execution(_) => ErrorKind::ExecutionFailed,
            BridgeError::Config(_) => ErrorKind::Config,
            BridgeError::Store(_) | BridgeError::Serialization(_) | BridgeError::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the request this error belongs to has reached a terminal state
    ///
    /// `AdmissionTimeout` only reports that the request is still queued, and
    /// `RelayUnavailable` is absorbed by the direct-path fallback.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            BridgeError::AdmissionTimeout { .. } | BridgeError::RelayUnavailable(_)
        )
    }

    /// JSON payload carried by a terminal `Error` chunk
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
