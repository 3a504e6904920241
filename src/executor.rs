//! Per-request execution pipeline
//!
//! Driven by the queue worker for the one Active request:
//! credential check, session activation and health, tool plan, stream
//! assembly, then usage accounting. Rotation and refresh side effects happen
//! here so the next admission already sees the new active profile.

use crate::boundary::{ExecutionBoundary, SessionHandle, TurnRequest};
use crate::credential::{CredentialRotationManager, RotationReason};
use crate::error::{BridgeError, Result};
use crate::refresh::SessionRefreshScheduler;
use crate::stream::{AssemblyStatus, StreamAssembler};
use crate::tools::{FunctionCallingOrchestrator, ToolCallResult, TurnInterceptor};
use crate::types::{ChatRequest, ChunkKind, RequestId, RequestState, StreamChunk, TokenUsage};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Result of executing one request
#[derive(Debug)]
pub struct ExecutionReport {
    pub state: RequestState,
    /// Profile the request ran against, if it got that far
    pub profile_id: Option<String>,
    pub usage: TokenUsage,
    pub tool_result: Option<ToolCallResult>,
    pub error: Option<BridgeError>,
}

pub struct RequestExecutor {
    boundary: Arc<dyn ExecutionBoundary>,
    credentials: Arc<CredentialRotationManager>,
    orchestrator: Arc<FunctionCallingOrchestrator>,
    assembler: Arc<StreamAssembler>,
    refresh: Option<Arc<SessionRefreshScheduler>>,
    session: Mutex<Option<SessionHandle>>,
}

impl RequestExecutor {
    pub fn new(
        boundary: Arc<dyn ExecutionBoundary>,
        credentials: Arc<CredentialRotationManager>,
        orchestrator: Arc<FunctionCallingOrchestrator>,
        assembler: Arc<StreamAssembler>,
    ) -> Self {
        Self {
            boundary,
            credentials,
            orchestrator,
            assembler,
            refresh: None,
            session: Mutex::new(None),
        }
    }

    pub fn with_refresh(mut self, refresh: Arc<SessionRefreshScheduler>) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn credentials(&self) -> &Arc<CredentialRotationManager> {
        &self.credentials
    }

    pub fn orchestrator(&self) -> &Arc<FunctionCallingOrchestrator> {
        &self.orchestrator
    }

    pub fn refresh(&self) -> Option<&Arc<SessionRefreshScheduler>> {
        self.refresh.as_ref()
    }

    /// Session currently loaded on the boundary
    pub async fn current_session(&self) -> Option<SessionHandle> {
        self.session.lock().await.clone()
    }

    /// Run one request to a terminal state, streaming into `sink`
    pub async fn execute(
        &self,
        id: &RequestId,
        request: &ChatRequest,
        sink: mpsc::Sender<StreamChunk>,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let (session, turn, interceptor) = match self.prepare(id, request).await {
            Ok(prepared) => prepared,
            Err(error) => return reject(id, error, sink).await,
        };

        let outcome = self.assembler.run(turn, interceptor, sink, cancel).await;

        let tokens = outcome.usage.total();
        if tokens > 0 {
            self.credentials
                .record_usage(&session.profile_id, &request.model, tokens);
        }
        if let Some(signal) = outcome.signal {
            if let Err(e) = self.credentials.report_signal(&session.profile_id, signal) {
                tracing::warn!(
                    request_id = %id,
                    profile = %session.profile_id,
                    error = %e,
                    "Rotation after path signal failed"
                );
            }
        }

        let state = match outcome.status {
            AssemblyStatus::Completed => RequestState::Completed,
            AssemblyStatus::Failed => RequestState::Failed,
            AssemblyStatus::Cancelled => RequestState::Cancelled,
        };
        if state == RequestState::Completed {
            if let Some(refresh) = &self.refresh {
                refresh.record_completion();
            }
        }

        tracing::info!(
            request_id = %id,
            profile = %session.profile_id,
            model = %request.model,
            %state,
            tokens,
            fell_back = outcome.fell_back,
            "Request finished"
        );

        ExecutionReport {
            state,
            profile_id: Some(session.profile_id),
            usage: outcome.usage,
            tool_result: outcome.tool_result,
            error: outcome.error,
        }
    }

    async fn prepare(
        &self,
        id: &RequestId,
        request: &ChatRequest,
    ) -> Result<(SessionHandle, TurnRequest, TurnInterceptor)> {
        if self.credentials.rotate_if_needed()? {
            tracing::info!(request_id = %id, "Credential rotated before admission");
        }
        let session = self.healthy_session(id).await?;

        let mut plan =
            self.orchestrator
                .prepare(&request.tools, &request.tool_choice, &request.model);
        self.orchestrator
            .activate(&mut plan, self.boundary.as_ref(), &session)
            .await?;

        let turn = TurnRequest {
            request_id: id.clone(),
            session: session.clone(),
            model: request.model.clone(),
            messages: self.orchestrator.render_messages(&plan, &request.messages),
            sampling: request.sampling.clone(),
            tools: self.orchestrator.turn_tools(&plan),
        };
        tracing::debug!(
            request_id = %id,
            profile = %session.profile_id,
            strategy = ?plan.strategy,
            messages = turn.messages.len(),
            "Turn prepared"
        );
        Ok((session, turn, self.orchestrator.interceptor(plan)))
    }

    /// A live, healthy session; one rotation is attempted before giving up
    async fn healthy_session(&self, id: &RequestId) -> Result<SessionHandle> {
        let mut reason = String::from("session unavailable");
        for attempt in 0..2 {
            let profile = self.credentials.active_profile()?;
            let session = match self.ensure_session().await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(
                        request_id = %id,
                        profile = %profile.id,
                        error = %e,
                        "Profile activation failed"
                    );
                    reason = e.to_string();
                    self.credentials.mark_invalid(&profile.id)?;
                    continue;
                }
            };

            if self.boundary.is_session_healthy(&session).await {
                return Ok(session);
            }
            tracing::warn!(request_id = %id, profile = %session.profile_id, "Session unhealthy");
            reason = format!("session for profile '{}' is unhealthy", session.profile_id);
            if attempt == 0 {
                if let Err(e) = self.credentials.rotate(RotationReason::SessionUnhealthy) {
                    tracing::warn!(request_id = %id, error = %e, "No profile to rotate to");
                    break;
                }
            }
        }
        Err(BridgeError::SessionUnhealthy(reason))
    }

    /// Load the active profile onto the boundary if it is not already live
    async fn ensure_session(&self) -> Result<SessionHandle> {
        let profile = self.credentials.active_profile()?;
        let generation = self.credentials.generation();

        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.profile_id == profile.id && session.generation == generation {
                return Ok(session.clone());
            }
        }

        let mut session = self.boundary.activate_profile(&profile).await?;
        session.generation = generation;
        self.orchestrator.cache().invalidate_all("session replaced");
        if let Some(refresh) = &self.refresh {
            refresh.attach_session(session.clone());
        }
        tracing::info!(profile = %profile.id, generation, "Session activated");
        *slot = Some(session.clone());
        Ok(session)
    }
}

async fn reject(
    id: &RequestId,
    error: BridgeError,
    sink: mpsc::Sender<StreamChunk>,
) -> ExecutionReport {
    tracing::error!(request_id = %id, error = %error, "Request failed before streaming");
    let chunk = StreamChunk::new(1, ChunkKind::Error, error.to_payload().to_string());
    let _ = sink.send(chunk).await;
    ExecutionReport {
        state: RequestState::Failed,
        profile_id: None,
        usage: TokenUsage::default(),
        tool_result: None,
        error: Some(error),
    }
}
