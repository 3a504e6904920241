//! High-level bridge facade
//!
//! `Bridge` wires the credential pool, quota persistence, function-calling
//! orchestrator, stream assembler, refresh scheduler, and admission queue
//! behind one handle. Callers supply the execution boundary, an optional
//! relay, and the credential store.

use crate::boundary::{ExecutionBoundary, RelaySource};
use crate::config::BridgeConfig;
use crate::credential::store::CredentialStore;
use crate::credential::CredentialRotationManager;
use crate::error::Result;
use crate::executor::RequestExecutor;
use crate::queue::{RequestHandle, RequestQueueManager};
use crate::quota::{QuotaThresholds, QuotaTracker};
use crate::refresh::SessionRefreshScheduler;
use crate::state::{FileQuotaStore, MemoryQuotaStore, QuotaStateStore};
use crate::stream::StreamAssembler;
use crate::tools::FunctionCallingOrchestrator;
use crate::types::{ChatRequest, QueueEntryInfo, RequestId, RequestState};
use std::sync::Arc;

/// Builder for `Bridge`
pub struct BridgeBuilder {
    config: BridgeConfig,
    boundary: Arc<dyn ExecutionBoundary>,
    credential_store: Arc<dyn CredentialStore>,
    relay: Option<Arc<dyn RelaySource>>,
    quota_store: Option<Arc<dyn QuotaStateStore>>,
}

impl BridgeBuilder {
    /// Prefer this relay for output; the boundary stays the fallback path
    pub fn relay(mut self, relay: Arc<dyn RelaySource>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Override the quota persistence chosen from `quota.stateFile`
    pub fn quota_store(mut self, store: Arc<dyn QuotaStateStore>) -> Self {
        self.quota_store = Some(store);
        self
    }

    /// Validate the configuration and assemble the components
    ///
    /// Background tasks are not spawned until `Bridge::start`.
    pub fn build(self) -> Result<Bridge> {
        self.config.validate()?;

        let quota_store = match (self.quota_store, &self.config.quota.state_file) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileQuotaStore::new(path.clone())),
            (None, None) => Arc::new(MemoryQuotaStore::default()),
        };
        let quota = Arc::new(QuotaTracker::new(QuotaThresholds::from_config(
            &self.config.quota,
        )));
        let credentials = Arc::new(CredentialRotationManager::new(
            self.credential_store.clone(),
            quota,
            quota_store,
            self.config.quota.clone(),
        )?);
        match credentials.initialize() {
            Ok(profile) => tracing::info!(profile = %profile.id, "Active credential profile"),
            Err(e) => tracing::warn!(error = %e, "No credential profile available at startup"),
        }

        let orchestrator = Arc::new(FunctionCallingOrchestrator::new(
            self.config.tools.clone(),
        ));

        let mut assembler = StreamAssembler::new(
            self.config.stream.clone(),
            self.config.queue.cancel_grace(),
            self.boundary.clone(),
        );
        if let Some(relay) = self.relay {
            assembler = assembler.with_relay(relay);
        }

        let refresh = Arc::new(SessionRefreshScheduler::new(
            self.config.refresh.clone(),
            self.boundary.clone(),
            credentials.clone(),
            self.credential_store,
        ));

        let executor = Arc::new(
            RequestExecutor::new(
                self.boundary,
                credentials.clone(),
                orchestrator.clone(),
                Arc::new(assembler),
            )
            .with_refresh(refresh.clone()),
        );
        let queue = RequestQueueManager::new(self.config.queue.clone(), executor);

        tracing::info!(
            mode = %orchestrator.mode(),
            profiles = credentials.profiles().map(|p| p.len()).unwrap_or(0),
            "Bridge assembled"
        );

        Ok(Bridge {
            config: self.config,
            credentials,
            orchestrator,
            refresh,
            queue,
        })
    }
}

/// A single-session chat-completion bridge
pub struct Bridge {
    config: BridgeConfig,
    credentials: Arc<CredentialRotationManager>,
    orchestrator: Arc<FunctionCallingOrchestrator>,
    refresh: Arc<SessionRefreshScheduler>,
    queue: RequestQueueManager,
}

impl Bridge {
    pub fn builder(
        config: BridgeConfig,
        boundary: Arc<dyn ExecutionBoundary>,
        credential_store: Arc<dyn CredentialStore>,
    ) -> BridgeBuilder {
        BridgeBuilder {
            config,
            boundary,
            credential_store,
            relay: None,
            quota_store: None,
        }
    }

    /// Spawn the queue worker and the refresh loop
    pub fn start(&self) -> Result<()> {
        self.queue.start()?;
        self.refresh.start();
        Ok(())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialRotationManager> {
        &self.credentials
    }

    pub fn orchestrator(&self) -> &Arc<FunctionCallingOrchestrator> {
        &self.orchestrator
    }

    pub fn refresh(&self) -> &Arc<SessionRefreshScheduler> {
        &self.refresh
    }

    pub fn queue(&self) -> &RequestQueueManager {
        &self.queue
    }

    /// Enqueue a request
    pub fn submit(&self, request: ChatRequest) -> Result<RequestHandle> {
        self.queue.submit(request)
    }

    pub fn cancel(&self, id: &RequestId) -> bool {
        self.queue.cancel(id)
    }

    pub fn inspect(&self) -> Vec<QueueEntryInfo> {
        self.queue.inspect()
    }

    pub fn state_of(&self, id: &RequestId) -> Option<RequestState> {
        self.queue.state_of(id)
    }

    /// Drain the queue and run the shutdown refresh
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
