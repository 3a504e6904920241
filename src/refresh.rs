//! Session-state refresh
//!
//! One idempotent refresh operation fed by two trigger sources: a fixed
//! interval tick and a completed-request milestone. A final refresh runs on
//! graceful shutdown. Failures are logged and left for the next trigger.

use crate::boundary::{ExecutionBoundary, SessionHandle};
use crate::config::RefreshConfig;
use crate::credential::{CredentialRotationManager, CredentialStore};
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What caused a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    Interval,
    Milestone,
    Shutdown,
    Manual,
}

struct RefreshInner {
    config: RefreshConfig,
    boundary: Arc<dyn ExecutionBoundary>,
    credentials: Arc<CredentialRotationManager>,
    store: Arc<dyn CredentialStore>,
    session: RwLock<Option<SessionHandle>>,
    running: tokio::sync::Mutex<()>,
    completed: AtomicU64,
    refreshes: AtomicU64,
    milestone: Notify,
}

/// Background scheduler persisting the active session's state
pub struct SessionRefreshScheduler {
    inner: Arc<RefreshInner>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRefreshScheduler {
    pub fn new(
        config: RefreshConfig,
        boundary: Arc<dyn ExecutionBoundary>,
        credentials: Arc<CredentialRotationManager>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            inner: Arc::new(RefreshInner {
                config,
                boundary,
                credentials,
                store,
                session: RwLock::new(None),
                running: tokio::sync::Mutex::new(()),
                completed: AtomicU64::new(0),
                refreshes: AtomicU64::new(0),
                milestone: Notify::new(),
            }),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Point the scheduler at the session that is now live
    pub fn attach_session(&self, session: SessionHandle) {
        if let Ok(mut slot) = self.inner.session.write() {
            *slot = Some(session);
        }
    }

    /// Spawn the background loop (no-op when disabled or already running)
    pub fn start(&self) {
        if !self.inner.config.enabled {
            tracing::info!("Session refresh disabled");
            return;
        }
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.is_some() {
            return;
        }

        let inner = self.inner.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_secs(inner.config.interval_secs);

        *task = Some(tokio::spawn(async move {
            // A zero interval disables the timer trigger; milestones still fire.
            let mut ticker = (!period.is_zero()).then(|| {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });

            loop {
                let trigger = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = async {
                        match ticker.as_mut() {
                            Some(t) => { t.tick().await; }
                            None => std::future::pending::<()>().await,
                        }
                    } => RefreshTrigger::Interval,
                    _ = inner.milestone.notified() => RefreshTrigger::Milestone,
                };
                let _ = inner.refresh(trigger).await;
            }
            tracing::debug!("Session refresh loop stopped");
        }));

        tracing::info!(
            interval_secs = self.inner.config.interval_secs,
            every_n_requests = self.inner.config.every_n_requests,
            "Session refresh scheduler started"
        );
    }

    /// Count a successfully completed request; returns true on a milestone
    pub fn record_completion(&self) -> bool {
        let completed = self.inner.completed.fetch_add(1, Ordering::AcqRel) + 1;
        let every = self.inner.config.every_n_requests;
        let milestone = self.inner.config.enabled && every > 0 && completed % every == 0;
        if milestone {
            tracing::debug!(completed, "Refresh milestone reached");
            self.inner.milestone.notify_one();
        }
        milestone
    }

    /// Run a refresh now; `Ok(false)` means nothing was persisted
    pub async fn refresh(&self, trigger: RefreshTrigger) -> Result<bool> {
        self.inner.refresh(trigger).await
    }

    /// Number of successful refreshes so far
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Acquire)
    }

    /// Stop the loop and run the shutdown refresh if configured
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        if self.inner.config.enabled && self.inner.config.on_shutdown {
            let _ = self.inner.refresh(RefreshTrigger::Shutdown).await;
        }
    }
}

impl RefreshInner {
    async fn refresh(&self, trigger: RefreshTrigger) -> Result<bool> {
        // Overlapping triggers coalesce into the refresh already running.
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!(?trigger, "Refresh already in progress");
            return Ok(false);
        };

        let result = self.persist().await;
        match &result {
            Ok(true) => {
                self.refreshes.fetch_add(1, Ordering::AcqRel);
                tracing::info!(?trigger, "Session state refreshed");
            }
            Ok(false) => tracing::debug!(?trigger, "Nothing to refresh"),
            Err(e) => tracing::warn!(?trigger, error = %e, "Session refresh failed"),
        }
        result
    }

    async fn persist(&self) -> Result<bool> {
        let session = match self.session.read() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let Some(session) = session else {
            return Ok(false);
        };

        let profile = self.credentials.active_profile()?;
        if profile.id != session.profile_id {
            tracing::debug!(
                session_profile = %session.profile_id,
                active_profile = %profile.id,
                "Skipping refresh of a replaced session"
            );
            return Ok(false);
        }

        match self.boundary.snapshot_session(&session).await? {
            Some(state) => {
                self.store.save_session_state(&profile.id, &state)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
