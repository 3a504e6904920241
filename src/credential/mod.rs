//! Credential profiles and rotation
//!
//! `CredentialRotationManager` is the single owner of the active-profile
//! pointer. Callers never hold a "current profile" of their own; they ask
//! the manager through its operations. At most one profile is Active at any
//! time, and the Active profile is never Exhausted.
//!
//! ## Rotation policy
//!
//! - Crossing the **soft** threshold marks a rotation as pending. It is
//!   performed by `rotate_if_needed()`, which the queue worker calls before
//!   admitting the next request, so the in-flight request finishes untouched.
//! - Crossing the **hard** threshold (or a remote quota signal) exhausts the
//!   profile and moves the pointer immediately.
//! - The next profile is chosen round-robin among eligible profiles,
//!   preferring those still below their soft threshold.

pub mod store;

use crate::boundary::PathErrorKind;
use crate::config::QuotaConfig;
use crate::error::{BridgeError, Result};
use crate::quota::{QuotaLevel, QuotaTracker, UsageRecord};
use crate::state::{ProfileQuotaState, QuotaSnapshot, QuotaStateStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore, ProfileEntry};

/// Status of a credential profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileStatus {
    /// Currently serving requests
    Active,
    /// Eligible, not active
    Available,
    /// Temporarily ineligible until its cooldown expires
    Cooldown,
    /// Quota exhausted; ineligible until restored
    Exhausted,
    /// Unusable (bad credentials, session could not be opened)
    Invalid,
}

/// A saved authentication identity usable to drive the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialProfile {
    pub id: String,
    pub location: String,
    pub status: ProfileStatus,
    /// Cumulative tokens per model
    pub usage: BTreeMap<String, u64>,
    pub last_rotated: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Why a rotation happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    Startup,
    SoftLimit,
    HardLimit,
    QuotaExceeded,
    RateLimited,
    SessionUnhealthy,
    Manual,
}

impl RotationReason {
    /// Graceful reasons keep the current profile when no alternative exists
    fn is_graceful(&self) -> bool {
        matches!(
            self,
            RotationReason::Startup | RotationReason::SoftLimit | RotationReason::Manual
        )
    }
}

/// Rotation lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum RotationEvent {
    Rotated {
        from: Option<String>,
        to: String,
        reason: RotationReason,
        generation: u64,
    },
    StatusChanged {
        profile_id: String,
        status: ProfileStatus,
    },
    Unavailable {
        reason: RotationReason,
    },
}

struct ProfileSlot {
    id: String,
    location: String,
    status: ProfileStatus,
    last_rotated: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
}

impl ProfileSlot {
    /// Lift expired cooldowns; returns true when the status changed
    fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == ProfileStatus::Cooldown
            && self.cooldown_until.map(|t| t <= now).unwrap_or(true)
        {
            self.status = ProfileStatus::Available;
            self.cooldown_until = None;
            return true;
        }
        false
    }

    fn is_eligible(&self) -> bool {
        matches!(self.status, ProfileStatus::Active | ProfileStatus::Available)
    }
}

struct RotationState {
    profiles: Vec<ProfileSlot>,
    active: Option<usize>,
    pending: Option<RotationReason>,
    rotations: VecDeque<Instant>,
    generation: u64,
}

const ROTATION_WINDOW: Duration = Duration::from_secs(60);

/// Owner of the credential pool and the active pointer
pub struct CredentialRotationManager {
    store: Arc<dyn CredentialStore>,
    quota: Arc<QuotaTracker>,
    state_store: Arc<dyn QuotaStateStore>,
    config: QuotaConfig,
    state: Mutex<RotationState>,
    events: broadcast::Sender<RotationEvent>,
}

impl CredentialRotationManager {
    /// Build the manager from a credential store and persisted quota state
    ///
    /// The store's active pointer is honoured when it names an eligible
    /// profile; `initialize()` applies the startup selection policy.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        quota: Arc<QuotaTracker>,
        state_store: Arc<dyn QuotaStateStore>,
        config: QuotaConfig,
    ) -> Result<Self> {
        let snapshot = state_store.load()?;
        let usage: BTreeMap<_, _> = snapshot
            .profiles
            .iter()
            .map(|(id, p)| (id.clone(), p.usage.clone()))
            .collect();
        quota.restore(&usage);

        let now = Utc::now();
        let mut profiles: Vec<ProfileSlot> = store
            .list()?
            .into_iter()
            .map(|entry| {
                let saved = snapshot.profiles.get(&entry.id);
                let status = match saved.and_then(|s| s.status) {
                    Some(ProfileStatus::Active) | None => ProfileStatus::Available,
                    Some(other) => other,
                };
                let mut slot = ProfileSlot {
                    id: entry.id,
                    location: entry.location,
                    status,
                    last_rotated: saved.and_then(|s| s.last_rotated),
                    cooldown_until: saved.and_then(|s| s.cooldown_until),
                };
                slot.refresh(now);
                slot
            })
            .collect();

        let mut active = None;
        if let Some(pointer) = store.active()? {
            if let Some(idx) = profiles.iter().position(|p| p.id == pointer) {
                if profiles[idx].is_eligible() {
                    profiles[idx].status = ProfileStatus::Active;
                    active = Some(idx);
                }
            }
        }

        tracing::info!(
            profiles = profiles.len(),
            active = ?active.map(|i| profiles[i].id.clone()),
            "Credential pool loaded"
        );

        let (events, _) = broadcast::channel(64);
        Ok(Self {
            store,
            quota,
            state_store,
            config,
            state: Mutex::new(RotationState {
                profiles,
                active,
                pending: None,
                rotations: VecDeque::new(),
                generation: 0,
            }),
            events,
        })
    }

    /// Apply the startup policy
    ///
    /// With `select_best_on_startup` the least-used eligible profile becomes
    /// active; otherwise the stored pointer is kept and only filled in when
    /// empty.
    pub fn initialize(&self) -> Result<CredentialProfile> {
        let has_active = self.lock()?.active.is_some();
        if self.config.select_best_on_startup || !has_active {
            self.select_best()
        } else {
            self.active_profile()
        }
    }

    /// Subscribe to rotation events
    pub fn subscribe(&self) -> broadcast::Receiver<RotationEvent> {
        self.events.subscribe()
    }

    /// Shared quota tracker
    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    /// Bumped on every change of the active profile
    pub fn generation(&self) -> u64 {
        self.lock().map(|s| s.generation).unwrap_or(0)
    }

    /// The profile currently serving requests
    pub fn active_profile(&self) -> Result<CredentialProfile> {
        let mut state = self.lock()?;
        self.refresh_cooldowns(&mut state);
        match state.active {
            Some(idx) => Ok(self.describe(&state.profiles[idx])),
            None => Err(BridgeError::CredentialExhausted(
                "no active credential profile".to_string(),
            )),
        }
    }

    /// Snapshot of every profile
    pub fn profiles(&self) -> Result<Vec<CredentialProfile>> {
        let mut state = self.lock()?;
        self.refresh_cooldowns(&mut state);
        Ok(state.profiles.iter().map(|p| self.describe(p)).collect())
    }

    /// Whether a graceful rotation is waiting for the next admission
    pub fn has_pending_rotation(&self) -> bool {
        self.lock().map(|s| s.pending.is_some()).unwrap_or(false)
    }

    /// Record usage for a profile and react to threshold crossings
    ///
    /// Soft crossings on the active profile schedule a rotation for the next
    /// admission. Hard crossings exhaust the profile and rotate immediately;
    /// a failed immediate rotation leaves no active profile, which later
    /// admissions report as `CredentialExhausted`.
    pub fn record_usage(&self, profile_id: &str, model_id: &str, tokens: u64) -> UsageRecord {
        let record = self.quota.record(profile_id, model_id, tokens);

        if let Some(level) = record.crossed() {
            tracing::info!(
                profile = %profile_id,
                model = %record.model_id,
                total = record.total,
                level = ?level,
                "Quota threshold crossed"
            );
            let outcome = match level {
                QuotaLevel::Soft => self.schedule_rotation(profile_id, RotationReason::SoftLimit),
                QuotaLevel::Hard => self.exhaust(profile_id, RotationReason::HardLimit),
                QuotaLevel::Normal => Ok(()),
            };
            if let Err(e) = outcome {
                tracing::error!(
                    profile = %profile_id,
                    error = %e,
                    "Rotation after quota crossing failed"
                );
            }
        }

        self.persist();
        record
    }

    /// React to an in-band quota signal from the remote side
    pub fn report_signal(&self, profile_id: &str, signal: PathErrorKind) -> Result<()> {
        match signal {
            PathErrorKind::QuotaExceeded => self.exhaust(profile_id, RotationReason::QuotaExceeded),
            PathErrorKind::RateLimited => {
                let cooldown = Duration::from_secs(self.config.rate_limit_cooldown_secs);
                self.demote(
                    profile_id,
                    ProfileStatus::Cooldown,
                    Some(cooldown),
                    RotationReason::RateLimited,
                )
            }
            PathErrorKind::SessionLost => self.mark_invalid(profile_id),
            PathErrorKind::Transient | PathErrorKind::Fatal => Ok(()),
        }
    }

    /// Mark a profile unusable and rotate away from it if active
    pub fn mark_invalid(&self, profile_id: &str) -> Result<()> {
        self.demote(
            profile_id,
            ProfileStatus::Invalid,
            None,
            RotationReason::SessionUnhealthy,
        )
    }

    /// Return an exhausted, invalid, or cooling-down profile to the pool
    pub fn restore(&self, profile_id: &str) -> Result<()> {
        {
            let mut state = self.lock()?;
            let idx = Self::index_of(&state, profile_id)?;
            let slot = &mut state.profiles[idx];
            if slot.status != ProfileStatus::Active {
                slot.status = ProfileStatus::Available;
            }
            slot.cooldown_until = None;
        }
        self.emit(RotationEvent::StatusChanged {
            profile_id: profile_id.to_string(),
            status: ProfileStatus::Available,
        });
        self.persist();
        Ok(())
    }

    /// Perform a pending or required rotation
    ///
    /// Returns `Ok(true)` when the active profile changed and `Ok(false)` when
    /// nothing needed to happen (or a graceful rotation found no alternative).
    pub fn rotate_if_needed(&self) -> Result<bool> {
        let reason = {
            let mut state = self.lock()?;
            self.refresh_cooldowns(&mut state);
            match (state.pending, state.active) {
                (Some(reason), _) => reason,
                (None, None) => RotationReason::Manual,
                (None, Some(_)) => return Ok(false),
            }
        };
        let before = self.generation();
        self.rotate(reason)?;
        Ok(self.generation() != before)
    }

    /// Switch to the next eligible profile
    pub fn rotate(&self, reason: RotationReason) -> Result<CredentialProfile> {
        let result = {
            let mut state = self.lock()?;
            self.rotate_locked(&mut state, reason)
        };
        self.persist();
        result
    }

    /// Activate the least-used eligible profile
    pub fn select_best(&self) -> Result<CredentialProfile> {
        let result = {
            let mut state = self.lock()?;
            self.refresh_cooldowns(&mut state);

            let best = state
                .profiles
                .iter()
                .enumerate()
                .filter(|(_, p)| p.is_eligible())
                .min_by(|(_, a), (_, b)| {
                    let key = |p: &ProfileSlot| {
                        (self.quota.level(&p.id), self.quota.total_usage(&p.id))
                    };
                    key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id))
                })
                .map(|(idx, _)| idx);

            match best {
                Some(idx) => {
                    self.activate_locked(&mut state, idx, RotationReason::Startup);
                    Ok(self.describe(&state.profiles[idx]))
                }
                None => {
                    state.active = None;
                    drop(state);
                    self.emit(RotationEvent::Unavailable {
                        reason: RotationReason::Startup,
                    });
                    Err(BridgeError::CredentialExhausted(
                        "no eligible credential profile at startup".to_string(),
                    ))
                }
            }
        };
        self.persist();
        result
    }

    fn schedule_rotation(&self, profile_id: &str, reason: RotationReason) -> Result<()> {
        let mut state = self.lock()?;
        let is_active = state
            .active
            .map(|idx| state.profiles[idx].id == profile_id)
            .unwrap_or(false);
        if is_active && state.pending.is_none() {
            state.pending = Some(reason);
            tracing::info!(profile = %profile_id, ?reason, "Graceful rotation scheduled");
        }
        Ok(())
    }

    fn exhaust(&self, profile_id: &str, reason: RotationReason) -> Result<()> {
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        self.demote(profile_id, ProfileStatus::Exhausted, Some(cooldown), reason)
    }

    fn demote(
        &self,
        profile_id: &str,
        status: ProfileStatus,
        cooldown: Option<Duration>,
        reason: RotationReason,
    ) -> Result<()> {
        let result = {
            let mut state = self.lock()?;
            let idx = Self::index_of(&state, profile_id)?;
            let was_active = state.active == Some(idx);
            {
                let slot = &mut state.profiles[idx];
                slot.status = status;
                slot.cooldown_until = cooldown
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .map(|d| Utc::now() + d);
            }
            tracing::warn!(profile = %profile_id, ?status, ?reason, "Credential profile demoted");
            if was_active {
                state.active = None;
                self.rotate_locked(&mut state, reason).map(|_| ())
            } else {
                Ok(())
            }
        };
        self.emit(RotationEvent::StatusChanged {
            profile_id: profile_id.to_string(),
            status,
        });
        self.persist();
        result
    }

    fn rotate_locked(
        &self,
        state: &mut MutexGuard<'_, RotationState>,
        reason: RotationReason,
    ) -> Result<CredentialProfile> {
        self.refresh_cooldowns(state);

        if self.config.max_rotations_per_minute > 0 {
            let now = Instant::now();
            while state
                .rotations
                .front()
                .map(|t| now.duration_since(*t) > ROTATION_WINDOW)
                .unwrap_or(false)
            {
                state.rotations.pop_front();
            }
            if state.rotations.len() >= self.config.max_rotations_per_minute {
                tracing::error!(
                    limit = self.config.max_rotations_per_minute,
                    ?reason,
                    "Rotation depletion guard tripped"
                );
                return match (reason.is_graceful(), state.active) {
                    (true, Some(idx)) => {
                        state.pending = None;
                        Ok(self.describe(&state.profiles[idx]))
                    }
                    _ => Err(BridgeError::CredentialExhausted(format!(
                        "more than {} rotations within {}s",
                        self.config.max_rotations_per_minute,
                        ROTATION_WINDOW.as_secs()
                    ))),
                };
            }
        }

        let current = state.active;
        let count = state.profiles.len();
        let start = current.map(|i| i + 1).unwrap_or(0);
        let candidates: Vec<usize> = (0..count)
            .map(|offset| (start + offset) % count)
            .filter(|&idx| Some(idx) != current && state.profiles[idx].is_eligible())
            .collect();
        let next = candidates
            .iter()
            .copied()
            .find(|&idx| self.quota.level(&state.profiles[idx].id) == QuotaLevel::Normal)
            .or_else(|| candidates.first().copied());

        match (next, current) {
            (Some(idx), _) => {
                if let Some(old) = current {
                    let slot = &mut state.profiles[old];
                    if slot.status == ProfileStatus::Active {
                        slot.status = if reason == RotationReason::SoftLimit {
                            slot.cooldown_until = chrono::Duration::from_std(Duration::from_secs(
                                self.config.rate_limit_cooldown_secs,
                            ))
                            .ok()
                            .map(|d| Utc::now() + d);
                            ProfileStatus::Cooldown
                        } else {
                            ProfileStatus::Available
                        };
                    }
                }
                self.activate_locked(state, idx, reason);
                Ok(self.describe(&state.profiles[idx]))
            }
            (None, Some(idx)) if reason.is_graceful() => {
                tracing::warn!(
                    profile = %state.profiles[idx].id,
                    ?reason,
                    "No alternative credential profile; keeping current"
                );
                state.pending = None;
                Ok(self.describe(&state.profiles[idx]))
            }
            (None, _) => {
                state.active = None;
                state.pending = None;
                tracing::error!(?reason, "No eligible credential profile");
                self.emit(RotationEvent::Unavailable { reason });
                Err(BridgeError::CredentialExhausted(format!(
                    "all {} profiles are exhausted, invalid, or cooling down",
                    count
                )))
            }
        }
    }

    fn activate_locked(
        &self,
        state: &mut MutexGuard<'_, RotationState>,
        idx: usize,
        reason: RotationReason,
    ) {
        let from = state.active.map(|i| state.profiles[i].id.clone());
        if let Some(old) = state.active {
            if old != idx && state.profiles[old].status == ProfileStatus::Active {
                state.profiles[old].status = ProfileStatus::Available;
            }
        }

        let now = Utc::now();
        let slot = &mut state.profiles[idx];
        slot.status = ProfileStatus::Active;
        slot.cooldown_until = None;
        slot.last_rotated = Some(now);
        let to = slot.id.clone();

        state.active = Some(idx);
        state.pending = None;
        state.generation += 1;
        state.rotations.push_back(Instant::now());
        let generation = state.generation;

        if let Err(e) = self.store.set_active(&to) {
            tracing::warn!(profile = %to, error = %e, "Failed to persist active pointer");
        }
        tracing::info!(from = ?from, to = %to, ?reason, generation, "Credential profile activated");
        self.emit(RotationEvent::Rotated {
            from,
            to,
            reason,
            generation,
        });
    }

    fn refresh_cooldowns(&self, state: &mut MutexGuard<'_, RotationState>) {
        let now = Utc::now();
        for slot in state.profiles.iter_mut() {
            if slot.refresh(now) {
                tracing::info!(profile = %slot.id, "Cooldown expired");
            }
        }
    }

    fn describe(&self, slot: &ProfileSlot) -> CredentialProfile {
        let usage = self
            .quota
            .snapshot()
            .remove(&slot.id)
            .unwrap_or_default();
        CredentialProfile {
            id: slot.id.clone(),
            location: slot.location.clone(),
            status: slot.status,
            usage,
            last_rotated: slot.last_rotated,
            cooldown_until: slot.cooldown_until,
        }
    }

    fn index_of(state: &RotationState, profile_id: &str) -> Result<usize> {
        state
            .profiles
            .iter()
            .position(|p| p.id == profile_id)
            .ok_or_else(|| {
                BridgeError::NotFound(format!("Credential profile not found: {}", profile_id))
            })
    }

    fn emit(&self, event: RotationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Best-effort save of counters and statuses
    fn persist(&self) {
        let usage = self.quota.snapshot();
        let snapshot = match self.lock() {
            Ok(state) => {
                let mut snapshot = QuotaSnapshot::default();
                for slot in &state.profiles {
                    snapshot.profiles.insert(
                        slot.id.clone(),
                        ProfileQuotaState {
                            usage: usage.get(&slot.id).cloned().unwrap_or_default(),
                            status: Some(slot.status),
                            cooldown_until: slot.cooldown_until,
                            last_rotated: slot.last_rotated,
                        },
                    );
                }
                snapshot
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping quota state save");
                return;
            }
        };
        if let Err(e) = self.state_store.save(&snapshot) {
            tracing::warn!(error = %e, "Failed to save quota state");
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RotationState>> {
        self.state
            .lock()
            .map_err(|e| BridgeError::Store(format!("Credential state lock poisoned: {}", e)))
    }
}
