//! Quota state persistence
//!
//! Per-profile, per-model usage counters and profile statuses survive
//! process restarts through a pluggable `QuotaStateStore`. The tracker
//! saves after every change and loads once on construction.

use crate::credential::ProfileStatus;
use crate::error::{BridgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Persisted state of one credential profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileQuotaState {
    /// Cumulative tokens per model id
    #[serde(default)]
    pub usage: BTreeMap<String, u64>,
    #[serde(default)]
    pub status: Option<ProfileStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated: Option<DateTime<Utc>>,
}

/// Full persisted quota state (profile id → state)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileQuotaState>,
}

impl QuotaSnapshot {
    /// Total usage of a profile across all models
    pub fn total_usage(&self, profile_id: &str) -> u64 {
        self.profiles
            .get(profile_id)
            .map(|p| p.usage.values().sum())
            .unwrap_or(0)
    }
}

/// Trait for persisting quota state
pub trait QuotaStateStore: Send + Sync {
    /// Save the full snapshot
    fn save(&self, snapshot: &QuotaSnapshot) -> Result<()>;

    /// Load the last saved snapshot (empty if none)
    fn load(&self) -> Result<QuotaSnapshot>;
}

/// JSON file-based quota store
///
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileQuotaStore {
    path: PathBuf,
}

impl FileQuotaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QuotaStateStore for FileQuotaStore {
    fn save(&self, snapshot: &QuotaSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(snapshot)?;
        write_atomic(&self.path, json.as_bytes())?;
        tracing::debug!(path = %self.path.display(), "Quota state saved");
        Ok(())
    }

    fn load(&self) -> Result<QuotaSnapshot> {
        if !self.path.exists() {
            return Ok(QuotaSnapshot::default());
        }

        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            BridgeError::Store(format!(
                "Failed to read quota state {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let snapshot: QuotaSnapshot = serde_json::from_str(&json).map_err(|e| {
            BridgeError::Store(format!(
                "Failed to parse quota state {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            profiles = snapshot.profiles.len(),
            "Quota state loaded"
        );
        Ok(snapshot)
    }
}

/// In-memory quota store for testing
#[derive(Default)]
pub struct MemoryQuotaStore {
    state: std::sync::RwLock<QuotaSnapshot>,
}

impl QuotaStateStore for MemoryQuotaStore {
    fn save(&self, snapshot: &QuotaSnapshot) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| BridgeError::Store(format!("Failed to acquire state lock: {}", e)))?;
        *state = snapshot.clone();
        Ok(())
    }

    fn load(&self) -> Result<QuotaSnapshot> {
        let state = self
            .state
            .read()
            .map_err(|e| BridgeError::Store(format!("Failed to acquire state lock: {}", e)))?;
        Ok(state.clone())
    }
}

/// Write a file atomically: temp file in the same directory, then rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            BridgeError::Store(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    std::fs::write(&tmp_path, bytes).map_err(|e| {
        BridgeError::Store(format!(
            "Failed to write {}: {}",
            tmp_path.display(),
            e
        ))
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        BridgeError::Store(format!(
            "Failed to rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        ))
    })?;
    Ok(())
}
