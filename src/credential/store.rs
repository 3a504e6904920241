//! Credential profile storage
//!
//! A credential store is a set of named profiles plus an "active" pointer.
//! Rotation only moves the pointer; profiles are never deleted.

use crate::error::{BridgeError, Result};
use crate::state::write_atomic;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// A profile as listed by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileEntry {
    pub id: String,
    /// Storage location reference (file path, key, ...)
    pub location: String,
}

/// Trait for credential profile storage backends
pub trait CredentialStore: Send + Sync {
    /// List all profiles, sorted by id
    fn list(&self) -> Result<Vec<ProfileEntry>>;

    /// Read the active pointer
    fn active(&self) -> Result<Option<String>>;

    /// Move the active pointer
    fn set_active(&self, profile_id: &str) -> Result<()>;

    /// Merge refreshed session state into a stored profile
    fn save_session_state(&self, profile_id: &str, state: &serde_json::Value) -> Result<()>;
}

/// Directory of `<id>.json` profiles with a `.active` pointer file
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub const ACTIVE_POINTER: &'static str = ".active";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn profile_path(&self, profile_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", profile_id))
    }
}

impl CredentialStore for FileCredentialStore {
    fn list(&self) -> Result<Vec<ProfileEntry>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            BridgeError::Store(format!(
                "Failed to read credential directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut profiles = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                profiles.push(ProfileEntry {
                    id: id.to_string(),
                    location: path.display().to_string(),
                });
            }
        }
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(profiles)
    }

    fn active(&self) -> Result<Option<String>> {
        let pointer = self.dir.join(Self::ACTIVE_POINTER);
        if !pointer.exists() {
            return Ok(None);
        }
        let id = std::fs::read_to_string(&pointer)?;
        let id = id.trim();
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    fn set_active(&self, profile_id: &str) -> Result<()> {
        if !self.profile_path(profile_id).exists() {
            return Err(BridgeError::NotFound(format!(
                "Credential profile not found: {}",
                profile_id
            )));
        }
        write_atomic(&self.dir.join(Self::ACTIVE_POINTER), profile_id.as_bytes())?;
        tracing::debug!(profile = %profile_id, "Active pointer updated");
        Ok(())
    }

    fn save_session_state(&self, profile_id: &str, state: &serde_json::Value) -> Result<()> {
        let path = self.profile_path(profile_id);
        if !path.exists() {
            return Err(BridgeError::NotFound(format!(
                "Credential profile not found: {}",
                profile_id
            )));
        }

        // Keep custom fields of the existing profile; refreshed keys win.
        let mut merged = match std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        match state {
            serde_json::Value::Object(fresh) => {
                for (key, value) in fresh {
                    merged.insert(key.clone(), value.clone());
                }
            }
            other => {
                merged.insert("state".to_string(), other.clone());
            }
        }

        let json = serde_json::to_string_pretty(&serde_json::Value::Object(merged))?;
        write_atomic(&path, json.as_bytes())?;
        tracing::debug!(profile = %profile_id, path = %path.display(), "Session state saved");
        Ok(())
    }
}

/// In-memory credential store for testing
#[derive(Default)]
pub struct MemoryCredentialStore {
    profiles: RwLock<BTreeMap<String, serde_json::Value>>,
    active: RwLock<Option<String>>,
    saves: RwLock<HashMap<String, usize>>,
}

impl MemoryCredentialStore {
    /// Store pre-populated with empty profiles
    pub fn with_profiles<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::default();
        if let Ok(mut profiles) = store.profiles.write() {
            for id in ids {
                profiles.insert(id.into(), serde_json::json!({}));
            }
        }
        store
    }

    /// Stored state of a profile
    pub fn profile_state(&self, profile_id: &str) -> Option<serde_json::Value> {
        self.profiles.read().ok()?.get(profile_id).cloned()
    }

    /// Number of session-state saves for a profile
    pub fn save_count(&self, profile_id: &str) -> usize {
        self.saves
            .read()
            .ok()
            .and_then(|s| s.get(profile_id).copied())
            .unwrap_or(0)
    }
}

fn poisoned(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Store(format!("Failed to acquire credential store lock: {}", e))
}

impl CredentialStore for MemoryCredentialStore {
    fn list(&self) -> Result<Vec<ProfileEntry>> {
        let profiles = self.profiles.read().map_err(poisoned)?;
        Ok(profiles
            .keys()
            .map(|id| ProfileEntry {
                id: id.clone(),
                location: format!("memory://{}", id),
            })
            .collect())
    }

    fn active(&self) -> Result<Option<String>> {
        Ok(self.active.read().map_err(poisoned)?.clone())
    }

    fn set_active(&self, profile_id: &str) -> Result<()> {
        if !self.profiles.read().map_err(poisoned)?.contains_key(profile_id) {
            return Err(BridgeError::NotFound(format!(
                "Credential profile not found: {}",
                profile_id
            )));
        }
        *self.active.write().map_err(poisoned)? = Some(profile_id.to_string());
        Ok(())
    }

    fn save_session_state(&self, profile_id: &str, state: &serde_json::Value) -> Result<()> {
        let mut profiles = self.profiles.write().map_err(poisoned)?;
        let slot = profiles.get_mut(profile_id).ok_or_else(|| {
            BridgeError::NotFound(format!("Credential profile not found: {}", profile_id))
        })?;
        *slot = state.clone();
        *self
            .saves
            .write()
            .map_err(poisoned)?
            .entry(profile_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }
}
