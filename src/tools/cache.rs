//! Negotiated tool-invocation strategy cache
//!
//! Keyed by schema fingerprint. A TTL of zero keeps entries for the whole
//! session; `invalidate_all` runs whenever the session is replaced.
//!
//! The live session holds one native declaration set at a time, so the
//! fingerprint last declared on it is tracked apart from the strategy map.

use super::{Fingerprint, InvocationStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// UI-side state recorded alongside the strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityFlags {
    /// Native tool toggle was switched on
    pub toggle_enabled: bool,
    /// Native declarations were accepted
    pub declarations_set: bool,
    /// Emulated mode was reached through a failed native attempt
    pub fell_back: bool,
}

/// Cached negotiation result for one schema fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocationCacheEntry {
    pub strategy: InvocationStrategy,
    pub flags: CompatibilityFlags,
    pub model: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    recorded_at: Instant,
}

impl ToolInvocationCacheEntry {
    pub fn new(strategy: InvocationStrategy, flags: CompatibilityFlags) -> Self {
        Self {
            strategy,
            flags,
            model: None,
            last_success: None,
            recorded_at: Instant::now(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn age(&self) -> Duration {
        self.recorded_at.elapsed()
    }
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ToolInvocationCache {
    enabled: bool,
    ttl: Option<Duration>,
    entries: RwLock<HashMap<Fingerprint, ToolInvocationCacheEntry>>,
    declared: RwLock<Option<Fingerprint>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ToolInvocationCache {
    /// `ttl_secs == 0` means entries live until `invalidate_all`
    pub fn new(enabled: bool, ttl_secs: u64) -> Self {
        Self {
            enabled,
            ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
            entries: RwLock::new(HashMap::new()),
            declared: RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a live entry; a different model counts as a miss
    pub fn lookup(
        &self,
        fingerprint: &Fingerprint,
        model: &str,
    ) -> Option<ToolInvocationCacheEntry> {
        if !self.enabled {
            return None;
        }
        let hit = self
            .entries
            .read()
            .ok()
            .and_then(|entries| entries.get(fingerprint).cloned())
            .filter(|entry| self.ttl.map(|ttl| entry.age() <= ttl).unwrap_or(true))
            .filter(|entry| entry.model.as_deref().map(|m| m == model).unwrap_or(true));

        match &hit {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    fingerprint = %fingerprint,
                    strategy = %entry.strategy,
                    "Tool cache hit"
                );
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint = %fingerprint, "Tool cache miss");
            }
        }
        hit
    }

    /// Insert or overwrite the entry for a fingerprint
    pub fn record(&self, fingerprint: Fingerprint, entry: ToolInvocationCacheEntry) {
        if !self.enabled {
            return;
        }
        tracing::debug!(
            fingerprint = %fingerprint,
            strategy = %entry.strategy,
            fell_back = entry.flags.fell_back,
            "Tool cache updated"
        );
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(fingerprint, entry);
        }
    }

    /// Stamp a successful use of the cached strategy
    pub fn mark_success(&self, fingerprint: &Fingerprint) {
        if let Ok(mut entries) = self.entries.write() {
            if let Some(entry) = entries.get_mut(fingerprint) {
                entry.last_success = Some(Utc::now());
            }
        }
    }

    /// Whether these declarations are the ones currently set on the session
    pub fn is_declared(&self, fingerprint: &Fingerprint) -> bool {
        self.enabled
            && self
                .declared
                .read()
                .map(|declared| declared.as_ref() == Some(fingerprint))
                .unwrap_or(false)
    }

    /// Record the declaration set now active on the session
    pub fn set_declared(&self, fingerprint: Option<Fingerprint>) {
        if let Ok(mut declared) = self.declared.write() {
            *declared = fingerprint;
        }
    }

    /// Drop every entry (session replaced)
    pub fn invalidate_all(&self, reason: &str) {
        if let Ok(mut entries) = self.entries.write() {
            if !entries.is_empty() {
                tracing::info!(entries = entries.len(), reason, "Tool cache invalidated");
            }
            entries.clear();
        }
        self.set_declared(None);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.enabled,
            entries: self.entries.read().map(|e| e.len()).unwrap_or(0),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
