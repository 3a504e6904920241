//! Per-credential usage counters and thresholds
//!
//! Counters are cumulative and only ever increase. Increments use atomics so
//! completion bookkeeping can race with readers (the rotation manager)
//! without a write lock on the hot path.

use crate::config::QuotaConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Usage level relative to a model's thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaLevel {
    Normal,
    Soft,
    Hard,
}

/// Soft and hard thresholds with per-model overrides
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaThresholds {
    pub soft: u64,
    pub hard: u64,
    /// Per-model hard limits; soft scales by `soft / hard`
    pub model_limits: HashMap<String, u64>,
}

impl QuotaThresholds {
    pub fn new(soft: u64, hard: u64) -> Self {
        Self {
            soft,
            hard,
            model_limits: HashMap::new(),
        }
    }

    pub fn from_config(config: &QuotaConfig) -> Self {
        Self {
            soft: config.soft_limit,
            hard: config.hard_limit,
            model_limits: config
                .model_limits
                .iter()
                .map(|(k, v)| (normalize_model_id(k), *v))
                .collect(),
        }
    }

    pub fn with_model_limit(mut self, model_id: &str, hard: u64) -> Self {
        self.model_limits.insert(normalize_model_id(model_id), hard);
        self
    }

    /// (soft, hard) thresholds for a model
    pub fn for_model(&self, model_id: &str) -> (u64, u64) {
        match self.model_limits.get(&normalize_model_id(model_id)) {
            Some(&hard) if self.hard > 0 => {
                let soft = (hard as u128 * self.soft as u128 / self.hard as u128) as u64;
                (soft, hard)
            }
            Some(&hard) => (hard, hard),
            None => (self.soft, self.hard),
        }
    }

    /// Level reached by `usage` tokens on `model_id`
    pub fn level(&self, model_id: &str, usage: u64) -> QuotaLevel {
        let (soft, hard) = self.for_model(model_id);
        if usage >= hard {
            QuotaLevel::Hard
        } else if usage >= soft {
            QuotaLevel::Soft
        } else {
            QuotaLevel::Normal
        }
    }
}

/// Outcome of recording usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub profile_id: String,
    pub model_id: String,
    pub total: u64,
    pub previous: QuotaLevel,
    pub level: QuotaLevel,
}

impl UsageRecord {
    /// The threshold newly crossed by this increment, if any
    pub fn crossed(&self) -> Option<QuotaLevel> {
        (self.level > self.previous).then_some(self.level)
    }
}

type ModelCounters = HashMap<String, Arc<AtomicU64>>;

/// Per-profile, per-model cumulative usage counters
pub struct QuotaTracker {
    thresholds: QuotaThresholds,
    counters: RwLock<HashMap<String, ModelCounters>>,
}

impl QuotaTracker {
    pub fn new(thresholds: QuotaThresholds) -> Self {
        Self {
            thresholds,
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> &QuotaThresholds {
        &self.thresholds
    }

    /// Add `tokens` to a profile's counter for a model
    pub fn record(&self, profile_id: &str, model_id: &str, tokens: u64) -> UsageRecord {
        let model_id = normalize_model_id(model_id);
        let counter = self.counter(profile_id, &model_id);
        let before = counter.fetch_add(tokens, Ordering::AcqRel);
        let total = before.saturating_add(tokens);

        let record = UsageRecord {
            profile_id: profile_id.to_string(),
            previous: self.thresholds.level(&model_id, before),
            level: self.thresholds.level(&model_id, total),
            model_id,
            total,
        };

        tracing::debug!(
            profile = %record.profile_id,
            model = %record.model_id,
            tokens,
            total,
            level = ?record.level,
            "Usage recorded"
        );
        record
    }

    /// Cumulative usage of a profile for one model
    pub fn usage(&self, profile_id: &str, model_id: &str) -> u64 {
        let model_id = normalize_model_id(model_id);
        self.read_counters()
            .get(profile_id)
            .and_then(|models| models.get(&model_id))
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Cumulative usage of a profile across all models
    pub fn total_usage(&self, profile_id: &str) -> u64 {
        self.read_counters()
            .get(profile_id)
            .map(|models| models.values().map(|c| c.load(Ordering::Acquire)).sum())
            .unwrap_or(0)
    }

    /// Highest level any model of this profile has reached
    pub fn level(&self, profile_id: &str) -> QuotaLevel {
        self.read_counters()
            .get(profile_id)
            .map(|models| {
                models
                    .iter()
                    .map(|(model, c)| self.thresholds.level(model, c.load(Ordering::Acquire)))
                    .max()
                    .unwrap_or(QuotaLevel::Normal)
            })
            .unwrap_or(QuotaLevel::Normal)
    }

    /// Level of a profile for one model
    pub fn model_level(&self, profile_id: &str, model_id: &str) -> QuotaLevel {
        self.thresholds
            .level(model_id, self.usage(profile_id, model_id))
    }

    /// Copy of all counters (profile → model → tokens)
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        self.read_counters()
            .iter()
            .map(|(profile, models)| {
                let models = models
                    .iter()
                    .map(|(m, c)| (m.clone(), c.load(Ordering::Acquire)))
                    .collect();
                (profile.clone(), models)
            })
            .collect()
    }

    /// Seed counters from persisted state, keeping the larger value
    pub fn restore(&self, usage: &BTreeMap<String, BTreeMap<String, u64>>) {
        for (profile, models) in usage {
            for (model, tokens) in models {
                self.counter(profile, &normalize_model_id(model))
                    .fetch_max(*tokens, Ordering::AcqRel);
            }
        }
    }

    fn counter(&self, profile_id: &str, model_id: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self
            .read_counters()
            .get(profile_id)
            .and_then(|models| models.get(model_id))
        {
            return counter.clone();
        }

        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters
            .entry(profile_id.to_string())
            .or_default()
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    fn read_counters(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ModelCounters>> {
        // Counters stay consistent under poisoning: every mutation is a single atomic op.
        self.counters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Canonical model key: lowercase, whitespace collapsed to hyphens
pub fn normalize_model_id(model_id: &str) -> String {
    let trimmed = model_id.trim();
    if trimmed.is_empty() {
        return "default".to_string();
    }
    trimmed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> QuotaTracker {
        QuotaTracker::new(QuotaThresholds::new(100, 200))
    }

    #[test]
    fn test_normalize_model_id() {
        assert_eq!(
            normalize_model_id("Gemini 3 Pro Preview"),
            "gemini-3-pro-preview"
        );
        assert_eq!(normalize_model_id("gemini-2.5-pro"), "gemini-2.5-pro");
        assert_eq!(normalize_model_id("  "), "default");
    }

    #[test]
    fn test_levels() {
        let t = QuotaThresholds::new(100, 200);
        assert_eq!(t.level("m", 99), QuotaLevel::Normal);
        assert_eq!(t.level("m", 100), QuotaLevel::Soft);
        assert_eq!(t.level("m", 200), QuotaLevel::Hard);
    }

    #[test]
    fn test_model_override_scales_soft() {
        let t = QuotaThresholds::new(650, 800).with_model_limit("Gemini 2.5 Pro", 400);
        assert_eq!(t.for_model("gemini-2.5-pro"), (325, 400));
        assert_eq!(t.for_model("other"), (650, 800));
    }

    #[test]
    fn test_record_reports_crossings_once() {
        let tracker = tracker();
        let first = tracker.record("alpha", "m", 50);
        assert_eq!(first.crossed(), None);

        let second = tracker.record("alpha", "m", 60);
        assert_eq!(second.total, 110);
        assert_eq!(second.crossed(), Some(QuotaLevel::Soft));

        let third = tracker.record("alpha", "m", 10);
        assert_eq!(third.crossed(), None);

        let fourth = tracker.record("alpha", "m", 500);
        assert_eq!(fourth.crossed(), Some(QuotaLevel::Hard));
        assert_eq!(tracker.level("alpha"), QuotaLevel::Hard);
    }

    #[test]
    fn test_counters_are_per_profile_and_model() {
        let tracker = tracker();
        tracker.record("alpha", "m1", 10);
        tracker.record("alpha", "m2", 20);
        tracker.record("beta", "m1", 5);

        assert_eq!(tracker.usage("alpha", "m1"), 10);
        assert_eq!(tracker.total_usage("alpha"), 30);
        assert_eq!(tracker.total_usage("beta"), 5);
        assert_eq!(tracker.total_usage("gamma"), 0);
    }

    #[test]
    fn test_snapshot_restore_keeps_max() {
        let tracker = tracker();
        tracker.record("alpha", "m", 40);
        let snapshot = tracker.snapshot();

        let other = QuotaTracker::new(QuotaThresholds::new(100, 200));
        other.record("alpha", "m", 70);
        other.restore(&snapshot);
        assert_eq!(other.usage("alpha", "m"), 70);

        let fresh = QuotaTracker::new(QuotaThresholds::new(100, 200));
        fresh.restore(&snapshot);
        assert_eq!(fresh.usage("alpha", "m"), 40);
    }

    #[test]
    fn test_concurrent_increments() {
        let tracker = Arc::new(tracker());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        tracker.record("alpha", "m", 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.usage("alpha", "m"), 8000);
    }
}
