//! Bridge configuration
//!
//! `BridgeConfig` is built programmatically (`Default` + field overrides),
//! loaded from a JSON file with `from_file`, or adjusted from environment
//! variables with `apply_env`. The library never reads configuration on its
//! own; callers decide where it comes from.

use crate::error::{BridgeError, Result};
use crate::tools::FunctionCallingMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub queue: QueueConfig,
    pub stream: StreamConfig,
    pub quota: QuotaConfig,
    pub tools: ToolsConfig,
    pub refresh: RefreshConfig,
}

/// Admission queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Queue depth above which a warning is logged (no hard cap)
    pub soft_warning_depth: usize,
    /// Interval after which a waiting caller is told "still queued"
    pub admission_wait_ms: u64,
    /// How long terminal requests remain visible to `inspect()`
    pub retention_ms: u64,
    /// Grace period for an interrupted Active request to stop producing
    pub cancel_grace_ms: u64,
    /// Per-request chunk buffer between assembler and caller
    pub stream_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            soft_warning_depth: 5,
            admission_wait_ms: 30_000,
            retention_ms: 60_000,
            cancel_grace_ms: 5_000,
            stream_buffer: 16,
        }
    }
}

impl QueueConfig {
    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Stream assembly settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    /// Relay silence after which the direct path takes over
    pub relay_silence_ms: u64,
    /// Global silence (no chunk from either path) that fails the request
    pub silence_timeout_ms: u64,
    /// Total request duration cap
    pub total_timeout_ms: u64,
    /// Relay reopen attempts after transient errors
    pub relay_retries: u32,
    /// Base delay for relay reopen backoff
    pub relay_retry_base_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            relay_silence_ms: 5_000,
            silence_timeout_ms: 60_000,
            total_timeout_ms: 300_000,
            relay_retries: 2,
            relay_retry_base_ms: 200,
        }
    }
}

impl StreamConfig {
    pub fn relay_silence(&self) -> Duration {
        Duration::from_millis(self.relay_silence_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    /// Exponential backoff for relay reopen attempt `attempt` (0-indexed)
    pub fn relay_retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.relay_retry_base_ms
                .saturating_mul(1u64 << attempt.min(10)),
        )
    }
}

/// Quota thresholds and credential rotation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaConfig {
    pub soft_limit: u64,
    pub hard_limit: u64,
    /// Per-model hard-limit overrides (model id, lowercase)
    pub model_limits: HashMap<String, u64>,
    /// Cooldown applied to a profile rotated out by the soft threshold
    pub rate_limit_cooldown_secs: u64,
    /// Cooldown applied to a profile the remote side reports as exhausted
    pub cooldown_secs: u64,
    pub select_best_on_startup: bool,
    /// Rotations allowed per 60s window before reporting exhaustion
    pub max_rotations_per_minute: usize,
    /// Persisted quota state file (None = in-memory)
    pub state_file: Option<PathBuf>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            soft_limit: 650_000,
            hard_limit: 800_000,
            model_limits: HashMap::new(),
            rate_limit_cooldown_secs: 300,
            cooldown_secs: 14_400,
            select_best_on_startup: true,
            max_rotations_per_minute: 3,
            state_file: None,
        }
    }
}

/// Function-calling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    pub mode: FunctionCallingMode,
    /// Native UI attempts before falling back (auto) or failing (native)
    pub native_retries: u32,
    pub ui_timeout_ms: u64,
    pub cache_enabled: bool,
    /// 0 = entries live for the current session
    pub cache_ttl_secs: u64,
    pub uppercase_types: bool,
    pub propagate_thought_signature: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mode: FunctionCallingMode::Emulated,
            native_retries: 2,
            ui_timeout_ms: 5_000,
            cache_enabled: true,
            cache_ttl_secs: 0,
            uppercase_types: false,
            propagate_thought_signature: true,
        }
    }
}

/// Session-state refresh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Refresh after every N completed requests (0 = off)
    pub every_n_requests: u64,
    pub on_shutdown: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 1_800,
            every_n_requests: 10,
            on_shutdown: true,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: BridgeConfig = serde_json::from_str(&content).map_err(|e| {
            BridgeError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_vars(std::env::vars());
    }

    /// Apply overrides from an explicit variable list
    pub fn apply_vars<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                "QUOTA_SOFT_LIMIT" => set_parsed(key, value, &mut self.quota.soft_limit),
                "QUOTA_HARD_LIMIT" => set_parsed(key, value, &mut self.quota.hard_limit),
                "QUOTA_EXCEEDED_COOLDOWN_SECONDS" => {
                    set_parsed(key, value, &mut self.quota.cooldown_secs)
                }
                "RATE_LIMIT_COOLDOWN_SECONDS" => {
                    set_parsed(key, value, &mut self.quota.rate_limit_cooldown_secs)
                }
                "SILENCE_TIMEOUT_MS" => {
                    set_parsed(key, value, &mut self.stream.silence_timeout_ms)
                }
                "RESPONSE_COMPLETION_TIMEOUT" => {
                    set_parsed(key, value, &mut self.stream.total_timeout_ms)
                }
                "FUNCTION_CALLING_MODE" => match value.parse::<FunctionCallingMode>() {
                    Ok(mode) => self.tools.mode = mode,
                    Err(e) => tracing::warn!(key, value, error = %e, "Ignoring invalid setting"),
                },
                "FUNCTION_CALLING_NATIVE_RETRY_COUNT" => {
                    set_parsed(key, value, &mut self.tools.native_retries)
                }
                "FUNCTION_CALLING_UI_TIMEOUT" => {
                    set_parsed(key, value, &mut self.tools.ui_timeout_ms)
                }
                "FUNCTION_CALLING_CACHE_ENABLED" => {
                    set_bool(key, value, &mut self.tools.cache_enabled)
                }
                "FUNCTION_CALLING_CACHE_TTL" => {
                    set_parsed(key, value, &mut self.tools.cache_ttl_secs)
                }
                "FUNCTION_CALLING_UPPERCASE_TYPES" => {
                    set_bool(key, value, &mut self.tools.uppercase_types)
                }
                "FUNCTION_CALLING_THOUGHT_SIGNATURE" => {
                    set_bool(key, value, &mut self.tools.propagate_thought_signature)
                }
                "COOKIE_REFRESH_ENABLED" => set_bool(key, value, &mut self.refresh.enabled),
                "COOKIE_REFRESH_INTERVAL_SECONDS" => {
                    set_parsed(key, value, &mut self.refresh.interval_secs)
                }
                "COOKIE_REFRESH_REQUEST_INTERVAL" => {
                    set_parsed(key, value, &mut self.refresh.every_n_requests)
                }
                "COOKIE_REFRESH_ON_SHUTDOWN" => set_bool(key, value, &mut self.refresh.on_shutdown),
                _ => {
                    if let Some(model) = key.strip_prefix("QUOTA_LIMIT_") {
                        match value.parse::<u64>() {
                            Ok(limit) => {
                                self.quota.model_limits.insert(model.to_lowercase(), limit);
                            }
                            Err(e) => {
                                tracing::warn!(key, value, error = %e, "Ignoring invalid setting")
                            }
                        }
                    }
                }
            }
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.quota.soft_limit > self.quota.hard_limit {
            return Err(BridgeError::Config(format!(
                "softLimit ({}) must not exceed hardLimit ({})",
                self.quota.soft_limit, self.quota.hard_limit
            )));
        }
        if self.queue.stream_buffer == 0 {
            return Err(BridgeError::Config(
                "streamBuffer must be at least 1".to_string(),
            ));
        }
        if self.stream.silence_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "silenceTimeoutMs must be greater than 0".to_string(),
            ));
        }
        if self.stream.relay_silence_ms >= self.stream.silence_timeout_ms {
            return Err(BridgeError::Config(format!(
                "relaySilenceMs ({}) must be shorter than silenceTimeoutMs ({})",
                self.stream.relay_silence_ms, self.stream.silence_timeout_ms
            )));
        }
        Ok(())
    }
}

fn set_parsed<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T)
where
    T::Err: std::fmt::Display,
{
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(e) => tracing::warn!(key, value, error = %e, "Ignoring invalid setting"),
    }
}

fn set_bool(key: &str, value: &str, slot: &mut bool) {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => *slot = true,
        "false" | "0" | "no" | "off" => *slot = false,
        _ => tracing::warn!(key, value, "Ignoring invalid boolean setting"),
    }
}
