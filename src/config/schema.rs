use crate::bus::{ChunkSettings, CircuitBreakerSettings};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level bus configuration, loaded from `config.toml`.
///
/// Every section and field has a default, so an empty file is a valid
/// configuration. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BusConfig {
    /// Size thresholds for chunked transport (`[limits]`).
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Duplicate-publish suppression (`[dedup]`).
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Per-agent circuit breaking (`[circuit_breaker]`).
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Worker pool, retries and record retention (`[delivery]`).
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

// ── Limits ───────────────────────────────────────────────────────

/// The three thresholds are tuned independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LimitsConfig {
    /// Serialized size in bytes above which a message is split into chunks.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Serialized size in bytes above which chunked payloads are gzip+base64 encoded.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Maximum bytes per chunk fragment.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

fn default_max_message_size() -> usize {
    crate::bus::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_compression_threshold() -> usize {
    crate::bus::DEFAULT_COMPRESSION_THRESHOLD
}

fn default_max_chunk_size() -> usize {
    crate::bus::DEFAULT_MAX_CHUNK_SIZE
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            compression_threshold: default_compression_threshold(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

// ── Dedup ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DedupConfig {
    /// Maximum remembered message ids.
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
    /// How long a processed id is remembered.
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_dedup_capacity() -> usize {
    1000
}

fn default_dedup_ttl_secs() -> u64 {
    300
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: default_dedup_capacity(),
            ttl_secs: default_dedup_ttl_secs(),
        }
    }
}

// ── Circuit breaker ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed deliveries before an agent's circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting trial deliveries.
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Trial deliveries admitted while half-open; this many successes close the circuit.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

// ── Delivery ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeliveryConfig {
    /// Upper bound on threads running timeout-governed handlers.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Delivery attempts for subscriptions that do not set their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Wait bound for `require_confirmation` publishes to recipients without a timeout.
    #[serde(default = "default_confirmation_timeout_ms")]
    pub default_confirmation_timeout_ms: u64,
    /// How long shutdown waits for in-flight handlers.
    #[serde(default = "default_shutdown_drain_timeout_ms")]
    pub shutdown_drain_timeout_ms: u64,
    /// Messages whose delivery records are retained; oldest dropped first.
    #[serde(default = "default_max_delivery_records")]
    pub max_delivery_records: usize,
}

fn default_worker_threads() -> usize {
    8
}

fn default_max_retries() -> u32 {
    crate::bus::DEFAULT_MAX_RETRIES
}

fn default_confirmation_timeout_ms() -> u64 {
    30_000
}

fn default_shutdown_drain_timeout_ms() -> u64 {
    5_000
}

fn default_max_delivery_records() -> usize {
    crate::bus::DEFAULT_MAX_DELIVERY_RECORDS
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            default_max_retries: default_max_retries(),
            default_confirmation_timeout_ms: default_confirmation_timeout_ms(),
            shutdown_drain_timeout_ms: default_shutdown_drain_timeout_ms(),
            max_delivery_records: default_max_delivery_records(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl BusConfig {
    /// Parse TOML without validating.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse bus config TOML")
    }

    /// Read, parse and validate a config file.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the effective configuration.
    ///
    /// An explicit path must exist. Without one, the per-user config file is
    /// used when present, otherwise defaults. `REPAIRBUS_*` environment
    /// variables are applied last.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_path(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => {
                    tracing::debug!(path = %path.display(), "Loading bus config");
                    Self::load_from_path(&path)?
                }
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Empty or unparsable values are ignored.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = &lookup;
        override_from(lookup, "REPAIRBUS_MAX_MESSAGE_SIZE", &mut self.limits.max_message_size);
        override_from(
            lookup,
            "REPAIRBUS_COMPRESSION_THRESHOLD",
            &mut self.limits.compression_threshold,
        );
        override_from(lookup, "REPAIRBUS_MAX_CHUNK_SIZE", &mut self.limits.max_chunk_size);
        override_from(lookup, "REPAIRBUS_DEDUP_CAPACITY", &mut self.dedup.capacity);
        override_from(lookup, "REPAIRBUS_DEDUP_TTL_SECS", &mut self.dedup.ttl_secs);
        override_from(
            lookup,
            "REPAIRBUS_FAILURE_THRESHOLD",
            &mut self.circuit_breaker.failure_threshold,
        );
        override_from(
            lookup,
            "REPAIRBUS_RESET_TIMEOUT_MS",
            &mut self.circuit_breaker.reset_timeout_ms,
        );
        override_from(
            lookup,
            "REPAIRBUS_HALF_OPEN_MAX_CALLS",
            &mut self.circuit_breaker.half_open_max_calls,
        );
        override_from(lookup, "REPAIRBUS_WORKER_THREADS", &mut self.delivery.worker_threads);
        override_from(lookup, "REPAIRBUS_MAX_RETRIES", &mut self.delivery.default_max_retries);
        override_from(
            lookup,
            "REPAIRBUS_CONFIRMATION_TIMEOUT_MS",
            &mut self.delivery.default_confirmation_timeout_ms,
        );
        override_from(
            lookup,
            "REPAIRBUS_SHUTDOWN_DRAIN_MS",
            &mut self.delivery.shutdown_drain_timeout_ms,
        );
        override_from(
            lookup,
            "REPAIRBUS_MAX_DELIVERY_RECORDS",
            &mut self.delivery.max_delivery_records,
        );
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("limits.max_message_size", self.limits.max_message_size),
            ("limits.compression_threshold", self.limits.compression_threshold),
            ("limits.max_chunk_size", self.limits.max_chunk_size),
            ("dedup.capacity", self.dedup.capacity),
            ("delivery.worker_threads", self.delivery.worker_threads),
            ("delivery.max_delivery_records", self.delivery.max_delivery_records),
        ] {
            if value == 0 {
                anyhow::bail!("{field} must be greater than 0");
            }
        }

        if self.limits.max_chunk_size > self.limits.max_message_size {
            anyhow::bail!(
                "limits.max_chunk_size ({}) must not exceed limits.max_message_size ({})",
                self.limits.max_chunk_size,
                self.limits.max_message_size
            );
        }

        if self.dedup.ttl_secs == 0 {
            anyhow::bail!("dedup.ttl_secs must be greater than 0");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be greater than 0");
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            anyhow::bail!("circuit_breaker.half_open_max_calls must be greater than 0");
        }
        if self.delivery.default_max_retries == 0 {
            anyhow::bail!("delivery.default_max_retries must be greater than 0");
        }
        if self.delivery.default_confirmation_timeout_ms == 0 {
            anyhow::bail!("delivery.default_confirmation_timeout_ms must be greater than 0");
        }

        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize bus config")
    }

    /// JSON Schema (draft 2020-12) of the config file.
    pub fn json_schema() -> Result<serde_json::Value> {
        let schema = schemars::schema_for!(BusConfig);
        serde_json::to_value(&schema).context("Failed to serialize config schema")
    }

    pub fn chunk_settings(&self) -> ChunkSettings {
        ChunkSettings {
            max_message_size: self.limits.max_message_size,
            compression_threshold: self.limits.compression_threshold,
            max_chunk_size: self.limits.max_chunk_size,
        }
    }

    pub fn breaker_settings(&self) -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: self.circuit_breaker.failure_threshold,
            reset_timeout: Duration::from_millis(self.circuit_breaker.reset_timeout_ms),
            half_open_max_calls: self.circuit_breaker.half_open_max_calls,
        }
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup.ttl_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.default_confirmation_timeout_ms)
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.shutdown_drain_timeout_ms)
    }
}

/// Per-user config file location, e.g. `~/.config/repairbus/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "repairbus").map(|dirs| dirs.config_dir().join("config.toml"))
}

fn override_from<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return;
    }
    match raw.parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = raw, "Ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = BusConfig::default();
        config.validate().unwrap();
        assert_eq!(config.limits.max_message_size, 5 * 1024 * 1024);
        assert_eq!(config.limits.compression_threshold, 10 * 1024 * 1024);
        assert_eq!(config.limits.max_chunk_size, 1024 * 1024);
        assert_eq!(config.dedup.capacity, 1000);
        assert_eq!(config.dedup.ttl_secs, 300);
        assert_eq!(config.delivery.default_max_retries, 3);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        assert_eq!(BusConfig::from_toml_str("").unwrap(), BusConfig::default());
    }

    #[test]
    fn partial_sections_fill_in_defaults_and_ignore_unknown_keys() {
        let config = BusConfig::from_toml_str(
            r#"
            [circuit_breaker]
            failure_threshold = 2
            colour = "blue"

            [delivery]
            worker_threads = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 60_000);
        assert_eq!(config.delivery.worker_threads, 3);
        assert_eq!(config.limits, LimitsConfig::default());
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut config = BusConfig::default();
        config.dedup.capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dedup.capacity"));

        let mut config = BusConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = BusConfig::default();
        config.delivery.default_max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_chunk_larger_than_trigger() {
        let mut config = BusConfig::default();
        config.limits.max_chunk_size = config.limits.max_message_size + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_chunk_size"));
    }

    #[test]
    fn env_overrides_apply_and_skip_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("REPAIRBUS_FAILURE_THRESHOLD", "9"),
            ("REPAIRBUS_WORKER_THREADS", " 2 "),
            ("REPAIRBUS_DEDUP_CAPACITY", "lots"),
            ("REPAIRBUS_MAX_RETRIES", ""),
        ]);
        let mut config = BusConfig::default();
        config.apply_env_overrides_from(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.circuit_breaker.failure_threshold, 9);
        assert_eq!(config.delivery.worker_threads, 2);
        assert_eq!(config.dedup.capacity, 1000);
        assert_eq!(config.delivery.default_max_retries, 3);
    }

    #[test]
    fn settings_conversions_carry_values() {
        let mut config = BusConfig::default();
        config.circuit_breaker.reset_timeout_ms = 1500;
        config.limits.max_chunk_size = 42;

        assert_eq!(
            config.breaker_settings().reset_timeout,
            Duration::from_millis(1500)
        );
        assert_eq!(config.chunk_settings().max_chunk_size, 42);
        assert_eq!(config.dedup_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn toml_round_trip_preserves_values() {
        let mut config = BusConfig::default();
        config.delivery.max_delivery_records = 77;
        let raw = config.to_toml_string().unwrap();
        assert!(raw.contains("[delivery]"));
        assert_eq!(BusConfig::from_toml_str(&raw).unwrap(), config);
    }
}
