//! Main application configuration
//!
//! This module defines the configuration structures for the matchmaking core,
//! including environment variable loading, TOML file loading, and validation.

use crate::config::scoring::ScoringWeights;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub store: StoreSettings,
    pub pairing: PairingSettings,
    pub health: HealthSettings,
    pub scoring: ScoringWeights,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Capacity of the local event channel
    pub event_buffer_size: usize,
}

/// Shared document store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Upper bound for any single read, write, or transaction
    pub operation_timeout_ms: u64,
}

/// Poll loop and claim protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSettings {
    /// Base delay between poll cycles
    pub poll_interval_ms: u64,
    /// Maximum random offset applied to each poll delay
    pub poll_jitter_ms: u64,
    /// Number of queue entries read per scan
    pub page_size: usize,
    /// Claim attempts per poll cycle before waiting for the next one
    pub max_claim_attempts: usize,
    /// Age after which a Searching entry is considered abandoned
    pub stale_ttl_seconds: u64,
    /// How long a claimed entry waits for its chat session before re-queueing
    pub claim_grace_seconds: u64,
    /// Consecutive failed cycles before the search is reported as degraded
    pub degraded_after_failures: u32,
}

/// Connection health monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Interval of the background reachability probe
    pub probe_interval_ms: u64,
    /// First backoff delay after a failure
    pub initial_backoff_ms: u64,
    /// Upper bound for the backoff delay
    pub max_backoff_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "chat-roulette".to_string(),
            log_level: "info".to_string(),
            event_buffer_size: 256,
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 5000,
        }
    }
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            poll_jitter_ms: 1000,
            page_size: 25,
            max_claim_attempts: 3,
            stale_ttl_seconds: 120, // 2 minutes
            claim_grace_seconds: 10,
            degraded_after_failures: 3,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 15_000,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl PairingSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_jitter(&self) -> Duration {
        Duration::from_millis(self.poll_jitter_ms)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_secs(self.stale_ttl_seconds)
    }

    pub fn claim_grace(&self) -> Duration {
        Duration::from_secs(self.claim_grace_seconds)
    }
}

impl HealthSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Parse an environment variable into `target` when it is set
fn override_from_env<T: std::str::FromStr>(key: &str, target: &mut T) -> Result<()> {
    if let Ok(value) = env::var(key) {
        *target = value
            .parse()
            .map_err(|_| anyhow!("Invalid {} value: {}", key, value))?;
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.apply_env_overrides()?;
        validate_config(&config)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        // Service settings
        if let Ok(name) = env::var("SERVICE_NAME") {
            self.service.name = name;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            self.service.log_level = log_level;
        }
        override_from_env("EVENT_BUFFER_SIZE", &mut self.service.event_buffer_size)?;

        // Store settings
        override_from_env(
            "STORE_OPERATION_TIMEOUT_MS",
            &mut self.store.operation_timeout_ms,
        )?;

        // Pairing settings
        override_from_env("POLL_INTERVAL_MS", &mut self.pairing.poll_interval_ms)?;
        override_from_env("POLL_JITTER_MS", &mut self.pairing.poll_jitter_ms)?;
        override_from_env("QUEUE_PAGE_SIZE", &mut self.pairing.page_size)?;
        override_from_env("MAX_CLAIM_ATTEMPTS", &mut self.pairing.max_claim_attempts)?;
        override_from_env("STALE_TTL_SECONDS", &mut self.pairing.stale_ttl_seconds)?;
        override_from_env("CLAIM_GRACE_SECONDS", &mut self.pairing.claim_grace_seconds)?;
        override_from_env(
            "DEGRADED_AFTER_FAILURES",
            &mut self.pairing.degraded_after_failures,
        )?;

        // Health settings
        override_from_env("PROBE_INTERVAL_MS", &mut self.health.probe_interval_ms)?;
        override_from_env("INITIAL_BACKOFF_MS", &mut self.health.initial_backoff_ms)?;
        override_from_env("MAX_BACKOFF_MS", &mut self.health.max_backoff_ms)?;

        // Scoring weights
        override_from_env("OVERLAP_WEIGHT", &mut self.scoring.overlap_weight)?;
        override_from_env(
            "WAIT_WEIGHT_PER_SECOND",
            &mut self.scoring.wait_weight_per_second,
        )?;
        override_from_env("MIN_SCORE", &mut self.scoring.min_score)?;

        Ok(())
    }

    /// Get store operation timeout as Duration
    pub fn store_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.store.operation_timeout_ms)
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    // Validate log level
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    if config.service.event_buffer_size == 0 {
        return Err(anyhow!("Event buffer size must be greater than 0"));
    }

    // Validate timeouts
    if config.store.operation_timeout_ms == 0 {
        return Err(anyhow!("Store operation timeout must be greater than 0"));
    }

    // Validate pairing settings
    if config.pairing.poll_interval_ms == 0 {
        return Err(anyhow!("Poll interval must be greater than 0"));
    }
    if config.pairing.poll_jitter_ms >= config.pairing.poll_interval_ms {
        return Err(anyhow!("Poll jitter must be smaller than the poll interval"));
    }
    if config.pairing.page_size == 0 {
        return Err(anyhow!("Queue page size must be greater than 0"));
    }
    if config.pairing.max_claim_attempts == 0 {
        return Err(anyhow!("Max claim attempts must be greater than 0"));
    }
    if config.pairing.stale_ttl_seconds == 0 {
        return Err(anyhow!("Stale entry TTL must be greater than 0"));
    }
    if config.pairing.degraded_after_failures == 0 {
        return Err(anyhow!("Degraded threshold must be greater than 0"));
    }

    // Validate health settings
    if config.health.probe_interval_ms == 0 {
        return Err(anyhow!("Probe interval must be greater than 0"));
    }
    if config.health.initial_backoff_ms == 0 {
        return Err(anyhow!("Initial backoff must be greater than 0"));
    }
    if config.health.max_backoff_ms < config.health.initial_backoff_ms {
        return Err(anyhow!("Max backoff cannot be smaller than initial backoff"));
    }

    config.scoring.validate()?;

    Ok(())
}
