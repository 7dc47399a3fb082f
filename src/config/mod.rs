//! Configuration management for the matchmaking core
//!
//! This module handles configuration loading from environment variables and
//! TOML files, validation, and default values.

pub mod app;
pub mod scoring;

// Re-export commonly used types
pub use app::{
    validate_config, AppConfig, HealthSettings, PairingSettings, ServiceSettings, StoreSettings,
};
pub use scoring::ScoringWeights;
