//! Chat Roulette - random-chat matchmaking core
//!
//! Pairs anonymous users into two-person chat sessions using nothing but a
//! shared, multi-writer document store for coordination. Every searching
//! client runs its own poll loop; an atomic claim transaction guarantees that
//! each queue entry is paired at most once, however the loops interleave.

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod pairing;
pub mod queue;
pub mod service;
pub mod session;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, Result};
pub use types::*;

// Re-export key components
pub use health::ConnectionHealthMonitor;
pub use pairing::{CandidateScorer, PairingOutcome, PairingState, PreferenceOverlapScorer};
pub use service::{Matchmaker, SearchHandle};
pub use store::{DocumentStore, InMemoryDocumentStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
