//! Metrics for the matchmaking core
//!
//! Every component records through a shared `MetricsCollector`; the embedding
//! application decides whether and how to expose the registry.

pub mod collector;

pub use collector::{MetricsCollector, MetricsTimer, PairingMetrics, QueueMetrics, StoreMetrics};
