//! Service layer for the matchmaking core
//!
//! `Matchmaker` is the facade the UI layer talks to; `HealthCheck` reports on
//! it.

pub mod app;
pub mod health;

pub use app::{Matchmaker, SearchHandle};
pub use health::{HealthCheck, HealthStatus};
