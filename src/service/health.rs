//! Health report for the matchmaker
//!
//! Summarizes store connectivity and search activity into one serializable
//! report, for the CLI or for an embedding application to expose.

use crate::service::app::Matchmaker;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall status, the worst of all component checks
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Set when the component is not healthy
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Search activity for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Searches currently running in this process
    pub active_searches: usize,
    /// Consecutive failed store operations
    pub consecutive_store_failures: u32,
    /// Matches delivered since start
    pub matches_delivered: u64,
    pub uptime_seconds: u64,
}

impl HealthCheck {
    /// Probe the store and build a full report
    pub async fn check(matchmaker: &Matchmaker) -> Self {
        let checks = vec![
            Self::check_service_running(matchmaker),
            Self::check_store(matchmaker).await,
        ];

        let status = checks
            .iter()
            .map(|check| &check.status)
            .fold(HealthStatus::Healthy, |worst, status| match (worst, status) {
                (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => {
                    HealthStatus::Unhealthy
                }
                (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => {
                    HealthStatus::Degraded
                }
                _ => HealthStatus::Healthy,
            });

        let metrics = matchmaker.metrics();
        let stats = ServiceStats {
            active_searches: matchmaker.active_search_count(),
            consecutive_store_failures: matchmaker.monitor().consecutive_failures(),
            matches_delivered: metrics.pairing().matches_delivered_total.get(),
            uptime_seconds: matchmaker.uptime().as_secs(),
        };
        debug!("Health check finished: {}", status);

        HealthCheck {
            status,
            service: matchmaker.config().service.name.clone(),
            version: crate::VERSION.to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        }
    }

    /// Liveness: the matchmaker has not been shut down
    pub fn liveness_check(matchmaker: &Matchmaker) -> HealthStatus {
        Self::check_service_running(matchmaker).status
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }

    fn check_service_running(matchmaker: &Matchmaker) -> ComponentCheck {
        let start = Instant::now();

        let (status, message) = if matchmaker.is_shut_down() {
            (
                HealthStatus::Unhealthy,
                Some("Matchmaker has been shut down".to_string()),
            )
        } else {
            (HealthStatus::Healthy, None)
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Healthy when the probe succeeds; degraded during the first failures of
    /// an outage, unhealthy once backoff has reached its ceiling
    async fn check_store(matchmaker: &Matchmaker) -> ComponentCheck {
        let start = Instant::now();
        let connection = matchmaker.retry_connection().await;
        let monitor = matchmaker.monitor();

        let status = if connection.connected {
            HealthStatus::Healthy
        } else if monitor.backoff_delay() < matchmaker.config().health.max_backoff() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        ComponentCheck {
            name: "document_store".to_string(),
            status,
            message: connection.last_error,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::store::InMemoryDocumentStore;
    use std::sync::Arc;

    fn create_test_matchmaker() -> (Arc<InMemoryDocumentStore>, Matchmaker) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let mut config = AppConfig::default();
        config.health.initial_backoff_ms = 10;
        config.health.max_backoff_ms = 40;
        (store.clone(), Matchmaker::new(config, store).unwrap())
    }

    #[tokio::test]
    async fn test_healthy_report() {
        let (_store, matchmaker) = create_test_matchmaker();

        let report = HealthCheck::check(&matchmaker).await;
        assert!(report.is_healthy());
        assert_eq!(report.checks.len(), 2);
        assert_eq!(report.service, "chat-roulette");

        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"healthy\""));
    }

    #[tokio::test]
    async fn test_outage_degrades_then_fails() {
        let (store, matchmaker) = create_test_matchmaker();
        store.set_reachable(false);

        let first = HealthCheck::check(&matchmaker).await;
        assert_eq!(first.status, HealthStatus::Degraded);
        assert!(first.checks[1].message.is_some());

        // 10 -> 20 -> 40 ms: the ceiling is reached on the third failure
        HealthCheck::check(&matchmaker).await;
        let third = HealthCheck::check(&matchmaker).await;
        assert_eq!(third.status, HealthStatus::Unhealthy);
        assert_eq!(third.stats.consecutive_store_failures, 3);
    }

    #[tokio::test]
    async fn test_liveness_after_shutdown() {
        let (_store, matchmaker) = create_test_matchmaker();
        assert_eq!(HealthCheck::liveness_check(&matchmaker), HealthStatus::Healthy);

        matchmaker.shutdown().await.unwrap();
        assert_eq!(
            HealthCheck::liveness_check(&matchmaker),
            HealthStatus::Unhealthy
        );
    }
}
