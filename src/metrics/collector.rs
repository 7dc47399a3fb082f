//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the matchmaking core. Each
//! collector owns its own registry, so several matchmakers (or tests) can run
//! side by side in one process.

use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the matchmaking core
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Search queue metrics
    queue_metrics: QueueMetrics,

    /// Claim and poll loop metrics
    pairing_metrics: PairingMetrics,

    /// Store connectivity metrics
    store_metrics: StoreMetrics,
}

/// Search queue metrics
#[derive(Clone)]
pub struct QueueMetrics {
    /// Queue entries written
    pub entries_enqueued_total: IntCounter,

    /// Queue entries deleted (cancel, cleanup, or reclamation)
    pub entries_dequeued_total: IntCounter,

    /// Stale entries deleted by this process
    pub stale_entries_reclaimed_total: IntCounter,

    /// Searches currently running in this process
    pub active_searches: IntGauge,
}

/// Claim and poll loop metrics
#[derive(Clone)]
pub struct PairingMetrics {
    /// Claim transactions by outcome (claimed, aborted)
    pub claim_attempts_total: IntCounterVec,

    /// Chat sessions created by claim winners in this process
    pub sessions_created_total: IntCounter,

    /// MatchFound events delivered to the local UI
    pub matches_delivered_total: IntCounter,

    /// Poll cycles by result (idle, matched, failed)
    pub poll_cycles_total: IntCounterVec,

    /// Degradation episodes surfaced to callers
    pub degraded_episodes_total: IntCounter,

    /// Poll cycle duration
    pub poll_cycle_duration: Histogram,
}

/// Store connectivity metrics
#[derive(Clone)]
pub struct StoreMetrics {
    /// Failed store operations by operation name
    pub store_failures_total: IntCounterVec,

    /// Connection status (0=disconnected, 1=connected)
    pub connection_status: IntGauge,

    /// Connection status transitions
    pub connection_transitions_total: IntCounterVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let queue_metrics = QueueMetrics::new(&registry)?;
        let pairing_metrics = PairingMetrics::new(&registry)?;
        let store_metrics = StoreMetrics::new(&registry)?;

        Ok(Self {
            registry,
            queue_metrics,
            pairing_metrics,
            store_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    pub fn pairing(&self) -> &PairingMetrics {
        &self.pairing_metrics
    }

    pub fn store(&self) -> &StoreMetrics {
        &self.store_metrics
    }

    pub fn record_entry_enqueued(&self) {
        self.queue_metrics.entries_enqueued_total.inc();
    }

    pub fn record_entry_dequeued(&self) {
        self.queue_metrics.entries_dequeued_total.inc();
    }

    pub fn record_stale_reclaimed(&self) {
        self.queue_metrics.stale_entries_reclaimed_total.inc();
    }

    pub fn record_search_started(&self) {
        self.queue_metrics.active_searches.inc();
    }

    pub fn record_search_finished(&self) {
        self.queue_metrics.active_searches.dec();
    }

    /// Record the outcome of one claim transaction
    pub fn record_claim_attempt(&self, claimed: bool) {
        let outcome = if claimed { "claimed" } else { "aborted" };
        self.pairing_metrics
            .claim_attempts_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_session_created(&self) {
        self.pairing_metrics.sessions_created_total.inc();
    }

    pub fn record_match_delivered(&self) {
        self.pairing_metrics.matches_delivered_total.inc();
    }

    /// Record a finished poll cycle
    pub fn record_poll_cycle(&self, result: &str, duration: Duration) {
        self.pairing_metrics
            .poll_cycles_total
            .with_label_values(&[result])
            .inc();
        self.pairing_metrics
            .poll_cycle_duration
            .observe(duration.as_secs_f64());
    }

    pub fn record_degraded(&self) {
        self.pairing_metrics.degraded_episodes_total.inc();
    }

    pub fn record_store_failure(&self, operation: &str) {
        self.store_metrics
            .store_failures_total
            .with_label_values(&[operation])
            .inc();
    }

    /// Update the connection gauge and count the transition
    pub fn record_connection_change(&self, connected: bool) {
        let direction = if connected { "up" } else { "down" };
        self.store_metrics
            .connection_status
            .set(if connected { 1 } else { 0 });
        self.store_metrics
            .connection_transitions_total
            .with_label_values(&[direction])
            .inc();
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let entries_enqueued_total = IntCounter::new(
            "chat_roulette_entries_enqueued_total",
            "Search queue entries written",
        )?;
        registry.register(Box::new(entries_enqueued_total.clone()))?;

        let entries_dequeued_total = IntCounter::new(
            "chat_roulette_entries_dequeued_total",
            "Search queue entries deleted",
        )?;
        registry.register(Box::new(entries_dequeued_total.clone()))?;

        let stale_entries_reclaimed_total = IntCounter::new(
            "chat_roulette_stale_entries_reclaimed_total",
            "Abandoned search queue entries deleted",
        )?;
        registry.register(Box::new(stale_entries_reclaimed_total.clone()))?;

        let active_searches = IntGauge::new(
            "chat_roulette_active_searches",
            "Searches currently polling in this process",
        )?;
        registry.register(Box::new(active_searches.clone()))?;

        Ok(Self {
            entries_enqueued_total,
            entries_dequeued_total,
            stale_entries_reclaimed_total,
            active_searches,
        })
    }
}

impl PairingMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let claim_attempts_total = IntCounterVec::new(
            Opts::new(
                "chat_roulette_claim_attempts_total",
                "Claim transactions by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(claim_attempts_total.clone()))?;

        let sessions_created_total = IntCounter::new(
            "chat_roulette_sessions_created_total",
            "Chat sessions created by claim winners",
        )?;
        registry.register(Box::new(sessions_created_total.clone()))?;

        let matches_delivered_total = IntCounter::new(
            "chat_roulette_matches_delivered_total",
            "MatchFound events delivered locally",
        )?;
        registry.register(Box::new(matches_delivered_total.clone()))?;

        let poll_cycles_total = IntCounterVec::new(
            Opts::new("chat_roulette_poll_cycles_total", "Poll cycles by result"),
            &["result"],
        )?;
        registry.register(Box::new(poll_cycles_total.clone()))?;

        let degraded_episodes_total = IntCounter::new(
            "chat_roulette_degraded_episodes_total",
            "Times a search was reported as degraded",
        )?;
        registry.register(Box::new(degraded_episodes_total.clone()))?;

        let poll_cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "chat_roulette_poll_cycle_duration_seconds",
                "Poll cycle duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(poll_cycle_duration.clone()))?;

        Ok(Self {
            claim_attempts_total,
            sessions_created_total,
            matches_delivered_total,
            poll_cycles_total,
            degraded_episodes_total,
            poll_cycle_duration,
        })
    }
}

impl StoreMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let store_failures_total = IntCounterVec::new(
            Opts::new(
                "chat_roulette_store_failures_total",
                "Failed store operations",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(store_failures_total.clone()))?;

        let connection_status = IntGauge::new(
            "chat_roulette_connection_status",
            "Store connection status (0=disconnected, 1=connected)",
        )?;
        registry.register(Box::new(connection_status.clone()))?;
        connection_status.set(1);

        let connection_transitions_total = IntCounterVec::new(
            Opts::new(
                "chat_roulette_connection_transitions_total",
                "Store connection status transitions",
            ),
            &["direction"],
        )?;
        registry.register(Box::new(connection_transitions_total.clone()))?;

        Ok(Self {
            store_failures_total,
            connection_status,
            connection_transitions_total,
        })
    }
}
