//! Connection health monitor
//!
//! Tracks whether the shared store is reachable. Every guarded store operation
//! reports its result here, a background task probes the store periodically,
//! and `check_now` lets a user-facing retry action force a probe. Listeners are
//! notified on transitions only (connected -> disconnected and back), never on
//! repeated reports of the same state.

use crate::config::HealthSettings;
use crate::error::MatchmakingError;
use crate::health::backoff::RetryPolicy;
use crate::metrics::MetricsCollector;
use crate::store::DocumentStore;
use crate::types::ConnectionStatus;
use crate::utils::Clock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Collection the reachability probe writes to
pub const HEALTH_COLLECTION: &str = "_health";

/// Handle returned by `add_listener`, used to remove the listener again
pub type ListenerId = u64;

/// Callback invoked on every connection transition
pub type ConnectionListener = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

pub struct ConnectionHealthMonitor {
    /// Raw (unguarded) store used for probing
    store: Arc<dyn DocumentStore>,
    settings: HealthSettings,
    probe_timeout: Duration,
    policy: RetryPolicy,
    status: RwLock<ConnectionStatus>,
    consecutive_failures: AtomicU32,
    listeners: Mutex<HashMap<ListenerId, ConnectionListener>>,
    next_listener_id: AtomicU64,
    /// Serializes state transitions so listeners observe them in order
    transition_lock: Mutex<()>,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
}

impl ConnectionHealthMonitor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        settings: HealthSettings,
        probe_timeout: Duration,
        metrics: Arc<MetricsCollector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policy = RetryPolicy::from_settings(&settings);
        let mut status = ConnectionStatus::initial();
        status.last_checked_at = clock.now();

        Self {
            store,
            settings,
            probe_timeout,
            policy,
            status: RwLock::new(status),
            consecutive_failures: AtomicU32::new(0),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            transition_lock: Mutex::new(()),
            metrics,
            clock,
        }
    }

    /// Last known connection status. Never probes.
    pub fn status(&self) -> ConnectionStatus {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status
            .read()
            .map(|status| status.connected)
            .unwrap_or(false)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// How long callers should hold off before touching the store again
    pub fn backoff_delay(&self) -> Duration {
        self.policy.delay_for(self.consecutive_failures())
    }

    /// Register a transition listener. Safe to call from any thread, including
    /// from inside another listener.
    pub fn add_listener(&self, listener: ConnectionListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, listener);
        debug!("Registered connection listener {}", id);
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
            .is_some();
        debug!("Removed connection listener {} (found: {})", id, removed);
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Record a successful store round trip
    pub fn report_success(&self) {
        if self.consecutive_failures() == 0 && self.is_connected() {
            return;
        }

        let _transition = self
            .transition_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.consecutive_failures.store(0, Ordering::SeqCst);

        let changed = {
            let mut status = self
                .status
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let was_connected = status.connected;
            status.connected = true;
            status.last_error = None;
            status.last_checked_at = self.clock.now();
            (!was_connected).then(|| status.clone())
        };

        if let Some(status) = changed {
            info!("Store connection restored");
            self.metrics.record_connection_change(true);
            self.notify(&status);
        }
    }

    /// Record a failed store operation
    pub fn report_failure(&self, operation: &str, message: &str) {
        let _transition = self
            .transition_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.record_store_failure(operation);

        let changed = {
            let mut status = self
                .status
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let was_connected = status.connected;
            status.connected = false;
            status.last_error = Some(message.to_string());
            status.last_checked_at = self.clock.now();
            was_connected.then(|| status.clone())
        };

        if let Some(status) = changed {
            warn!(
                "Store connection lost during {} (failure #{}): {}",
                operation, failures, message
            );
            self.metrics.record_connection_change(false);
            self.notify(&status);
        } else {
            debug!(
                "Store still unreachable during {} (failure #{}): {}",
                operation, failures, message
            );
        }
    }

    /// Probe the store right now and return the resulting status
    pub async fn check_now(&self) -> ConnectionStatus {
        match self.probe().await {
            Ok(()) => self.report_success(),
            Err(e) => self.report_failure("probe", &e.to_string()),
        }
        self.status()
    }

    /// Minimal write + delete round trip against the health collection
    async fn probe(&self) -> crate::Result<()> {
        let round_trip = async {
            let id = self
                .store
                .insert(
                    HEALTH_COLLECTION,
                    json!({ "probedAt": self.clock.now().timestamp_micros() }),
                )
                .await?;
            self.store.delete(HEALTH_COLLECTION, &id).await
        };

        match tokio::time::timeout(self.probe_timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(MatchmakingError::store_unavailable(format!(
                "probe timed out after {:?}",
                self.probe_timeout
            ))
            .into()),
        }
    }

    /// Start the periodic probe. Probes faster (at the backoff delay) while
    /// disconnected so recovery is noticed quickly.
    pub fn start_probe_task(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(&self);

        info!(
            "Starting connection probe every {:?}",
            self.settings.probe_interval()
        );

        tokio::spawn(async move {
            loop {
                let delay = if monitor.is_connected() {
                    monitor.settings.probe_interval()
                } else {
                    monitor
                        .backoff_delay()
                        .min(monitor.settings.probe_interval())
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let status = monitor.check_now().await;
                debug!("Probe finished - connected: {}", status.connected);
            }

            info!("Connection probe stopped");
        })
    }

    fn notify(&self, status: &ConnectionStatus) {
        // Snapshot so listeners may add or remove listeners while being called
        let listeners: Vec<ConnectionListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();

        for listener in listeners {
            listener(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use crate::utils::SystemClock;

    fn create_test_monitor() -> (Arc<InMemoryDocumentStore>, Arc<ConnectionHealthMonitor>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let settings = HealthSettings {
            probe_interval_ms: 20,
            initial_backoff_ms: 5,
            max_backoff_ms: 40,
        };
        let monitor = Arc::new(ConnectionHealthMonitor::new(
            store.clone(),
            settings,
            Duration::from_millis(200),
            Arc::new(MetricsCollector::new().unwrap()),
            Arc::new(SystemClock),
        ));
        (store, monitor)
    }

    fn recording_listener(
        monitor: &ConnectionHealthMonitor,
    ) -> (ListenerId, Arc<Mutex<Vec<bool>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = monitor.add_listener(Arc::new(move |status: &ConnectionStatus| {
            sink.lock().unwrap().push(status.connected);
        }));
        (id, seen)
    }

    #[test]
    fn test_initial_status_is_optimistic() {
        let (_store, monitor) = create_test_monitor();
        let status = monitor.status();
        assert!(status.connected);
        assert!(status.last_error.is_none());
        assert_eq!(monitor.backoff_delay(), Duration::ZERO);
    }

    #[test]
    fn test_only_transitions_are_notified() {
        let (_store, monitor) = create_test_monitor();
        let (_id, seen) = recording_listener(&monitor);

        monitor.report_success();
        monitor.report_failure("query", "boom");
        monitor.report_failure("query", "boom again");
        monitor.report_failure("get", "still down");
        monitor.report_success();
        monitor.report_success();

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        assert_eq!(monitor.consecutive_failures(), 0);
    }

    #[test]
    fn test_backoff_grows_with_failures() {
        let (_store, monitor) = create_test_monitor();

        monitor.report_failure("query", "down");
        assert_eq!(monitor.backoff_delay(), Duration::from_millis(5));
        monitor.report_failure("query", "down");
        assert_eq!(monitor.backoff_delay(), Duration::from_millis(10));
        for _ in 0..10 {
            monitor.report_failure("query", "down");
        }
        assert_eq!(monitor.backoff_delay(), Duration::from_millis(40));

        let status = monitor.status();
        assert!(!status.connected);
        assert_eq!(status.last_error.as_deref(), Some("down"));
    }

    #[test]
    fn test_remove_listener() {
        let (_store, monitor) = create_test_monitor();
        let (id, seen) = recording_listener(&monitor);

        assert!(monitor.remove_listener(id));
        assert!(!monitor.remove_listener(id));

        monitor.report_failure("query", "down");
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_listener_can_mutate_registry_during_notification() {
        let (_store, monitor) = create_test_monitor();
        let monitor_for_listener = monitor.clone();
        let added = Arc::new(Mutex::new(None));
        let added_slot = added.clone();

        let self_id = Arc::new(AtomicU64::new(0));
        let self_id_for_listener = self_id.clone();
        let id = monitor.add_listener(Arc::new(move |_status: &ConnectionStatus| {
            monitor_for_listener.remove_listener(self_id_for_listener.load(Ordering::SeqCst));
            let new_id = monitor_for_listener.add_listener(Arc::new(|_: &ConnectionStatus| {}));
            *added_slot.lock().unwrap() = Some(new_id);
        }));
        self_id.store(id, Ordering::SeqCst);

        monitor.report_failure("query", "down");

        assert_eq!(monitor.listener_count(), 1);
        assert!(added.lock().unwrap().is_some());
    }

    #[test]
    fn test_concurrent_listener_registration() {
        let (_store, monitor) = create_test_monitor();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let monitor = monitor.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let id = monitor.add_listener(Arc::new(|_: &ConnectionStatus| {}));
                        monitor.report_failure("query", "flap");
                        monitor.report_success();
                        assert!(monitor.remove_listener(id));
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(monitor.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_check_now_reflects_store() {
        let (store, monitor) = create_test_monitor();
        let (_id, seen) = recording_listener(&monitor);

        store.set_reachable(false);
        let status = monitor.check_now().await;
        assert!(!status.connected);

        store.set_reachable(true);
        let status = monitor.check_now().await;
        assert!(status.connected);

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        // The probe cleans up after itself
        assert_eq!(store.document_count(HEALTH_COLLECTION), 0);
    }

    #[tokio::test]
    async fn test_probe_task_detects_recovery() {
        let (store, monitor) = create_test_monitor();
        let cancel = CancellationToken::new();

        monitor.report_failure("query", "down");
        store.set_reachable(true);

        let task = monitor.clone().start_probe_task(cancel.clone());

        let recovered = tokio::time::timeout(Duration::from_secs(2), async {
            while !monitor.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(recovered.is_ok());

        cancel.cancel();
        task.await.unwrap();
    }
}
