//! Matchmaker facade
//!
//! Wires the store, health monitor, queue, pairing, session, and notifier
//! components together and exposes the operations the UI layer calls. One
//! `Matchmaker` is shared by every search in a process; each search runs as
//! its own tokio task owned through a `SearchHandle`.

use crate::config::{validate_config, AppConfig};
use crate::error::{is_store_unavailable, MatchmakingError, Result};
use crate::health::{ConnectionHealthMonitor, ListenerId, RetryPolicy};
use crate::metrics::MetricsCollector;
use crate::notify::MatchNotifier;
use crate::pairing::{
    CandidateScorer, PairingContext, PairingCoordinator, PairingOutcome, PairingState,
    PreferenceOverlapScorer,
};
use crate::queue::SearchQueueManager;
use crate::session::ChatSessionFactory;
use crate::store::{DocumentStore, GuardedStore};
use crate::types::{ConnectionStatus, MatchmakingEvent, Preferences, UserId};
use crate::utils::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bookkeeping for one running search
struct ActiveSearch {
    search_id: u64,
    cancel: CancellationToken,
}

type ActiveSearches = Arc<Mutex<HashMap<UserId, ActiveSearch>>>;

/// Entry point for the UI layer
pub struct Matchmaker {
    config: AppConfig,
    ctx: PairingContext,
    active_searches: ActiveSearches,
    next_search_id: AtomicU64,
    shutdown: CancellationToken,
    probe_task: Mutex<Option<JoinHandle<()>>>,
    connection_listener: ListenerId,
    started_at: Instant,
}

impl Matchmaker {
    /// Build a matchmaker over `store` with the system clock and the default
    /// preference-overlap scorer
    pub fn new(config: AppConfig, store: Arc<dyn DocumentStore>) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new()?);
        let scorer = Arc::new(PreferenceOverlapScorer::new(config.scoring.clone()));
        Self::with_components(config, store, metrics, Arc::new(SystemClock), scorer)
    }

    /// Build a matchmaker from explicit components
    pub fn with_components(
        config: AppConfig,
        store: Arc<dyn DocumentStore>,
        metrics: Arc<MetricsCollector>,
        clock: Arc<dyn Clock>,
        scorer: Arc<dyn CandidateScorer>,
    ) -> Result<Self> {
        validate_config(&config).map_err(|e| MatchmakingError::ConfigurationError {
            message: e.to_string(),
        })?;

        info!(
            "Initializing {} (poll every {:?}, stale after {:?})",
            config.service.name,
            config.pairing.poll_interval(),
            config.pairing.stale_ttl()
        );

        let timeout = config.store_operation_timeout();
        let monitor = Arc::new(ConnectionHealthMonitor::new(
            store.clone(),
            config.health.clone(),
            timeout,
            metrics.clone(),
            clock.clone(),
        ));
        let guarded: Arc<dyn DocumentStore> =
            Arc::new(GuardedStore::new(store, monitor.clone(), timeout));

        let notifier = Arc::new(MatchNotifier::new(
            config.service.event_buffer_size,
            metrics.clone(),
        ));
        let forward = notifier.clone();
        let connection_listener = monitor.add_listener(Arc::new(move |status: &ConnectionStatus| {
            forward.publish_connection_changed(status.clone());
        }));

        let ctx = PairingContext {
            store: guarded.clone(),
            queue: Arc::new(SearchQueueManager::new(
                guarded.clone(),
                monitor.clone(),
                metrics.clone(),
                clock.clone(),
            )),
            sessions: Arc::new(ChatSessionFactory::new(
                guarded,
                metrics.clone(),
                clock.clone(),
            )),
            notifier,
            monitor: monitor.clone(),
            scorer,
            settings: config.pairing.clone(),
            cleanup_policy: RetryPolicy::from_settings(&config.health),
            metrics,
            clock,
        };

        Ok(Self {
            config,
            ctx,
            active_searches: Arc::new(Mutex::new(HashMap::new())),
            next_search_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            probe_task: Mutex::new(None),
            connection_listener,
            started_at: Instant::now(),
        })
    }

    /// Start the background connection probe
    pub fn start(&self) -> Result<()> {
        let mut probe_task = self.lock_probe_task()?;
        if probe_task.is_some() {
            debug!("Connection probe already running");
            return Ok(());
        }

        *probe_task = Some(
            self.ctx
                .monitor
                .clone()
                .start_probe_task(self.shutdown.child_token()),
        );
        info!("{} started", self.config.service.name);
        Ok(())
    }

    /// Begin searching for a partner for `user_id`.
    ///
    /// Validation errors are returned here. A store outage is not: the search
    /// starts anyway and the poll loop writes the queue entry once the store
    /// is reachable again.
    pub async fn start_searching(
        &self,
        user_id: &str,
        preferences: Preferences,
    ) -> Result<SearchHandle> {
        SearchQueueManager::validate_user_id(user_id)?;
        if self.shutdown.is_cancelled() {
            return Err(MatchmakingError::InternalError {
                message: "matchmaker has been shut down".to_string(),
            }
            .into());
        }

        let search_id = self.next_search_id.fetch_add(1, Ordering::SeqCst);
        let cancel = self.shutdown.child_token();
        {
            let mut active = lock_active(&self.active_searches)?;
            if let Some(existing) = active.get(user_id) {
                if !existing.cancel.is_cancelled() {
                    return Err(MatchmakingError::validation(format!(
                        "user {} is already searching",
                        user_id
                    ))
                    .into());
                }
            }
            active.insert(
                user_id.to_string(),
                ActiveSearch {
                    search_id,
                    cancel: cancel.clone(),
                },
            );
        }

        // Subscribe before the loop starts so no event can be missed
        let events = self.ctx.notifier.subscribe();

        let own_entry = match self.ctx.queue.enqueue(user_id, preferences.clone()).await {
            Ok(entry) => Some(entry),
            Err(e) if is_store_unavailable(&e) => {
                warn!(
                    "Store unavailable while enqueueing {}, retrying in the background: {}",
                    user_id, e
                );
                None
            }
            Err(e) => {
                release_search(&self.active_searches, user_id, search_id);
                return Err(e);
            }
        };

        let (coordinator, state) = PairingCoordinator::new(
            self.ctx.clone(),
            user_id.to_string(),
            preferences,
            own_entry,
        );

        let active = self.active_searches.clone();
        let user = user_id.to_string();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let outcome = coordinator.run(token).await;
            release_search(&active, &user, search_id);
            outcome
        });

        info!("Search {} started for user {}", search_id, user_id);
        Ok(SearchHandle {
            user_id: user_id.to_string(),
            search_id,
            cancel,
            state,
            events,
            task,
        })
    }

    /// Stop a search. The loop deletes its queue entry on the way out.
    pub fn cancel_searching(&self, handle: &SearchHandle) {
        info!(
            "Cancelling search {} for user {}",
            handle.search_id, handle.user_id
        );
        handle.cancel();
    }

    /// Cancel whatever search `user_id` has running. Returns false if none.
    pub fn cancel_user(&self, user_id: &str) -> bool {
        match lock_active(&self.active_searches) {
            Ok(active) => match active.get(user_id) {
                Some(search) => {
                    search.cancel.cancel();
                    true
                }
                None => false,
            },
            Err(e) => {
                warn!("Could not cancel search for {}: {}", user_id, e);
                false
            }
        }
    }

    /// User-facing retry: probe the store now
    pub async fn retry_connection(&self) -> ConnectionStatus {
        info!("Manual connection retry requested");
        self.ctx.monitor.check_now().await
    }

    /// Receive every event published in this process
    pub fn subscribe(&self) -> broadcast::Receiver<MatchmakingEvent> {
        self.ctx.notifier.subscribe()
    }

    /// Last known connection status
    pub fn connection_status(&self) -> ConnectionStatus {
        self.ctx.monitor.status()
    }

    pub fn active_search_count(&self) -> usize {
        lock_active(&self.active_searches)
            .map(|active| active.len())
            .unwrap_or(0)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.ctx.metrics.clone()
    }

    pub fn monitor(&self) -> Arc<ConnectionHealthMonitor> {
        self.ctx.monitor.clone()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Cancel every search and stop the probe task
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down {}", self.config.service.name);
        self.shutdown.cancel();

        let probe_task = self.lock_probe_task()?.take();
        if let Some(task) = probe_task {
            task.await.map_err(|e| MatchmakingError::InternalError {
                message: format!("Connection probe task failed: {}", e),
            })?;
        }

        info!("{} shut down", self.config.service.name);
        Ok(())
    }

    fn lock_probe_task(&self) -> Result<std::sync::MutexGuard<'_, Option<JoinHandle<()>>>> {
        self.probe_task.lock().map_err(|_| {
            MatchmakingError::InternalError {
                message: "Failed to acquire probe task lock".to_string(),
            }
            .into()
        })
    }
}

impl Drop for Matchmaker {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.ctx.monitor.remove_listener(self.connection_listener);
    }
}

fn lock_active(
    active: &ActiveSearches,
) -> Result<std::sync::MutexGuard<'_, HashMap<UserId, ActiveSearch>>> {
    active.lock().map_err(|_| {
        MatchmakingError::InternalError {
            message: "Failed to acquire active searches lock".to_string(),
        }
        .into()
    })
}

/// Forget a finished search, unless a newer one replaced it
fn release_search(active: &ActiveSearches, user_id: &str, search_id: u64) {
    if let Ok(mut active) = active.lock() {
        if active.get(user_id).map(|s| s.search_id) == Some(search_id) {
            active.remove(user_id);
        }
    }
}

/// Owned handle to one running search
pub struct SearchHandle {
    user_id: UserId,
    search_id: u64,
    cancel: CancellationToken,
    state: watch::Receiver<PairingState>,
    events: broadcast::Receiver<MatchmakingEvent>,
    task: JoinHandle<PairingOutcome>,
}

impl SearchHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn search_id(&self) -> u64 {
        self.search_id
    }

    /// Stop scheduling poll cycles. An in-flight cycle still completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> PairingState {
        *self.state.borrow()
    }

    /// Next event relevant to this search: its own `MatchFound` and
    /// `PairingDegraded`, plus every `ConnectionChanged`. `None` once the
    /// matchmaker is gone.
    pub async fn recv_event(&mut self) -> Option<MatchmakingEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) if self.is_relevant(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Search for {} skipped {} events, consider a larger event buffer",
                        self.user_id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Wait for the search to end
    pub async fn wait(self) -> PairingOutcome {
        self.task.await.unwrap_or_else(|e| {
            PairingOutcome::Failed(format!("search task ended abnormally: {}", e))
        })
    }

    fn is_relevant(&self, event: &MatchmakingEvent) -> bool {
        match event {
            MatchmakingEvent::MatchFound(m) => m.user_id == self.user_id,
            MatchmakingEvent::PairingDegraded(d) => d.user_id == self.user_id,
            MatchmakingEvent::ConnectionChanged(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_validation;
    use crate::queue::QUEUE_COLLECTION;
    use crate::store::InMemoryDocumentStore;
    use serde_json::json;
    use std::time::Duration;

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.pairing.poll_interval_ms = 20;
        config.pairing.poll_jitter_ms = 5;
        config.health.probe_interval_ms = 20;
        config.health.initial_backoff_ms = 5;
        config.health.max_backoff_ms = 20;
        config.store.operation_timeout_ms = 500;
        config
    }

    fn create_test_matchmaker() -> (Arc<InMemoryDocumentStore>, Matchmaker) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let matchmaker = Matchmaker::new(fast_config(), store.clone()).unwrap();
        (store, matchmaker)
    }

    #[tokio::test]
    async fn test_start_searching_validates_synchronously() {
        let (store, matchmaker) = create_test_matchmaker();

        let err = matchmaker
            .start_searching("  ", Preferences::new())
            .await
            .err()
            .unwrap();
        assert!(is_validation(&err));
        assert_eq!(store.operation_count(), 0);
        assert_eq!(matchmaker.active_search_count(), 0);
    }

    #[tokio::test]
    async fn test_second_search_for_same_user_is_rejected() {
        let (_store, matchmaker) = create_test_matchmaker();

        let first = matchmaker
            .start_searching("alice", Preferences::new())
            .await
            .unwrap();
        let err = matchmaker
            .start_searching("alice", Preferences::new())
            .await
            .err()
            .unwrap();
        assert!(is_validation(&err));

        // After cancelling, a new search is allowed
        matchmaker.cancel_searching(&first);
        assert_eq!(first.wait().await, PairingOutcome::Cancelled);
        let again = matchmaker
            .start_searching("alice", Preferences::new())
            .await
            .unwrap();
        again.cancel();
        again.wait().await;
    }

    #[tokio::test]
    async fn test_cancel_removes_queue_entry() {
        let (store, matchmaker) = create_test_matchmaker();

        let handle = matchmaker
            .start_searching("alice", Preferences::from([("interest".to_string(), json!("music"))]))
            .await
            .unwrap();
        assert_eq!(store.document_count(QUEUE_COLLECTION), 1);

        assert!(matchmaker.cancel_user("alice"));
        assert_eq!(handle.wait().await, PairingOutcome::Cancelled);
        assert_eq!(store.document_count(QUEUE_COLLECTION), 0);
        assert_eq!(matchmaker.active_search_count(), 0);
        assert!(!matchmaker.cancel_user("alice"));
    }

    #[tokio::test]
    async fn test_search_starts_during_outage() {
        let (store, matchmaker) = create_test_matchmaker();
        store.set_reachable(false);

        let handle = matchmaker
            .start_searching("alice", Preferences::new())
            .await
            .unwrap();
        assert_eq!(store.document_count(QUEUE_COLLECTION), 0);

        store.set_reachable(true);
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.document_count(QUEUE_COLLECTION) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.cancel();
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_connection_changes_are_forwarded() {
        let (store, matchmaker) = create_test_matchmaker();
        let mut events = matchmaker.subscribe();

        store.set_reachable(false);
        assert!(!matchmaker.retry_connection().await.connected);
        store.set_reachable(true);
        assert!(matchmaker.retry_connection().await.connected);

        let mut transitions = Vec::new();
        while let Ok(MatchmakingEvent::ConnectionChanged(status)) = events.try_recv() {
            transitions.push(status.connected);
        }
        assert_eq!(transitions, vec![false, true]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_searches() {
        let (_store, matchmaker) = create_test_matchmaker();
        matchmaker.start().unwrap();

        let handle = matchmaker
            .start_searching("alice", Preferences::new())
            .await
            .unwrap();
        matchmaker.shutdown().await.unwrap();

        assert_eq!(handle.wait().await, PairingOutcome::Cancelled);
        assert!(matchmaker.is_shut_down());
        assert!(matchmaker
            .start_searching("bob", Preferences::new())
            .await
            .is_err());
    }
}
