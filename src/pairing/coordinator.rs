//! Pairing coordinator
//!
//! One coordinator runs per actively searching user. Each poll cycle it
//! checks its own entry (it may have been claimed by somebody else), scans the
//! queue, reclaims stale entries, ranks candidates, and tries to claim the best
//! ones. The winner of a claim creates the chat session; the other side finds
//! it on a later cycle through the session's `entryIds`.
//!
//! Store failures never escape a cycle. They are counted, the next cycle is
//! delayed by the health monitor's backoff, and a `PairingDegraded` event is
//! published once per episode when failures persist.

use crate::config::PairingSettings;
use crate::error::{matchmaking_error, MatchmakingError, Result};
use crate::health::{ConnectionHealthMonitor, RetryPolicy};
use crate::metrics::MetricsCollector;
use crate::notify::MatchNotifier;
use crate::pairing::claim::{try_claim, ClaimOutcome};
use crate::pairing::matching::CandidateScorer;
use crate::queue::SearchQueueManager;
use crate::session::ChatSessionFactory;
use crate::store::DocumentStore;
use crate::types::{
    ChatSession, MatchFound, PairingDegraded, Preferences, SearchQueueEntry, SearchStatus, UserId,
};
use crate::utils::{jittered, to_chrono, Clock};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of one search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    Polling,
    Matched,
    Cancelled,
    Failed,
}

impl PairingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PairingState::Matched | PairingState::Cancelled | PairingState::Failed
        )
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingState::Idle => write!(f, "Idle"),
            PairingState::Polling => write!(f, "Polling"),
            PairingState::Matched => write!(f, "Matched"),
            PairingState::Cancelled => write!(f, "Cancelled"),
            PairingState::Failed => write!(f, "Failed"),
        }
    }
}

/// How a search ended
#[derive(Debug, Clone, PartialEq)]
pub enum PairingOutcome {
    Matched(MatchFound),
    Cancelled,
    Failed(String),
}

/// Result of a single poll cycle
#[derive(Debug, Clone, PartialEq)]
pub enum PollResult {
    /// No match yet, keep polling
    Waiting,
    Matched(MatchFound),
}

/// Collaborators shared by every search in the process
#[derive(Clone)]
pub struct PairingContext {
    /// Guarded store used for claim transactions
    pub store: Arc<dyn DocumentStore>,
    pub queue: Arc<SearchQueueManager>,
    pub sessions: Arc<ChatSessionFactory>,
    pub notifier: Arc<MatchNotifier>,
    pub monitor: Arc<ConnectionHealthMonitor>,
    pub scorer: Arc<dyn CandidateScorer>,
    pub settings: PairingSettings,
    /// Retry policy for post-match cleanup
    pub cleanup_policy: RetryPolicy,
    pub metrics: Arc<MetricsCollector>,
    pub clock: Arc<dyn Clock>,
}

/// A committed claim whose chat session has not been written yet
#[derive(Debug, Clone)]
struct WonClaim {
    own: SearchQueueEntry,
    partner: SearchQueueEntry,
    claimed_at: DateTime<Utc>,
    attempts: u32,
}

pub struct PairingCoordinator {
    ctx: PairingContext,
    user_id: UserId,
    preferences: Preferences,
    own_entry: Option<SearchQueueEntry>,
    won_claim: Option<WonClaim>,
    sessions_created: u32,
    consecutive_failures: u32,
    last_error: Option<String>,
    degraded_reported: bool,
    state: watch::Sender<PairingState>,
}

impl PairingCoordinator {
    /// Create a coordinator for `user_id`. `own_entry` is the entry written by
    /// the caller, or `None` if the first enqueue has to be retried by the loop.
    pub fn new(
        ctx: PairingContext,
        user_id: UserId,
        preferences: Preferences,
        own_entry: Option<SearchQueueEntry>,
    ) -> (Self, watch::Receiver<PairingState>) {
        let (state, state_rx) = watch::channel(PairingState::Idle);
        let coordinator = Self {
            ctx,
            user_id,
            preferences,
            own_entry,
            won_claim: None,
            sessions_created: 0,
            consecutive_failures: 0,
            last_error: None,
            degraded_reported: false,
            state,
        };
        (coordinator, state_rx)
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn state(&self) -> PairingState {
        *self.state.borrow()
    }

    pub fn own_entry(&self) -> Option<&SearchQueueEntry> {
        self.own_entry.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Poll until matched, cancelled, or a fatal error.
    ///
    /// Cancellation stops scheduling immediately but never interrupts a cycle
    /// that is already running, so a claim committed in that cycle still gets
    /// its session and cleanup.
    pub async fn run(mut self, cancel: CancellationToken) -> PairingOutcome {
        self.set_state(PairingState::Polling);
        self.ctx.metrics.record_search_started();
        info!("Pairing started for user {}", self.user_id);

        let outcome = loop {
            if cancel.is_cancelled() {
                break self.finish_cancelled().await;
            }

            let timer = self.ctx.metrics.start_timer();
            match self.poll_cycle().await {
                Ok(PollResult::Matched(event)) => {
                    self.ctx.metrics.record_poll_cycle("matched", timer.stop());
                    break PairingOutcome::Matched(event);
                }
                Ok(PollResult::Waiting) => {
                    self.ctx.metrics.record_poll_cycle("idle", timer.stop());
                    self.on_cycle_succeeded();
                }
                Err(e) if is_fatal(&e) => {
                    self.ctx.metrics.record_poll_cycle("failed", timer.stop());
                    error!("Pairing failed for user {}: {}", self.user_id, e);
                    break PairingOutcome::Failed(e.to_string());
                }
                Err(e) => {
                    self.ctx.metrics.record_poll_cycle("failed", timer.stop());
                    self.on_cycle_failed(&e);
                }
            }

            let delay = jittered(
                self.ctx.settings.poll_interval(),
                self.ctx.settings.poll_jitter(),
            )
            .max(self.ctx.monitor.backoff_delay());

            tokio::select! {
                _ = cancel.cancelled() => break self.finish_cancelled().await,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.ctx.metrics.record_search_finished();
        self.set_state(match &outcome {
            PairingOutcome::Matched(_) => PairingState::Matched,
            PairingOutcome::Cancelled => PairingState::Cancelled,
            PairingOutcome::Failed(_) => PairingState::Failed,
        });
        outcome
    }

    /// Run one poll cycle
    pub async fn poll_cycle(&mut self) -> Result<PollResult> {
        // While disconnected the cycle doubles as a probe
        if !self.ctx.monitor.is_connected() {
            let status = self.ctx.monitor.check_now().await;
            if !status.connected {
                return Err(MatchmakingError::store_unavailable(
                    status
                        .last_error
                        .unwrap_or_else(|| "store unreachable".to_string()),
                )
                .into());
            }
        }

        if let Some(won) = self.won_claim.take() {
            return self.complete_as_winner(won).await;
        }

        let own = match self.own_entry.clone() {
            None => self.enqueue_own().await?,
            Some(entry) => match self.ctx.queue.fetch_own(&entry.id).await? {
                Some(current) if current.is_searching() => current,
                Some(current) if current.status == SearchStatus::Claimed => {
                    return self.complete_as_claimed(current).await;
                }
                Some(current) => {
                    warn!(
                        "Entry {} of user {} is {}, re-queueing",
                        current.id, self.user_id, current.status
                    );
                    self.ctx.queue.dequeue(&current.id).await?;
                    self.own_entry = None;
                    self.enqueue_own().await?
                }
                None => {
                    warn!(
                        "Entry {} of user {} vanished from the queue, re-queueing",
                        entry.id, self.user_id
                    );
                    self.own_entry = None;
                    self.enqueue_own().await?
                }
            },
        };

        let now = self.ctx.clock.now();
        let scanned = self
            .ctx
            .queue
            .scan_searching(&self.user_id, self.ctx.settings.page_size)
            .await?;
        let candidates = self.reclaim_stale(scanned, now).await;

        let ranked = self.ctx.scorer.rank(&own, &candidates, now);
        if ranked.is_empty() {
            debug!("No candidates for user {} yet", self.user_id);
            return Ok(PollResult::Waiting);
        }

        for candidate in ranked
            .into_iter()
            .take(self.ctx.settings.max_claim_attempts)
        {
            match try_claim(self.ctx.store.as_ref(), &own, &candidate.entry, now).await? {
                ClaimOutcome::Claimed { claimed_at } => {
                    self.ctx.metrics.record_claim_attempt(true);
                    info!(
                        "User {} claimed user {} (entry {}, score {:.2})",
                        self.user_id, candidate.entry.user_id, candidate.entry.id, candidate.score
                    );
                    let won = WonClaim {
                        own: own.clone(),
                        partner: candidate.entry,
                        claimed_at,
                        attempts: 0,
                    };
                    return self.complete_as_winner(won).await;
                }
                ClaimOutcome::Aborted(reason) => {
                    self.ctx.metrics.record_claim_attempt(false);
                    debug!(
                        "User {} lost claim on entry {}: {}",
                        self.user_id, candidate.entry.id, reason
                    );
                    if reason.concerns_own_entry() {
                        break;
                    }
                }
            }
        }

        Ok(PollResult::Waiting)
    }

    async fn enqueue_own(&mut self) -> Result<SearchQueueEntry> {
        let entry = self
            .ctx
            .queue
            .enqueue(&self.user_id, self.preferences.clone())
            .await?;
        self.own_entry = Some(entry.clone());
        Ok(entry)
    }

    /// Delete abandoned entries and return the rest
    async fn reclaim_stale(
        &self,
        scanned: Vec<SearchQueueEntry>,
        now: DateTime<Utc>,
    ) -> Vec<SearchQueueEntry> {
        let ttl = to_chrono(self.ctx.settings.stale_ttl());
        let cutoff = now - ttl;
        let mut fresh = Vec::with_capacity(scanned.len());

        for entry in scanned {
            if entry.age(now) <= ttl {
                fresh.push(entry);
                continue;
            }

            // Re-checked inside a transaction: the entry may have been claimed
            // since the scan
            match self.ctx.queue.reclaim_if_stale(&entry.id, cutoff).await {
                Ok(true) => {
                    self.ctx.metrics.record_stale_reclaimed();
                    info!(
                        "Reclaimed stale entry {} of user {} (waited {}s)",
                        entry.id,
                        entry.user_id,
                        entry.age(now).num_seconds()
                    );
                }
                Ok(false) => debug!("Entry {} changed since the scan, left in place", entry.id),
                Err(e) => debug!("Could not reclaim stale entry {}: {}", entry.id, e),
            }
        }

        fresh
    }

    async fn complete_as_winner(&mut self, won: WonClaim) -> Result<PollResult> {
        debug_assert_eq!(
            self.sessions_created, 0,
            "claim winner {} already created a chat session",
            self.user_id
        );
        if self.sessions_created > 0 {
            return Err(MatchmakingError::InvariantViolation {
                message: format!(
                    "claim winner {} already created a chat session",
                    self.user_id
                ),
            }
            .into());
        }

        let session = match self.write_session(&won).await {
            Ok(session) => session,
            Err(e) => {
                let waited = self.ctx.clock.now() - won.claimed_at;
                if waited > to_chrono(self.ctx.settings.claim_grace())
                    && self.abandon_claim(&won.own).await.is_ok()
                {
                    warn!(
                        "User {} gave up creating a chat with {} after {}s, re-queueing",
                        self.user_id,
                        won.partner.user_id,
                        waited.num_seconds()
                    );
                } else {
                    self.won_claim = Some(WonClaim {
                        attempts: won.attempts + 1,
                        ..won
                    });
                }
                return Err(e);
            }
        };

        self.sessions_created += 1;
        self.deliver(session, &won.own).await
    }

    /// Create the session, or reuse one an earlier failed attempt already wrote
    async fn write_session(&self, won: &WonClaim) -> Result<ChatSession> {
        if won.attempts > 0 {
            if let Some(existing) = self.ctx.sessions.find_session_for_entry(&won.own.id).await? {
                debug!(
                    "Reusing chat session {} written by an earlier attempt",
                    existing.id
                );
                return Ok(existing);
            }
        }

        self.ctx
            .sessions
            .create_session(
                &self.user_id,
                &won.partner.user_id,
                [won.own.id.clone(), won.partner.id.clone()],
            )
            .await
    }

    /// Our entry was claimed by somebody else: find the chat they created
    async fn complete_as_claimed(&mut self, current: SearchQueueEntry) -> Result<PollResult> {
        if let Some(session) = self.ctx.sessions.find_session_for_entry(&current.id).await? {
            return self.deliver(session, &current).await;
        }

        let claimed_at = current.claimed_at.unwrap_or(current.created_at);
        let waited = self.ctx.clock.now() - claimed_at;
        if waited > to_chrono(self.ctx.settings.claim_grace()) {
            warn!(
                "Entry {} of user {} was claimed by {} {}s ago but no chat appeared, re-queueing",
                current.id,
                self.user_id,
                current.claimed_by.as_deref().unwrap_or("unknown"),
                waited.num_seconds()
            );
            self.abandon_claim(&current).await?;
        } else {
            debug!(
                "User {} was claimed by {}, waiting for the chat session",
                self.user_id,
                current.claimed_by.as_deref().unwrap_or("unknown")
            );
        }

        Ok(PollResult::Waiting)
    }

    /// Drop a claimed entry so the next cycle enqueues a fresh one
    async fn abandon_claim(&mut self, entry: &SearchQueueEntry) -> Result<()> {
        self.ctx.queue.dequeue(&entry.id).await?;
        self.own_entry = None;
        Ok(())
    }

    async fn deliver(
        &mut self,
        session: ChatSession,
        own: &SearchQueueEntry,
    ) -> Result<PollResult> {
        let partner_id = session.partner_of(&self.user_id).cloned().ok_or_else(|| {
            MatchmakingError::InvariantViolation {
                message: format!(
                    "chat session {} does not include user {}",
                    session.id, self.user_id
                ),
            }
        })?;

        let event = MatchFound {
            user_id: self.user_id.clone(),
            chat_id: session.id.clone(),
            partner_id,
            timestamp: self.ctx.clock.now(),
        };
        self.ctx.notifier.publish_match_found(event.clone())?;

        if let Err(e) = self
            .ctx
            .queue
            .dequeue_with_retry(&own.id, &self.ctx.cleanup_policy)
            .await
        {
            warn!(
                "Entry {} of user {} left behind after match: {}",
                own.id, self.user_id, e
            );
        }
        self.own_entry = None;

        info!(
            "User {} matched with {} in chat {}",
            event.user_id, event.partner_id, event.chat_id
        );
        Ok(PollResult::Matched(event))
    }

    async fn finish_cancelled(&mut self) -> PairingOutcome {
        self.won_claim = None;
        if let Some(entry) = self.own_entry.take() {
            if let Err(e) = self.ctx.queue.dequeue(&entry.id).await {
                warn!(
                    "Could not remove entry {} of cancelled search for {}: {}",
                    entry.id, self.user_id, e
                );
            }
        }

        info!("Pairing cancelled for user {}", self.user_id);
        PairingOutcome::Cancelled
    }

    fn on_cycle_succeeded(&mut self) {
        if self.degraded_reported {
            info!(
                "Pairing for user {} recovered after {} failed cycles",
                self.user_id, self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.last_error = None;
        self.degraded_reported = false;
    }

    fn on_cycle_failed(&mut self, error: &anyhow::Error) {
        self.consecutive_failures += 1;
        self.last_error = Some(error.to_string());
        debug!(
            "Poll cycle {} for user {} failed: {}",
            self.consecutive_failures, self.user_id, error
        );

        if self.consecutive_failures >= self.ctx.settings.degraded_after_failures
            && !self.degraded_reported
        {
            self.degraded_reported = true;
            warn!(
                "Pairing degraded for user {} after {} failed cycles: {}",
                self.user_id, self.consecutive_failures, error
            );
            self.ctx.metrics.record_degraded();
            self.ctx.notifier.publish_pairing_degraded(PairingDegraded {
                user_id: self.user_id.clone(),
                consecutive_failures: self.consecutive_failures,
                last_error: self.last_error.clone(),
                timestamp: self.ctx.clock.now(),
            });
        }
    }

    fn set_state(&self, state: PairingState) {
        self.state.send_replace(state);
    }
}

/// Errors that end a search instead of being retried
fn is_fatal(error: &anyhow::Error) -> bool {
    matches!(
        matchmaking_error(error),
        Some(MatchmakingError::Validation { .. }) | Some(MatchmakingError::InvariantViolation { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthSettings, ScoringWeights};
    use crate::pairing::matching::PreferenceOverlapScorer;
    use crate::queue::QUEUE_COLLECTION;
    use crate::session::SESSION_COLLECTION;
    use crate::store::{GuardedStore, InMemoryDocumentStore};
    use crate::types::MatchmakingEvent;
    use crate::utils::SystemClock;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        raw: Arc<InMemoryDocumentStore>,
        ctx: PairingContext,
    }

    fn fast_settings() -> PairingSettings {
        PairingSettings {
            poll_interval_ms: 20,
            poll_jitter_ms: 5,
            page_size: 25,
            max_claim_attempts: 3,
            stale_ttl_seconds: 120,
            claim_grace_seconds: 10,
            degraded_after_failures: 3,
        }
    }

    fn harness_with(settings: PairingSettings) -> Harness {
        let raw = Arc::new(InMemoryDocumentStore::new());
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let monitor = Arc::new(ConnectionHealthMonitor::new(
            raw.clone(),
            HealthSettings {
                probe_interval_ms: 50,
                initial_backoff_ms: 5,
                max_backoff_ms: 20,
            },
            Duration::from_secs(1),
            metrics.clone(),
            clock.clone(),
        ));
        let store: Arc<dyn DocumentStore> = Arc::new(GuardedStore::new(
            raw.clone(),
            monitor.clone(),
            Duration::from_secs(1),
        ));

        let ctx = PairingContext {
            store: store.clone(),
            queue: Arc::new(SearchQueueManager::new(
                store.clone(),
                monitor.clone(),
                metrics.clone(),
                clock.clone(),
            )),
            sessions: Arc::new(ChatSessionFactory::new(
                store.clone(),
                metrics.clone(),
                clock.clone(),
            )),
            notifier: Arc::new(MatchNotifier::new(64, metrics.clone())),
            monitor,
            scorer: Arc::new(PreferenceOverlapScorer::new(ScoringWeights::default())),
            settings,
            cleanup_policy: RetryPolicy {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                max_attempts: 3,
            },
            metrics,
            clock,
        };
        Harness { raw, ctx }
    }

    fn harness() -> Harness {
        harness_with(fast_settings())
    }

    fn prefs(interest: &str) -> Preferences {
        Preferences::from([("interest".to_string(), json!(interest))])
    }

    async fn coordinator(h: &Harness, user: &str, interest: &str) -> PairingCoordinator {
        let entry = h.ctx.queue.enqueue(user, prefs(interest)).await.unwrap();
        PairingCoordinator::new(h.ctx.clone(), user.to_string(), prefs(interest), Some(entry)).0
    }

    fn micros_ago(seconds: i64) -> i64 {
        (Utc::now() - chrono::Duration::seconds(seconds)).timestamp_micros()
    }

    #[tokio::test]
    async fn test_alone_in_queue_keeps_waiting() {
        let h = harness();
        let mut alice = coordinator(&h, "alice", "music").await;

        assert_eq!(alice.poll_cycle().await.unwrap(), PollResult::Waiting);
        assert_eq!(alice.poll_cycle().await.unwrap(), PollResult::Waiting);
        assert_eq!(h.raw.document_count(QUEUE_COLLECTION), 1);
        assert!(alice.own_entry().unwrap().is_searching());
    }

    #[tokio::test]
    async fn test_winner_and_claimed_side_get_same_chat() {
        let h = harness();
        let mut alice = coordinator(&h, "alice", "music").await;
        let mut bob = coordinator(&h, "bob", "music").await;
        let mut events = h.ctx.notifier.subscribe();

        // alice claims bob and creates the session
        let alice_match = match alice.poll_cycle().await.unwrap() {
            PollResult::Matched(event) => event,
            other => panic!("expected match, got {:?}", other),
        };
        assert_eq!(alice_match.partner_id, "bob");

        // bob discovers it from his claimed entry
        let bob_match = match bob.poll_cycle().await.unwrap() {
            PollResult::Matched(event) => event,
            other => panic!("expected match, got {:?}", other),
        };
        assert_eq!(bob_match.partner_id, "alice");
        assert_eq!(alice_match.chat_id, bob_match.chat_id);

        assert_eq!(h.raw.document_count(QUEUE_COLLECTION), 0);
        assert_eq!(h.raw.document_count(SESSION_COLLECTION), 1);

        let mut delivered = Vec::new();
        while let Ok(MatchmakingEvent::MatchFound(m)) = events.try_recv() {
            delivered.push(m.user_id);
        }
        delivered.sort();
        assert_eq!(delivered, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_stale_entries_are_reclaimed_not_claimed() {
        let h = harness();
        h.raw
            .seed(
                QUEUE_COLLECTION,
                "ghost-entry",
                json!({"userId": "ghost", "status": "Searching", "createdAt": micros_ago(600)}),
            )
            .unwrap();
        let mut alice = coordinator(&h, "alice", "music").await;

        assert_eq!(alice.poll_cycle().await.unwrap(), PollResult::Waiting);
        assert!(h.raw.documents(QUEUE_COLLECTION).iter().all(|d| d.id != "ghost-entry"));
        assert!(alice.own_entry().unwrap().is_searching());
        assert_eq!(h.raw.document_count(SESSION_COLLECTION), 0);
    }

    #[tokio::test]
    async fn test_entry_claimed_after_scan_survives_reclamation() {
        let h = harness();
        h.raw
            .seed(
                QUEUE_COLLECTION,
                "ghost-entry",
                json!({"userId": "ghost", "status": "Searching", "createdAt": micros_ago(600)}),
            )
            .unwrap();
        let alice = coordinator(&h, "alice", "music").await;
        let bob_entry = h.ctx.queue.enqueue("bob", prefs("music")).await.unwrap();

        let scanned = h.ctx.queue.scan_searching("alice", 25).await.unwrap();
        let ghost = scanned
            .iter()
            .find(|e| e.id == "ghost-entry")
            .cloned()
            .unwrap();

        // bob claims the entry between alice's scan and her reclamation
        let claimed = try_claim(h.ctx.store.as_ref(), &bob_entry, &ghost, Utc::now())
            .await
            .unwrap();
        assert!(matches!(claimed, ClaimOutcome::Claimed { .. }));

        let fresh = alice.reclaim_stale(scanned, Utc::now()).await;
        assert!(fresh.iter().all(|e| e.id != "ghost-entry"));

        let ghost_now = h.ctx.queue.fetch_own(&ghost.id).await.unwrap().unwrap();
        assert_eq!(ghost_now.status, SearchStatus::Claimed);
        assert_eq!(ghost_now.claimed_by.as_deref(), Some("bob"));
        assert_eq!(
            h.ctx.metrics.queue().stale_entries_reclaimed_total.get(),
            0
        );
    }

    #[tokio::test]
    async fn test_vanished_entry_is_requeued() {
        let h = harness();
        let mut alice = coordinator(&h, "alice", "music").await;
        let original = alice.own_entry().unwrap().id.clone();

        h.raw.delete(QUEUE_COLLECTION, &original).await.unwrap();
        assert_eq!(alice.poll_cycle().await.unwrap(), PollResult::Waiting);

        let replacement = alice.own_entry().unwrap();
        assert_ne!(replacement.id, original);
        assert_eq!(h.raw.document_count(QUEUE_COLLECTION), 1);
    }

    #[tokio::test]
    async fn test_claim_without_session_is_recovered_after_grace() {
        let mut settings = fast_settings();
        settings.claim_grace_seconds = 5;
        let h = harness_with(settings);

        h.raw
            .seed(
                QUEUE_COLLECTION,
                "orphaned",
                json!({
                    "userId": "alice",
                    "status": "Claimed",
                    "claimedBy": "vanished-winner",
                    "claimedAt": micros_ago(30),
                    "createdAt": micros_ago(40),
                }),
            )
            .unwrap();
        let orphaned = crate::queue::decode_entry(
            h.raw.get(QUEUE_COLLECTION, "orphaned").await.unwrap().unwrap(),
        )
        .unwrap();
        let (mut alice, _state) = PairingCoordinator::new(
            h.ctx.clone(),
            "alice".to_string(),
            prefs("music"),
            Some(orphaned),
        );

        assert_eq!(alice.poll_cycle().await.unwrap(), PollResult::Waiting);
        assert!(alice.own_entry().is_none());
        assert_eq!(h.raw.document_count(QUEUE_COLLECTION), 0);

        // Next cycle puts a fresh Searching entry back
        assert_eq!(alice.poll_cycle().await.unwrap(), PollResult::Waiting);
        assert!(alice.own_entry().unwrap().is_searching());
    }

    #[tokio::test]
    async fn test_recent_claim_waits_for_session() {
        let h = harness();
        h.raw
            .seed(
                QUEUE_COLLECTION,
                "fresh-claim",
                json!({
                    "userId": "alice",
                    "status": "Claimed",
                    "claimedBy": "bob",
                    "claimedAt": micros_ago(1),
                    "createdAt": micros_ago(2),
                }),
            )
            .unwrap();
        let entry = crate::queue::decode_entry(
            h.raw.get(QUEUE_COLLECTION, "fresh-claim").await.unwrap().unwrap(),
        )
        .unwrap();
        let (mut alice, _state) =
            PairingCoordinator::new(h.ctx.clone(), "alice".to_string(), prefs("music"), Some(entry));

        assert_eq!(alice.poll_cycle().await.unwrap(), PollResult::Waiting);
        assert_eq!(alice.own_entry().unwrap().id, "fresh-claim");
        assert_eq!(h.raw.document_count(QUEUE_COLLECTION), 1);
    }

    async fn claim_manually(h: &Harness, own: &SearchQueueEntry, partner: &SearchQueueEntry) -> WonClaim {
        match try_claim(h.ctx.store.as_ref(), own, partner, Utc::now()).await.unwrap() {
            ClaimOutcome::Claimed { claimed_at } => WonClaim {
                own: own.clone(),
                partner: partner.clone(),
                claimed_at,
                attempts: 0,
            },
            other => panic!("expected claim, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_session_write_is_retried() {
        let h = harness();
        let mut alice = coordinator(&h, "alice", "music").await;
        let bob = coordinator(&h, "bob", "music").await;
        let won = claim_manually(&h, alice.own_entry().unwrap(), bob.own_entry().unwrap()).await;

        alice.won_claim = Some(won);
        h.raw.set_reachable(false);
        assert!(alice.poll_cycle().await.is_err());
        assert_eq!(alice.won_claim.as_ref().map(|w| w.attempts), Some(1));

        h.raw.set_reachable(true);
        let event = match alice.poll_cycle().await.unwrap() {
            PollResult::Matched(event) => event,
            other => panic!("expected match, got {:?}", other),
        };
        assert_eq!(event.partner_id, "bob");
        assert_eq!(h.raw.document_count(SESSION_COLLECTION), 1);
    }

    #[tokio::test]
    async fn test_retry_reuses_session_from_lost_response() {
        let h = harness();
        let mut alice = coordinator(&h, "alice", "music").await;
        let bob = coordinator(&h, "bob", "music").await;
        let mut won = claim_manually(&h, alice.own_entry().unwrap(), bob.own_entry().unwrap()).await;

        // The first insert landed but its response never arrived
        let written = h
            .ctx
            .sessions
            .create_session(
                &"alice".to_string(),
                &"bob".to_string(),
                [won.own.id.clone(), won.partner.id.clone()],
            )
            .await
            .unwrap();
        won.attempts = 1;
        alice.won_claim = Some(won);

        match alice.poll_cycle().await.unwrap() {
            PollResult::Matched(event) => assert_eq!(event.chat_id, written.id),
            other => panic!("expected match, got {:?}", other),
        }
        assert_eq!(h.raw.document_count(SESSION_COLLECTION), 1);
    }

    #[tokio::test]
    async fn test_run_cancel_removes_entry() {
        let h = harness();
        let alice = coordinator(&h, "alice", "music").await;
        let state = alice.state.subscribe();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(alice.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*state.borrow(), PairingState::Polling);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), PairingOutcome::Cancelled);
        assert_eq!(*state.borrow(), PairingState::Cancelled);
        assert_eq!(h.raw.document_count(QUEUE_COLLECTION), 0);
    }

    #[tokio::test]
    async fn test_degraded_reported_once_per_episode() {
        let h = harness();
        let alice = coordinator(&h, "alice", "music").await;
        let mut events = h.ctx.notifier.subscribe();
        let cancel = CancellationToken::new();

        h.raw.set_reachable(false);
        let task = tokio::spawn(alice.run(cancel.clone()));

        let degraded = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(MatchmakingEvent::PairingDegraded(event)) = events.recv().await {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(degraded.user_id, "alice");
        assert!(degraded.consecutive_failures >= 3);

        // Stay down a while longer: no second degraded event
        tokio::time::sleep(Duration::from_millis(150)).await;
        let mut repeats = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, MatchmakingEvent::PairingDegraded(_)) {
                repeats += 1;
            }
        }
        assert_eq!(repeats, 0);

        h.raw.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(h.ctx.monitor.is_connected());

        cancel.cancel();
        assert_eq!(task.await.unwrap(), PairingOutcome::Cancelled);
    }
}
