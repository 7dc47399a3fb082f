//! Match notifier
//!
//! Fans matchmaking events out over a `tokio::sync::broadcast` channel so the
//! poll loop never waits on the UI. `MatchFound` is delivered at most once per
//! (user, chat) pair, even if a recovering poll loop reaches the same session
//! twice.

use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::types::{ChatId, ConnectionStatus, MatchFound, MatchmakingEvent, PairingDegraded, UserId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

pub struct MatchNotifier {
    sender: broadcast::Sender<MatchmakingEvent>,
    delivered: Mutex<HashSet<(UserId, ChatId)>>,
    metrics: Arc<MetricsCollector>,
}

impl MatchNotifier {
    pub fn new(capacity: usize, metrics: Arc<MetricsCollector>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            delivered: Mutex::new(HashSet::new()),
            metrics,
        }
    }

    /// New receiver. Only events sent after this call are observed.
    pub fn subscribe(&self) -> broadcast::Receiver<MatchmakingEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish `MatchFound`. Returns false if this (user, chat) pair was
    /// already delivered.
    pub fn publish_match_found(&self, event: MatchFound) -> Result<bool> {
        {
            let mut delivered = self
                .delivered
                .lock()
                .map_err(|_| MatchmakingError::InternalError {
                    message: "Failed to acquire delivered matches lock".to_string(),
                })?;
            if !delivered.insert((event.user_id.clone(), event.chat_id.clone())) {
                debug!(
                    "Match {} for user {} already delivered, skipping",
                    event.chat_id, event.user_id
                );
                return Ok(false);
            }
        }

        debug!(
            "Delivering match {} to user {} (partner {})",
            event.chat_id, event.user_id, event.partner_id
        );
        self.metrics.record_match_delivered();
        self.send(MatchmakingEvent::MatchFound(event));
        Ok(true)
    }

    pub fn publish_connection_changed(&self, status: ConnectionStatus) {
        self.send(MatchmakingEvent::ConnectionChanged(status));
    }

    pub fn publish_pairing_degraded(&self, event: PairingDegraded) {
        self.send(MatchmakingEvent::PairingDegraded(event));
    }

    /// Number of (user, chat) pairs delivered so far
    pub fn delivered_count(&self) -> usize {
        self.delivered
            .lock()
            .map(|delivered| delivered.len())
            .unwrap_or(0)
    }

    fn send(&self, event: MatchmakingEvent) {
        // Having nobody subscribed is not an error
        if self.sender.send(event).is_err() {
            debug!("No subscribers for matchmaking event");
        }
    }
}
