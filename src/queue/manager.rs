//! Search queue manager
//!
//! Creates and removes queue entries. Entries are never updated in place here;
//! the only in-place transition is the claim transaction in `pairing::claim`.

use crate::error::{MatchmakingError, Result};
use crate::health::{ConnectionHealthMonitor, RetryPolicy};
use crate::metrics::MetricsCollector;
use crate::queue::entry::{
    decode_entry, encode_entry, FIELD_CREATED_AT, FIELD_STATUS, FIELD_USER_ID, QUEUE_COLLECTION,
};
use crate::store::{
    Document, DocumentStore, Query, SortDirection, TransactionDecision, TransactionFn, Write,
};
use crate::types::{EntryId, Preferences, SearchQueueEntry, SearchStatus};
use crate::utils::Clock;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SearchQueueManager {
    store: Arc<dyn DocumentStore>,
    monitor: Arc<ConnectionHealthMonitor>,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
}

impl SearchQueueManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        monitor: Arc<ConnectionHealthMonitor>,
        metrics: Arc<MetricsCollector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            monitor,
            metrics,
            clock,
        }
    }

    /// Reject empty or whitespace-only user ids
    pub fn validate_user_id(user_id: &str) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(MatchmakingError::validation("user id must not be empty").into());
        }
        Ok(())
    }

    /// Write a new Searching entry for `user_id`.
    ///
    /// Uses the health monitor's last known state instead of probing, so a
    /// known outage fails fast with `StoreUnavailable`.
    pub async fn enqueue(
        &self,
        user_id: &str,
        preferences: Preferences,
    ) -> Result<SearchQueueEntry> {
        Self::validate_user_id(user_id)?;

        if !self.monitor.is_connected() {
            let status = self.monitor.status();
            return Err(MatchmakingError::store_unavailable(format!(
                "cannot enqueue {} while disconnected (last error: {})",
                user_id,
                status.last_error.as_deref().unwrap_or("unknown")
            ))
            .into());
        }

        let mut entry = SearchQueueEntry {
            id: String::new(),
            user_id: user_id.to_string(),
            preferences,
            status: SearchStatus::Searching,
            claimed_by: None,
            claimed_at: None,
            created_at: self.clock.now(),
        };

        entry.id = self
            .store
            .insert(QUEUE_COLLECTION, encode_entry(&entry)?)
            .await?;
        self.metrics.record_entry_enqueued();

        info!(
            "Enqueued user {} with entry {} ({} preferences)",
            entry.user_id,
            entry.id,
            entry.preferences.len()
        );
        Ok(entry)
    }

    /// Delete an entry. Deleting an absent entry is not an error.
    pub async fn dequeue(&self, entry_id: &str) -> Result<()> {
        self.store.delete(QUEUE_COLLECTION, entry_id).await?;
        self.metrics.record_entry_dequeued();
        debug!("Dequeued entry {}", entry_id);
        Ok(())
    }

    /// `dequeue` with bounded retries, for post-match cleanup
    pub async fn dequeue_with_retry(&self, entry_id: &str, policy: &RetryPolicy) -> Result<()> {
        let mut failures = 0;
        loop {
            match self.dequeue(entry_id).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    failures += 1;
                    if failures >= policy.max_attempts {
                        warn!(
                            "Giving up on deleting entry {} after {} attempts: {}",
                            entry_id, failures, e
                        );
                        return Err(e);
                    }
                    debug!(
                        "Delete of entry {} failed (attempt {}), retrying: {}",
                        entry_id, failures, e
                    );
                    tokio::time::sleep(policy.delay_for(failures)).await;
                }
            }
        }
    }

    /// Delete `entry_id` only while it is still Searching and was created
    /// before `cutoff`. Returns false when the entry was claimed, renewed or
    /// removed since it was last read.
    pub async fn reclaim_if_stale(&self, entry_id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let id = entry_id.to_string();
        let cutoff_micros = cutoff.timestamp_micros();

        let decide: TransactionFn = Box::new(move |snapshot: &[Option<Document>]| {
            let doc = match snapshot.first() {
                Some(Some(doc)) => doc,
                _ => return TransactionDecision::Abort("entry_gone".to_string()),
            };

            let searching = doc
                .field(FIELD_STATUS)
                .and_then(Value::as_str)
                .map_or(false, |status| status == SearchStatus::Searching.to_string());
            if !searching {
                return TransactionDecision::Abort("entry_not_searching".to_string());
            }

            match doc.field(FIELD_CREATED_AT).and_then(Value::as_i64) {
                Some(created_at) if created_at < cutoff_micros => {
                    TransactionDecision::Commit(vec![Write::Delete { id: id.clone() }])
                }
                _ => TransactionDecision::Abort("entry_fresh".to_string()),
            }
        });

        let outcome = self
            .store
            .transact(QUEUE_COLLECTION, &[entry_id.to_string()], decide)
            .await?;

        if outcome.is_committed() {
            self.metrics.record_entry_dequeued();
            debug!("Reclaimed stale entry {}", entry_id);
            Ok(true)
        } else {
            debug!("Entry {} not reclaimed: {:?}", entry_id, outcome);
            Ok(false)
        }
    }

    /// Read the caller's own entry
    pub async fn fetch_own(&self, entry_id: &EntryId) -> Result<Option<SearchQueueEntry>> {
        self.store
            .get(QUEUE_COLLECTION, entry_id)
            .await?
            .map(decode_entry)
            .transpose()
    }

    /// Oldest-first page of other users' Searching entries. Malformed
    /// documents are skipped.
    pub async fn scan_searching(
        &self,
        exclude_user_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchQueueEntry>> {
        let query = Query::new()
            .where_eq(FIELD_STATUS, SearchStatus::Searching.to_string())
            .where_not_eq(FIELD_USER_ID, exclude_user_id)
            .order_by(FIELD_CREATED_AT, SortDirection::Ascending)
            .limit(limit);

        let documents = self.store.query(QUEUE_COLLECTION, &query).await?;
        let entries = documents
            .into_iter()
            .filter_map(|doc| match decode_entry(doc) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping queue document: {}", e);
                    None
                }
            })
            .collect();

        Ok(entries)
    }
}
