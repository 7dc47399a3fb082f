//! In-memory document store
//!
//! A single-process implementation of `DocumentStore` used by tests and the
//! simulation binary. Transactions run under one write lock, which gives the
//! read-then-conditional-write atomicity the claim protocol depends on.
//!
//! The store can also simulate an unreliable network: it can be made
//! unreachable, fail a fixed number of upcoming operations, or add latency.

use crate::error::{MatchmakingError, Result};
use crate::store::{
    compare_values, Document, DocumentStore, Query, SortDirection, TransactionDecision,
    TransactionFn, TransactionOutcome, Write,
};
use crate::utils::generate_document_id;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

type Collection = BTreeMap<String, Value>;

/// Document store kept entirely in process memory
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Collection>>,
    unreachable: AtomicBool,
    failures_remaining: AtomicU32,
    latency_ms: AtomicU64,
    operations: AtomicU64,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail (or succeed again)
    pub fn set_reachable(&self, reachable: bool) {
        debug!("In-memory store reachable: {}", reachable);
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }

    /// Fail the next `count` operations, then recover
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of operations attempted so far, including failed ones
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Number of documents currently in `collection`
    pub fn document_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|collections| collections.get(collection).map_or(0, |c| c.len()))
            .unwrap_or(0)
    }

    /// Snapshot of every document in `collection`, ordered by id
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .map(|collections| {
                collections
                    .get(collection)
                    .map(|c| {
                        c.iter()
                            .map(|(id, data)| Document::new(id.clone(), data.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Write a document with a caller-chosen id, bypassing fault injection
    pub fn seed(&self, collection: &str, id: &str, data: Value) -> Result<()> {
        let mut collections = self.write_lock()?;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
        Ok(())
    }

    /// Apply latency and injected failures before an operation
    async fn simulate_network(&self, operation: &str) -> Result<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(MatchmakingError::store_unavailable(format!(
                "{} failed: store unreachable",
                operation
            ))
            .into());
        }

        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MatchmakingError::store_unavailable(format!(
                "{} failed: injected failure",
                operation
            ))
            .into());
        }

        Ok(())
    }

    fn write_lock(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Collection>>> {
        self.collections.write().map_err(|_| {
            MatchmakingError::InternalError {
                message: "Failed to acquire store lock".to_string(),
            }
            .into()
        })
    }

    fn read_lock(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Collection>>> {
        self.collections.read().map_err(|_| {
            MatchmakingError::InternalError {
                message: "Failed to acquire store lock".to_string(),
            }
            .into()
        })
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(&self, collection: &str, data: Value) -> Result<String> {
        self.simulate_network("insert").await?;

        let id = generate_document_id();
        let mut collections = self.write_lock()?;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), data);
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.simulate_network("get").await?;

        let collections = self.read_lock()?;
        Ok(collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|data| Document::new(id, data.clone())))
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.simulate_network("delete").await?;

        let mut collections = self.write_lock()?;
        if let Some(c) = collections.get_mut(collection) {
            c.remove(id);
        }
        Ok(())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>> {
        self.simulate_network("query").await?;

        let collections = self.read_lock()?;
        let mut results: Vec<Document> = collections
            .get(collection)
            .map(|c| {
                c.iter()
                    .filter(|(_, data)| query.matches(data))
                    .map(|(id, data)| Document::new(id.clone(), data.clone()))
                    .collect()
            })
            .unwrap_or_default();
        drop(collections);

        if let Some(order) = &query.order_by {
            results.sort_by(|a, b| {
                let ordering = compare_values(a.field(&order.field), b.field(&order.field));
                match order.direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = query.limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn transact(
        &self,
        collection: &str,
        read_ids: &[String],
        decide: TransactionFn,
    ) -> Result<TransactionOutcome> {
        self.simulate_network("transact").await?;

        let mut collections = self.write_lock()?;
        let documents = collections.entry(collection.to_string()).or_default();

        let snapshot: Vec<Option<Document>> = read_ids
            .iter()
            .map(|id| documents.get(id).map(|data| Document::new(id, data.clone())))
            .collect();

        let writes = match decide(&snapshot) {
            TransactionDecision::Commit(writes) => writes,
            TransactionDecision::Abort(reason) => return Ok(TransactionOutcome::Aborted(reason)),
        };

        // Validate every write before applying any of them
        for write in &writes {
            if let Write::Update { id, .. } = write {
                if !documents.contains_key(id) {
                    return Ok(TransactionOutcome::Aborted(format!(
                        "document {} no longer exists",
                        id
                    )));
                }
            }
        }

        for write in writes {
            match write {
                Write::Update { id, fields } => {
                    if let Some(Value::Object(existing)) = documents.get_mut(&id) {
                        existing.extend(fields);
                    }
                }
                Write::Delete { id } => {
                    documents.remove(&id);
                }
            }
        }

        Ok(TransactionOutcome::Committed)
    }
}
