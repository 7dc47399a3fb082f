//! Store wrapper that bounds every operation and feeds the health monitor

use crate::error::{is_store_unavailable, matchmaking_error, MatchmakingError, Result};
use crate::health::ConnectionHealthMonitor;
use crate::store::{Document, DocumentStore, Query, TransactionFn, TransactionOutcome};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Wraps a `DocumentStore` so that every call is bounded by a timeout and its
/// outcome is reported to the connection health monitor. Timeouts and
/// unrecognized store errors surface as `StoreUnavailable`.
pub struct GuardedStore {
    inner: Arc<dyn DocumentStore>,
    monitor: Arc<ConnectionHealthMonitor>,
    timeout: Duration,
}

impl GuardedStore {
    pub fn new(
        inner: Arc<dyn DocumentStore>,
        monitor: Arc<ConnectionHealthMonitor>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            monitor,
            timeout,
        }
    }

    pub fn monitor(&self) -> &Arc<ConnectionHealthMonitor> {
        &self.monitor
    }

    async fn guard<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => {
                self.monitor.report_success();
                Ok(value)
            }
            Ok(Err(e)) if is_store_unavailable(&e) => {
                self.monitor.report_failure(operation, &e.to_string());
                Err(e)
            }
            Ok(Err(e)) if matchmaking_error(&e).is_some() => {
                // The store answered; the failure is ours, not the network's
                self.monitor.report_success();
                Err(e)
            }
            Ok(Err(e)) => {
                let message = format!("{} failed: {:#}", operation, e);
                self.monitor.report_failure(operation, &message);
                Err(MatchmakingError::store_unavailable(message).into())
            }
            Err(_) => {
                let message = format!("{} timed out after {:?}", operation, self.timeout);
                debug!("{}", message);
                self.monitor.report_failure(operation, &message);
                Err(MatchmakingError::store_unavailable(message).into())
            }
        }
    }
}

#[async_trait]
impl DocumentStore for GuardedStore {
    async fn insert(&self, collection: &str, data: Value) -> Result<String> {
        self.guard("insert", self.inner.insert(collection, data))
            .await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.guard("get", self.inner.get(collection, id)).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.guard("delete", self.inner.delete(collection, id)).await
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>> {
        self.guard("query", self.inner.query(collection, query))
            .await
    }

    async fn transact(
        &self,
        collection: &str,
        read_ids: &[String],
        decide: TransactionFn,
    ) -> Result<TransactionOutcome> {
        self.guard("transact", self.inner.transact(collection, read_ids, decide))
            .await
    }
}
