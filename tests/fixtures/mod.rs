//! Shared setup for integration tests

#![allow(dead_code)]

use chat_roulette::config::AppConfig;
use chat_roulette::queue::QUEUE_COLLECTION;
use chat_roulette::types::{MatchFound, MatchmakingEvent, Preferences};
use chat_roulette::{InMemoryDocumentStore, Matchmaker, SearchHandle};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Config with poll and probe intervals short enough for tests
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.pairing.poll_interval_ms = 20;
    config.pairing.poll_jitter_ms = 5;
    config.pairing.claim_grace_seconds = 1;
    config.health.probe_interval_ms = 20;
    config.health.initial_backoff_ms = 5;
    config.health.max_backoff_ms = 40;
    config.store.operation_timeout_ms = 500;
    config.service.event_buffer_size = 1024;
    config
}

/// A started matchmaker over a fresh in-memory store
pub fn create_test_system() -> (Arc<InMemoryDocumentStore>, Matchmaker) {
    create_test_system_with(fast_config())
}

pub fn create_test_system_with(config: AppConfig) -> (Arc<InMemoryDocumentStore>, Matchmaker) {
    let store = Arc::new(InMemoryDocumentStore::new());
    let matchmaker = Matchmaker::new(config, store.clone()).unwrap();
    matchmaker.start().unwrap();
    (store, matchmaker)
}

pub fn interest(value: &str) -> Preferences {
    Preferences::from([("interest".to_string(), json!(value))])
}

/// Searching entry body as another client would have written it
pub fn searching_entry(user_id: &str, interest: &str, created_at_micros: i64) -> Value {
    json!({
        "userId": user_id,
        "preferences": { "interest": interest },
        "status": "Searching",
        "createdAt": created_at_micros,
    })
}

/// Seed a searching entry created `age` ago
pub fn seed_entry(store: &InMemoryDocumentStore, id: &str, user_id: &str, age: Duration) {
    let created_at = chrono::Utc::now() - chrono::Duration::from_std(age).unwrap();
    store
        .seed(
            QUEUE_COLLECTION,
            id,
            searching_entry(user_id, "music", created_at.timestamp_micros()),
        )
        .unwrap();
}

/// Wait for this search's MatchFound event
pub async fn expect_match(handle: &mut SearchHandle) -> MatchFound {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match handle.recv_event().await {
                Some(MatchmakingEvent::MatchFound(found)) => return found,
                Some(_) => continue,
                None => panic!("event channel closed before {} matched", handle.user_id()),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{} was not matched in time", handle.user_id()))
}

/// Poll `condition` until it holds or five seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
