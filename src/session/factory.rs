//! Chat session factory
//!
//! Only the winner of a claim creates the session. The other side finds it
//! through the `entryIds` it was created from.

use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::store::{Document, DocumentStore, Query};
use crate::types::{ChatSession, EntryId, UserId};
use crate::utils::Clock;
use chrono::SubsecRound;
use std::sync::Arc;
use tracing::{info, warn};

/// Collection holding chat sessions
pub const SESSION_COLLECTION: &str = "chat_sessions";

const FIELD_ENTRY_IDS: &str = "entryIds";

pub struct ChatSessionFactory {
    store: Arc<dyn DocumentStore>,
    metrics: Arc<MetricsCollector>,
    clock: Arc<dyn Clock>,
}

impl ChatSessionFactory {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        metrics: Arc<MetricsCollector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            metrics,
            clock,
        }
    }

    /// Write the chat session for a committed claim
    pub async fn create_session(
        &self,
        user_a: &UserId,
        user_b: &UserId,
        entry_ids: [EntryId; 2],
    ) -> Result<ChatSession> {
        let mut session = ChatSession::new(
            user_a.clone(),
            user_b.clone(),
            entry_ids,
            self.clock.now().trunc_subsecs(6),
        )?;

        let body = serde_json::to_value(&session).map_err(|e| MatchmakingError::InternalError {
            message: format!("Failed to encode chat session: {}", e),
        })?;
        session.id = self.store.insert(SESSION_COLLECTION, body).await?;
        self.metrics.record_session_created();

        info!(
            "Created chat session {} for {} and {}",
            session.id, user_a, user_b
        );
        Ok(session)
    }

    /// Session created from the given queue entry, if any
    pub async fn find_session_for_entry(&self, entry_id: &EntryId) -> Result<Option<ChatSession>> {
        let query = Query::new()
            .where_array_contains(FIELD_ENTRY_IDS, entry_id.as_str())
            .limit(2);
        let documents = self.store.query(SESSION_COLLECTION, &query).await?;

        if documents.len() > 1 {
            warn!(
                "Entry {} is referenced by {} chat sessions, using the first",
                entry_id,
                documents.len()
            );
        }

        match documents.into_iter().next() {
            Some(document) => decode_session(document).map(Some),
            None => Ok(None),
        }
    }
}

fn decode_session(document: Document) -> Result<ChatSession> {
    let mut session: ChatSession = serde_json::from_value(document.data).map_err(|e| {
        MatchmakingError::MalformedDocument {
            document_id: document.id.clone(),
            reason: e.to_string(),
        }
    })?;
    session.id = document.id;
    Ok(session)
}
