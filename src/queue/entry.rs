//! Queue entry document codec and field names

use crate::error::{MatchmakingError, Result};
use crate::store::Document;
use crate::types::SearchQueueEntry;
use serde_json::Value;

/// Collection holding every user's queue entry
pub const QUEUE_COLLECTION: &str = "search_queue";

pub const FIELD_USER_ID: &str = "userId";
pub const FIELD_STATUS: &str = "status";
pub const FIELD_CLAIMED_BY: &str = "claimedBy";
pub const FIELD_CLAIMED_AT: &str = "claimedAt";
pub const FIELD_CREATED_AT: &str = "createdAt";

/// Decode a stored document into an entry, attaching its id
pub fn decode_entry(document: Document) -> Result<SearchQueueEntry> {
    let mut entry: SearchQueueEntry = serde_json::from_value(document.data).map_err(|e| {
        MatchmakingError::MalformedDocument {
            document_id: document.id.clone(),
            reason: e.to_string(),
        }
    })?;
    entry.id = document.id;
    Ok(entry)
}

/// Encode an entry body. The id is not part of the body.
pub fn encode_entry(entry: &SearchQueueEntry) -> Result<Value> {
    serde_json::to_value(entry).map_err(|e| {
        MatchmakingError::InternalError {
            message: format!("Failed to encode queue entry for {}: {}", entry.user_id, e),
        }
        .into()
    })
}
