//! Common types used throughout the matchmaking core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of an anonymous user
pub type UserId = String;

/// Store-assigned identifier of a search queue entry
pub type EntryId = String;

/// Store-assigned identifier of a chat session
pub type ChatId = String;

/// Free-form matching preferences, e.g. `{"interest": "music", "language": "en"}`.
///
/// Values are arbitrary JSON; list values are compared element-wise when scoring.
pub type Preferences = BTreeMap<String, serde_json::Value>;

/// Lifecycle of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchStatus {
    Searching,
    Claimed,
    Cancelled,
}

impl std::fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchStatus::Searching => write!(f, "Searching"),
            SearchStatus::Claimed => write!(f, "Claimed"),
            SearchStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// A single user's record of intent to be matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQueueEntry {
    /// Store-assigned id. Not part of the stored document body.
    #[serde(skip)]
    pub id: EntryId,
    pub user_id: UserId,
    #[serde(default)]
    pub preferences: Preferences,
    pub status: SearchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<UserId>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_microseconds_option"
    )]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Stored as integer microseconds so the store orders entries numerically
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: DateTime<Utc>,
}

impl SearchQueueEntry {
    pub fn is_searching(&self) -> bool {
        self.status == SearchStatus::Searching
    }

    /// How long this entry has been waiting at `now`
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}

/// The shared chat record created once a pairing is claimed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    #[serde(skip)]
    pub id: ChatId,
    participants: [UserId; 2],
    entry_ids: [EntryId; 2],
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    /// Build a session body. The participant set is fixed from here on.
    pub fn new(
        user_a: UserId,
        user_b: UserId,
        entry_ids: [EntryId; 2],
        created_at: DateTime<Utc>,
    ) -> crate::Result<Self> {
        if user_a == user_b {
            return Err(crate::MatchmakingError::validation(format!(
                "chat session needs two distinct participants, got '{}' twice",
                user_a
            ))
            .into());
        }

        Ok(Self {
            id: String::new(),
            participants: [user_a, user_b],
            entry_ids,
            created_at,
        })
    }

    pub fn participants(&self) -> &[UserId; 2] {
        &self.participants
    }

    pub fn entry_ids(&self) -> &[EntryId; 2] {
        &self.entry_ids
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// The other participant, if `user_id` is one of the two
    pub fn partner_of(&self, user_id: &str) -> Option<&UserId> {
        match &self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }
}

/// Process-local view of store reachability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_checked_at: DateTime<Utc>,
}

impl ConnectionStatus {
    /// Optimistic initial state
    pub fn initial() -> Self {
        Self {
            connected: true,
            last_error: None,
            last_checked_at: crate::utils::current_timestamp(),
        }
    }
}

/// Event emitted when a pairing completed for the local user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFound {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub partner_id: UserId,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when pairing keeps failing because the store is unreachable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingDegraded {
    pub user_id: UserId,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Union type for all events delivered to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MatchmakingEvent {
    MatchFound(MatchFound),
    ConnectionChanged(ConnectionStatus),
    PairingDegraded(PairingDegraded),
}
