//! Error types for the matchmaking core
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the crate. Callers that need to branch on the kind of failure use
//! `downcast_ref::<MatchmakingError>()` or the helpers below.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatchmakingError {
    /// Bad input from the caller. Never retried.
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    /// The shared store could not be reached, or an operation timed out.
    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// A claim lost the race for a candidate. Expected outcome, not a failure.
    #[error("Claim aborted for entry {entry_id}: {reason}")]
    ClaimAborted { entry_id: String, reason: String },

    /// Store failures persisted for several consecutive poll cycles.
    #[error("Pairing degraded after {consecutive_failures} consecutive failed cycles")]
    PairingDegraded { consecutive_failures: u32 },

    /// A local bug: the protocol reached a state it should never reach.
    #[error("Invariant violated: {message}")]
    InvariantViolation { message: String },

    #[error("Malformed document {document_id}: {reason}")]
    MalformedDocument { document_id: String, reason: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl MatchmakingError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Whether this failure is transient and worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MatchmakingError::StoreUnavailable { .. } | MatchmakingError::ClaimAborted { .. }
        )
    }
}

/// Look through an anyhow error for a `MatchmakingError`
pub fn matchmaking_error(err: &anyhow::Error) -> Option<&MatchmakingError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<MatchmakingError>())
}

/// True when the error chain carries `StoreUnavailable`
pub fn is_store_unavailable(err: &anyhow::Error) -> bool {
    matches!(
        matchmaking_error(err),
        Some(MatchmakingError::StoreUnavailable { .. })
    )
}

/// True when the error chain carries `Validation`
pub fn is_validation(err: &anyhow::Error) -> bool {
    matches!(
        matchmaking_error(err),
        Some(MatchmakingError::Validation { .. })
    )
}
