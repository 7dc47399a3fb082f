//! Atomic claim transaction
//!
//! One transaction over `[candidate, own]` re-reads both entries and, only if
//! both are still Searching, flips both to Claimed with crossed `claimedBy`
//! and a shared `claimedAt`. Two pollers racing for the same candidate (or for
//! each other) cannot both commit: the second one sees a non-Searching entry
//! and aborts without writing anything.

use crate::error::Result;
use crate::queue::entry::{
    FIELD_CLAIMED_AT, FIELD_CLAIMED_BY, FIELD_STATUS, FIELD_USER_ID, QUEUE_COLLECTION,
};
use crate::store::{
    Document, DocumentStore, TransactionDecision, TransactionFn, TransactionOutcome, Write,
};
use crate::types::{SearchQueueEntry, SearchStatus};
use chrono::{DateTime, SubsecRound, Utc};
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::debug;

/// Why a claim did not commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAbortReason {
    CandidateGone,
    CandidateNotSearching,
    CandidateIsSelf,
    OwnEntryGone,
    OwnEntryNotSearching,
}

impl ClaimAbortReason {
    pub fn code(&self) -> &'static str {
        match self {
            ClaimAbortReason::CandidateGone => "candidate_gone",
            ClaimAbortReason::CandidateNotSearching => "candidate_not_searching",
            ClaimAbortReason::CandidateIsSelf => "candidate_is_self",
            ClaimAbortReason::OwnEntryGone => "own_entry_gone",
            ClaimAbortReason::OwnEntryNotSearching => "own_entry_not_searching",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "candidate_gone" => Some(ClaimAbortReason::CandidateGone),
            "candidate_not_searching" => Some(ClaimAbortReason::CandidateNotSearching),
            "candidate_is_self" => Some(ClaimAbortReason::CandidateIsSelf),
            "own_entry_gone" => Some(ClaimAbortReason::OwnEntryGone),
            "own_entry_not_searching" => Some(ClaimAbortReason::OwnEntryNotSearching),
            _ => None,
        }
    }

    /// The caller's own entry changed; trying other candidates is pointless
    pub fn concerns_own_entry(&self) -> bool {
        matches!(
            self,
            ClaimAbortReason::OwnEntryGone | ClaimAbortReason::OwnEntryNotSearching
        )
    }
}

impl fmt::Display for ClaimAbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed { claimed_at: DateTime<Utc> },
    Aborted(ClaimAbortReason),
}

/// Try to pair `own` with `candidate` in one transaction
pub async fn try_claim(
    store: &dyn DocumentStore,
    own: &SearchQueueEntry,
    candidate: &SearchQueueEntry,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome> {
    if candidate.user_id == own.user_id || candidate.id == own.id {
        return Ok(ClaimOutcome::Aborted(ClaimAbortReason::CandidateIsSelf));
    }

    let own_id = own.id.clone();
    let own_user = own.user_id.clone();
    let candidate_id = candidate.id.clone();
    // Stored with microsecond precision, so both sides agree on the value
    let claimed_at = now.trunc_subsecs(6);
    let claimed_at_micros = claimed_at.timestamp_micros();

    let decide: TransactionFn = Box::new(move |snapshot: &[Option<Document>]| {
        let (candidate_doc, own_doc) = match snapshot {
            [candidate_doc, own_doc] => (candidate_doc, own_doc),
            _ => return abort(ClaimAbortReason::CandidateGone),
        };

        let candidate_doc = match candidate_doc {
            Some(doc) => doc,
            None => return abort(ClaimAbortReason::CandidateGone),
        };
        let own_doc = match own_doc {
            Some(doc) => doc,
            None => return abort(ClaimAbortReason::OwnEntryGone),
        };

        let candidate_user = match candidate_doc.field(FIELD_USER_ID).and_then(Value::as_str) {
            Some(user) => user.to_string(),
            None => return abort(ClaimAbortReason::CandidateGone),
        };
        if candidate_user == own_user {
            return abort(ClaimAbortReason::CandidateIsSelf);
        }
        if !is_searching(candidate_doc) {
            return abort(ClaimAbortReason::CandidateNotSearching);
        }
        if !is_searching(own_doc) {
            return abort(ClaimAbortReason::OwnEntryNotSearching);
        }

        TransactionDecision::Commit(vec![
            Write::Update {
                id: candidate_id.clone(),
                fields: claimed_fields(&own_user, claimed_at_micros),
            },
            Write::Update {
                id: own_id.clone(),
                fields: claimed_fields(&candidate_user, claimed_at_micros),
            },
        ])
    });

    let outcome = store
        .transact(
            QUEUE_COLLECTION,
            &[candidate.id.clone(), own.id.clone()],
            decide,
        )
        .await?;

    match outcome {
        TransactionOutcome::Committed => {
            debug!(
                "User {} claimed entry {} of user {}",
                own.user_id, candidate.id, candidate.user_id
            );
            Ok(ClaimOutcome::Claimed { claimed_at })
        }
        TransactionOutcome::Aborted(code) => {
            // Store-side aborts (e.g. an entry deleted between read and write)
            // look like the candidate disappearing
            let reason = ClaimAbortReason::from_code(&code).unwrap_or(ClaimAbortReason::CandidateGone);
            debug!(
                "Claim of entry {} by user {} aborted: {}",
                candidate.id, own.user_id, reason
            );
            Ok(ClaimOutcome::Aborted(reason))
        }
    }
}

fn abort(reason: ClaimAbortReason) -> TransactionDecision {
    TransactionDecision::Abort(reason.code().to_string())
}

fn is_searching(doc: &Document) -> bool {
    doc.field(FIELD_STATUS)
        .and_then(Value::as_str)
        .map_or(false, |status| status == SearchStatus::Searching.to_string())
}

fn claimed_fields(claimed_by: &str, claimed_at: i64) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(
        FIELD_STATUS.to_string(),
        json!(SearchStatus::Claimed.to_string()),
    );
    fields.insert(FIELD_CLAIMED_BY.to_string(), json!(claimed_by));
    fields.insert(FIELD_CLAIMED_AT.to_string(), json!(claimed_at));
    fields
}
