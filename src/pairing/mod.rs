//! Pairing: candidate ranking, the claim transaction, and the poll loop

pub mod claim;
pub mod coordinator;
pub mod matching;

pub use claim::{try_claim, ClaimAbortReason, ClaimOutcome};
pub use coordinator::{
    PairingContext, PairingCoordinator, PairingOutcome, PairingState, PollResult,
};
pub use matching::{preference_overlap, CandidateScorer, PreferenceOverlapScorer, ScoredCandidate};
