//! Candidate scoring and ranking
//!
//! Scores are a weighted sum of preference overlap and time waited. Preferences
//! are never required to match: a candidate with no overlap still scores 0 and
//! is eligible unless `min_score` says otherwise.

use crate::config::ScoringWeights;
use crate::types::{Preferences, SearchQueueEntry};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

/// A candidate together with its score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub entry: SearchQueueEntry,
    pub score: f64,
}

/// Trait for scoring queue entries against the searching user's entry
pub trait CandidateScorer: Send + Sync {
    /// Score `candidate` for `own`. Higher is better.
    fn score(&self, own: &SearchQueueEntry, candidate: &SearchQueueEntry, now: DateTime<Utc>)
        -> f64;

    /// Candidates scoring below this are never claimed
    fn min_score(&self) -> f64 {
        0.0
    }

    /// Eligible candidates, best first.
    ///
    /// Drops the caller's own entries and anything not Searching. Equal scores
    /// are ordered by `createdAt` (oldest first), then by entry id.
    fn rank(
        &self,
        own: &SearchQueueEntry,
        candidates: &[SearchQueueEntry],
        now: DateTime<Utc>,
    ) -> Vec<ScoredCandidate> {
        let min_score = self.min_score();

        let mut ranked: Vec<ScoredCandidate> = candidates
            .iter()
            .filter(|c| c.user_id != own.user_id && c.id != own.id && c.is_searching())
            .map(|c| ScoredCandidate {
                score: self.score(own, c, now),
                entry: c.clone(),
            })
            .filter(|c| c.score >= min_score)
            .collect();

        ranked.sort_by(compare_ranked);
        ranked
    }
}

fn compare_ranked(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.entry.created_at.cmp(&b.entry.created_at))
        .then_with(|| a.entry.id.cmp(&b.entry.id))
}

/// Default scorer: shared preferences times `overlap_weight`, plus
/// `wait_weight_per_second` for every second the candidate has waited
#[derive(Debug, Clone, Default)]
pub struct PreferenceOverlapScorer {
    weights: ScoringWeights,
}

impl PreferenceOverlapScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }
}

impl CandidateScorer for PreferenceOverlapScorer {
    fn score(
        &self,
        own: &SearchQueueEntry,
        candidate: &SearchQueueEntry,
        now: DateTime<Utc>,
    ) -> f64 {
        let overlap = preference_overlap(&own.preferences, &candidate.preferences) as f64;
        let waited = candidate.age(now).num_milliseconds().max(0) as f64 / 1000.0;

        overlap * self.weights.overlap_weight + waited * self.weights.wait_weight_per_second
    }

    fn min_score(&self) -> f64 {
        self.weights.min_score
    }
}

/// Number of shared preference values.
///
/// A key counts once when both sides hold the same scalar. When either side
/// holds a list, every distinct shared element counts.
pub fn preference_overlap(a: &Preferences, b: &Preferences) -> usize {
    a.iter()
        .filter_map(|(key, left)| b.get(key).map(|right| value_overlap(left, right)))
        .sum()
}

fn value_overlap(left: &Value, right: &Value) -> usize {
    match (left, right) {
        (Value::Array(l), Value::Array(r)) => {
            let mut shared: Vec<&Value> = Vec::new();
            for item in l.iter().filter(|item| r.contains(item)) {
                if !shared.contains(&item) {
                    shared.push(item);
                }
            }
            shared.len()
        }
        (Value::Array(items), scalar) | (scalar, Value::Array(items)) => {
            usize::from(items.contains(scalar))
        }
        (l, r) => usize::from(l == r),
    }
}
