//! Candidate scoring weights
//!
//! How much shared preferences count against time spent waiting is a product
//! decision, so both weights are configuration rather than constants.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Points per shared preference value
    pub overlap_weight: f64,
    /// Points per second a candidate has been waiting
    pub wait_weight_per_second: f64,
    /// Candidates scoring below this are never claimed
    pub min_score: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            overlap_weight: 1.0,
            wait_weight_per_second: 0.0,
            min_score: 0.0,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<()> {
        if !self.overlap_weight.is_finite() || self.overlap_weight < 0.0 {
            return Err(anyhow!("Overlap weight must be a non-negative number"));
        }
        if !self.wait_weight_per_second.is_finite() || self.wait_weight_per_second < 0.0 {
            return Err(anyhow!("Wait weight must be a non-negative number"));
        }
        if !self.min_score.is_finite() {
            return Err(anyhow!("Minimum score must be a finite number"));
        }
        Ok(())
    }
}
