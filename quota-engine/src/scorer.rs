//! Admission priority scoring.
//!
//! A pure weighted sum over explicit signals. No clock, no randomness: the
//! same inputs always give the same score, so every queue ordering can be
//! replayed from the audit log.

use serde::{Deserialize, Serialize};

use crate::config::ScoringWeights;
use crate::hoarding::HoardingFlag;
use crate::reservation::ReservationState;

/// Inputs to the priority formula for one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringSignals {
    /// Opaque need / impact signal (clamped before use)
    pub need: f64,
    /// Grants in the requester's recent history
    pub recent_grants: u32,
    /// Denials in the requester's recent history
    pub recent_denials: u32,
    /// Underserved status
    pub underserved: bool,
    /// Current hoarding flag
    pub hoarding: HoardingFlag,
}

impl ScoringSignals {
    /// Signals for a requester with no history and a clear profile.
    pub fn new(need: f64, underserved: bool) -> Self {
        Self {
            need,
            recent_grants: 0,
            recent_denials: 0,
            underserved,
            hoarding: HoardingFlag::Clear,
        }
    }
}

/// Breakdown of a score into its terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Need contribution
    pub need: f64,
    /// History contribution (non-positive)
    pub history: f64,
    /// Denial contribution (non-negative)
    pub denials: f64,
    /// Underserved and reserved-slack bonus
    pub equity: f64,
    /// Hoarding penalty (non-positive)
    pub hoarding: f64,
}

impl ScoreBreakdown {
    /// Sum of all terms.
    pub fn total(&self) -> f64 {
        self.need + self.history + self.denials + self.equity + self.hoarding
    }
}

/// Computes admission priority (higher is served sooner).
#[derive(Debug, Clone, Default)]
pub struct PriorityScorer {
    weights: ScoringWeights,
}

impl PriorityScorer {
    /// Create a scorer with the given weights.
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    /// Weights in use.
    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Clamp the need signal into `[0, need_ceiling]`; NaN counts as zero.
    pub fn clamp_need(&self, need: f64) -> f64 {
        if need.is_nan() {
            return 0.0;
        }
        need.clamp(0.0, self.weights.need_ceiling.max(0.0))
    }

    /// Score a request.
    pub fn score(&self, signals: &ScoringSignals, reservation: &ReservationState) -> f64 {
        self.breakdown(signals, reservation).total()
    }

    /// Score a request, keeping each term.
    pub fn breakdown(&self, signals: &ScoringSignals, reservation: &ReservationState) -> ScoreBreakdown {
        let w = &self.weights;

        let need = self.clamp_need(signals.need) * w.need_weight;
        let history = -(f64::from(signals.recent_grants)).ln_1p() * w.history_weight;
        let denials = (f64::from(signals.recent_denials)).ln_1p() * w.denial_weight;

        let mut equity = 0.0;
        if signals.underserved {
            equity += w.underserved_bonus;
            if reservation.reserved_slack() > 0 {
                equity += w.reserved_slack_bonus;
            }
        }

        let hoarding = match signals.hoarding {
            HoardingFlag::Clear => 0.0,
            HoardingFlag::Watched => -w.watched_penalty,
            HoardingFlag::Restricted => -w.restricted_penalty,
        };

        ScoreBreakdown {
            need,
            history,
            denials,
            equity,
            hoarding,
        }
    }
}
