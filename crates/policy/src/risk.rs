//! Risk Scorer: additive uncertainty/abuse signal in `[0, 1]`.
//!
//! The score never encodes material or bin policy; downstream it only
//! discounts awarded points.

use serde::{Deserialize, Serialize};

use crate::config::RiskWeights;
use crate::labels::{clamp_probability, Label};

/// Session signals supplied by the capture loop. Missing fields never add
/// risk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(
        rename = "conf",
        alias = "confidence",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub confidence: Option<f64>,
    #[serde(
        rename = "delta",
        alias = "motionDelta",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub motion_delta: Option<f64>,
    #[serde(
        rename = "recentCount",
        alias = "recentSubmissionCount",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub recent_submission_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    VeryLowConfidence,
    LowConfidence,
    StaticFrame,
    Burst,
    Busy,
    AmbiguousTop,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub factors: Vec<RiskFactor>,
}

impl Meta {
    /// Top confidence used for risk: the explicit signal if present,
    /// otherwise the top label's probability.
    fn effective_confidence(&self, labels: &[Label]) -> Option<f64> {
        self.confidence
            .filter(|c| c.is_finite())
            .or_else(|| labels.first().map(|l| l.probability))
            .map(clamp_probability)
    }
}

pub fn assess(meta: &Meta, labels: &[Label], weights: &RiskWeights) -> RiskAssessment {
    let mut score = 0.0;
    let mut factors = Vec::new();

    if let Some(conf) = meta.effective_confidence(labels) {
        if conf < weights.low_confidence {
            score += weights.low_confidence_weight;
            factors.push(RiskFactor::VeryLowConfidence);
        } else if conf < weights.mid_confidence {
            score += weights.mid_confidence_weight;
            factors.push(RiskFactor::LowConfidence);
        }
    }

    if let Some(delta) = meta.motion_delta.filter(|d| d.is_finite()) {
        if delta < weights.static_motion {
            score += weights.static_motion_weight;
            factors.push(RiskFactor::StaticFrame);
        }
    }

    if let Some(count) = meta.recent_submission_count {
        if count >= weights.burst_count {
            score += weights.burst_weight;
            factors.push(RiskFactor::Burst);
        } else if count >= weights.busy_count {
            score += weights.busy_weight;
            factors.push(RiskFactor::Busy);
        }
    }

    if let [first, second, ..] = labels {
        let margin =
            (clamp_probability(first.probability) - clamp_probability(second.probability)).abs();
        if margin < weights.ambiguity_margin {
            score += weights.ambiguity_weight;
            factors.push(RiskFactor::AmbiguousTop);
        }
    }

    RiskAssessment {
        score: clamp_unit(score),
        factors,
    }
}

pub fn score(meta: &Meta, labels: &[Label], weights: &RiskWeights) -> f64 {
    assess(meta, labels, weights).score
}

/// Clamps to `[0, 1]`; non-finite input maps to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
