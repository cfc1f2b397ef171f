//! Points Converter.

use crate::config::PointsPolicy;
use crate::risk::clamp_unit;

/// `round(years * (1 - risk_discount * risk))`, never below `policy.minimum`.
pub fn award(years: f64, risk_score: f64, policy: &PointsPolicy) -> u32 {
    let years = if years.is_finite() { years.max(0.0) } else { 0.0 };
    let factor = 1.0 - clamp_unit(policy.risk_discount) * clamp_unit(risk_score);
    let raw = (years * factor).round();
    // Saturating float→int cast.
    (raw as u32).max(policy.minimum)
}
