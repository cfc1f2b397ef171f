//! The engine's sole output type.

use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::material::{Bin, Material};
use crate::risk::clamp_unit;

pub const MAX_TIP_CHARS: usize = 140;

/// Years used whenever no better figure is available.
pub const FALLBACK_YEARS: f64 = 50.0;

/// Complete disposal decision for one capture event.
///
/// Always fully populated. Construct through [`Decision::seal`] (directly or
/// via the engine) so that the invariants hold:
/// `material == Unknown` implies `bin == Landfill`, `years` is finite,
/// non-negative and within the material's cap, `risk_score` lies in `[0, 1]`
/// and `tip` is non-empty and at most [`MAX_TIP_CHARS`] characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub material: Material,
    pub bin: Bin,
    pub tip: String,
    pub years: f64,
    pub risk_score: f64,
}

impl Decision {
    /// Landfill decision for anything that could not be identified.
    pub fn unknown(tip: impl Into<String>, risk_score: f64, policy: &PolicyConfig) -> Self {
        Decision {
            material: Material::Unknown,
            bin: Bin::Landfill,
            tip: tip.into(),
            years: policy
                .floors
                .get(&Material::Unknown)
                .copied()
                .unwrap_or(FALLBACK_YEARS),
            risk_score,
        }
        .seal(policy)
    }

    /// Enforces the output invariants. Idempotent.
    pub fn seal(mut self, policy: &PolicyConfig) -> Self {
        if self.material == Material::Unknown {
            self.bin = Bin::Landfill;
        }
        if !self.years.is_finite() {
            self.years = FALLBACK_YEARS;
        }
        self.years = self.years.max(0.0);
        if let Some(cap) = policy.cap_for(self.material) {
            self.years = self.years.min(cap);
        }
        self.risk_score = clamp_unit(self.risk_score);
        self.tip = truncate_tip(&self.tip);
        if self.tip.is_empty() {
            self.tip = truncate_tip(&policy.tips.generic);
        }
        self
    }
}

/// Trims whitespace and cuts to [`MAX_TIP_CHARS`] characters.
pub fn truncate_tip(tip: &str) -> String {
    tip.trim().chars().take(MAX_TIP_CHARS).collect::<String>().trim_end().to_string()
}
