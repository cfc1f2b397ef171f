//! Policy constants, loadable from YAML.
//!
//! Every threshold the engine uses lives here so it can be tuned without
//! touching the decision algorithm. Missing sections and fields fall back to
//! the defaults below.

use std::collections::BTreeMap;
use std::{fs, path::Path, time::Duration};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result};
use crate::material::Material;
use crate::rules::RuleTable;

const fn default_min_confidence() -> f64 {
    0.40
}

const fn default_label_floor() -> f64 {
    0.05
}

const fn default_low_confidence() -> f64 {
    0.30
}

const fn default_low_confidence_weight() -> f64 {
    0.55
}

const fn default_mid_confidence() -> f64 {
    0.50
}

const fn default_mid_confidence_weight() -> f64 {
    0.35
}

const fn default_static_motion() -> f64 {
    0.02
}

const fn default_static_motion_weight() -> f64 {
    0.25
}

const fn default_burst_count() -> u32 {
    6
}

const fn default_burst_weight() -> f64 {
    0.30
}

const fn default_busy_count() -> u32 {
    3
}

const fn default_busy_weight() -> f64 {
    0.15
}

const fn default_ambiguity_margin() -> f64 {
    0.15
}

const fn default_ambiguity_weight() -> f64 {
    0.10
}

const fn default_risk_discount() -> f64 {
    0.5
}

const fn default_min_points() -> u32 {
    1
}

const fn default_duplicate_distance() -> u32 {
    5
}

const fn default_hourly_cap() -> usize {
    6
}

const fn default_history() -> usize {
    20
}

const fn default_window_secs() -> u64 {
    3600
}

const fn default_advisory_timeout_ms() -> u64 {
    4000
}

const fn default_true() -> bool {
    true
}

fn default_caps() -> BTreeMap<Material, f64> {
    BTreeMap::from([(Material::Glass, 2000.0)])
}

fn default_floors() -> BTreeMap<Material, f64> {
    BTreeMap::from([
        (Material::Plastic, 450.0),
        (Material::Metal, 50.0),
        (Material::Glass, 1.0),
        (Material::Paper, 2.0),
        (Material::Cardboard, 2.0),
        (Material::Organic, 1.0),
        (Material::Ewaste, 1000.0),
        (Material::Unknown, 50.0),
    ])
}

fn default_low_confidence_tip() -> String {
    "Not sure what this is. Try a closer, well-lit shot; when in doubt, landfill.".into()
}

fn default_paper_cup_tip() -> String {
    "Paper cups are plastic-lined and rarely recyclable; landfill unless your area accepts them."
        .into()
}

fn default_unknown_tip() -> String {
    "Couldn't match this to a recyclable material; landfill it or check local rules.".into()
}

fn default_out_of_taxonomy_tip() -> String {
    "This item isn't in the recycling taxonomy, so it goes to landfill.".into()
}

fn default_generic_tip() -> String {
    "Check local rules before disposing.".into()
}

/// Shared built-in policy for callers that never load a file.
pub static DEFAULT_POLICY: Lazy<PolicyConfig> = Lazy::new(PolicyConfig::default);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub risk: RiskWeights,
    /// Maximum years per material.
    #[serde(default = "default_caps")]
    pub caps: BTreeMap<Material, f64>,
    /// Minimum years per material on the heuristic path.
    #[serde(default = "default_floors")]
    pub floors: BTreeMap<Material, f64>,
    #[serde(default)]
    pub tips: Tips,
    /// Base Rule Table; request-supplied rules are layered on top.
    #[serde(default)]
    pub rules: RuleTable,
    #[serde(default)]
    pub points: PointsPolicy,
    #[serde(default)]
    pub capture: CapturePolicy,
    #[serde(default)]
    pub advisory: AdvisoryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Thresholds {
    /// Below this top-label probability no disposal decision is inferred.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Non-top labels below this probability are ignored as noise.
    #[serde(default = "default_label_floor")]
    pub label_floor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskWeights {
    #[serde(default = "default_low_confidence")]
    pub low_confidence: f64,
    #[serde(default = "default_low_confidence_weight")]
    pub low_confidence_weight: f64,
    #[serde(default = "default_mid_confidence")]
    pub mid_confidence: f64,
    #[serde(default = "default_mid_confidence_weight")]
    pub mid_confidence_weight: f64,
    #[serde(default = "default_static_motion")]
    pub static_motion: f64,
    #[serde(default = "default_static_motion_weight")]
    pub static_motion_weight: f64,
    #[serde(default = "default_burst_count")]
    pub burst_count: u32,
    #[serde(default = "default_burst_weight")]
    pub burst_weight: f64,
    #[serde(default = "default_busy_count")]
    pub busy_count: u32,
    #[serde(default = "default_busy_weight")]
    pub busy_weight: f64,
    #[serde(default = "default_ambiguity_margin")]
    pub ambiguity_margin: f64,
    #[serde(default = "default_ambiguity_weight")]
    pub ambiguity_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tips {
    #[serde(default = "default_low_confidence_tip")]
    pub low_confidence: String,
    #[serde(default = "default_paper_cup_tip")]
    pub paper_cup: String,
    #[serde(default = "default_unknown_tip")]
    pub unknown: String,
    #[serde(default = "default_out_of_taxonomy_tip")]
    pub out_of_taxonomy: String,
    #[serde(default = "default_generic_tip")]
    pub generic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PointsPolicy {
    /// Share of the award removed at risk 1.0.
    #[serde(default = "default_risk_discount")]
    pub risk_discount: f64,
    #[serde(default = "default_min_points")]
    pub minimum: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapturePolicy {
    /// Hashes closer than this (Hamming) count as the same picture.
    #[serde(default = "default_duplicate_distance")]
    pub duplicate_distance: u32,
    #[serde(default = "default_hourly_cap")]
    pub hourly_cap: usize,
    #[serde(default = "default_static_motion")]
    pub min_motion: f64,
    /// Retained hashes per bin.
    #[serde(default = "default_history")]
    pub history: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdvisoryPolicy {
    #[serde(default = "default_advisory_timeout_ms")]
    pub timeout_ms: u64,
    /// Prepend a synthetic `paper` label when substrate cues are present.
    #[serde(default = "default_true")]
    pub seed_paper: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            risk: RiskWeights::default(),
            caps: default_caps(),
            floors: default_floors(),
            tips: Tips::default(),
            rules: RuleTable::default(),
            points: PointsPolicy::default(),
            capture: CapturePolicy::default(),
            advisory: AdvisoryPolicy::default(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            label_floor: default_label_floor(),
        }
    }
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            low_confidence: default_low_confidence(),
            low_confidence_weight: default_low_confidence_weight(),
            mid_confidence: default_mid_confidence(),
            mid_confidence_weight: default_mid_confidence_weight(),
            static_motion: default_static_motion(),
            static_motion_weight: default_static_motion_weight(),
            burst_count: default_burst_count(),
            burst_weight: default_burst_weight(),
            busy_count: default_busy_count(),
            busy_weight: default_busy_weight(),
            ambiguity_margin: default_ambiguity_margin(),
            ambiguity_weight: default_ambiguity_weight(),
        }
    }
}

impl Default for Tips {
    fn default() -> Self {
        Self {
            low_confidence: default_low_confidence_tip(),
            paper_cup: default_paper_cup_tip(),
            unknown: default_unknown_tip(),
            out_of_taxonomy: default_out_of_taxonomy_tip(),
            generic: default_generic_tip(),
        }
    }
}

impl Default for PointsPolicy {
    fn default() -> Self {
        Self {
            risk_discount: default_risk_discount(),
            minimum: default_min_points(),
        }
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            duplicate_distance: default_duplicate_distance(),
            hourly_cap: default_hourly_cap(),
            min_motion: default_static_motion(),
            history: default_history(),
            window_secs: default_window_secs(),
        }
    }
}

impl Default for AdvisoryPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: default_advisory_timeout_ms(),
            seed_paper: default_true(),
        }
    }
}

impl AdvisoryPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PolicyConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: PolicyConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Upper bound on years for `material`, if one is configured.
    pub fn cap_for(&self, material: Material) -> Option<f64> {
        self.caps.get(&material).copied()
    }

    /// Lower bound on heuristic years for `material`; zero when unset.
    pub fn floor_for(&self, material: Material) -> f64 {
        self.floors.get(&material).copied().unwrap_or(0.0)
    }

    fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(PolicyError::Config(format!("{name} must lie in [0, 1], got {v}")))
            }
        };
        unit("thresholds.min_confidence", self.thresholds.min_confidence)?;
        unit("thresholds.label_floor", self.thresholds.label_floor)?;
        unit("risk.low_confidence", self.risk.low_confidence)?;
        unit("risk.mid_confidence", self.risk.mid_confidence)?;
        unit("risk.static_motion", self.risk.static_motion)?;
        unit("points.risk_discount", self.points.risk_discount)?;
        if self.risk.low_confidence > self.risk.mid_confidence {
            return Err(PolicyError::Config(
                "risk.low_confidence must not exceed risk.mid_confidence".into(),
            ));
        }
        if self.risk.busy_count > self.risk.burst_count {
            return Err(PolicyError::Config(
                "risk.busy_count must not exceed risk.burst_count".into(),
            ));
        }
        for (material, years) in self.caps.iter().chain(self.floors.iter()) {
            if !years.is_finite() || *years < 0.0 {
                return Err(PolicyError::Config(format!(
                    "years bound for {material} must be a non-negative number"
                )));
            }
        }
        for (material, entry) in self.rules.iter() {
            if let Some(years) = entry.years {
                if !years.is_finite() || years < 0.0 {
                    return Err(PolicyError::Config(format!(
                        "rules.{material}.years must be a non-negative number"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Loads a policy file, returning an error when it is missing or invalid.
pub fn load_policy_strict<P: AsRef<Path>>(path: P) -> Result<PolicyConfig> {
    let content = fs::read_to_string(path)?;
    PolicyConfig::from_yaml_str(&content)
}

/// Loads a policy file, falling back to the built-in policy on any error.
pub fn load_policy<P: AsRef<Path>>(path: P) -> PolicyConfig {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => match PolicyConfig::from_yaml_str(&content) {
            Ok(policy) => policy,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to parse policy YAML, falling back to defaults"
                );
                PolicyConfig::default()
            }
        },
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read policy YAML, falling back to defaults"
            );
            PolicyConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::Bin;
    use std::io::Write;

    #[test]
    fn missing_policy_file_falls_back_to_defaults() {
        let policy = load_policy("/does/not/exist.yaml");
        assert_eq!(policy.thresholds.min_confidence, default_min_confidence());
        assert_eq!(policy.cap_for(Material::Glass), Some(2000.0));
        assert_eq!(policy.floor_for(Material::Plastic), 450.0);
    }

    #[test]
    fn partial_yaml_merges_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "thresholds:\n  min_confidence: 0.55\nrules:\n  E-Waste:\n    bin: special\n    years: 1200\n"
        )
        .unwrap();
        file.flush().unwrap();

        let policy = load_policy_strict(file.path()).unwrap();
        assert_eq!(policy.thresholds.min_confidence, 0.55);
        assert_eq!(policy.thresholds.label_floor, default_label_floor());
        assert_eq!(policy.risk.burst_count, default_burst_count());
        let entry = policy.rules.get(Material::Ewaste).unwrap();
        assert_eq!(entry.bin, Some(Bin::Special));
        assert_eq!(entry.years, Some(1200.0));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let err = PolicyConfig::from_yaml_str("thresholds:\n  min_confidence: 4\n").unwrap_err();
        assert!(matches!(err, PolicyError::Config(_)));
    }

    #[test]
    fn invalid_rule_years_are_rejected() {
        for yaml in [
            "rules:\n  plastic:\n    years: -5\n",
            "rules:\n  glass:\n    years: .nan\n",
            "rules:\n  metal:\n    years: .inf\n",
        ] {
            let err = PolicyConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, PolicyError::Config(_)), "{yaml}");
        }
        assert!(PolicyConfig::from_yaml_str("rules:\n  plastic:\n    years: 0\n").is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = PolicyConfig::from_yaml_str("risk:\n  vibes: 1\n").unwrap_err();
        assert!(matches!(err, PolicyError::Yaml(_)));
    }

    #[test]
    fn shipped_policy_parses() {
        let policy =
            PolicyConfig::from_yaml_str(include_str!("../../../policies/recycling.yaml")).unwrap();
        assert_eq!(policy.cap_for(Material::Glass), Some(2000.0));
        assert_eq!(policy.capture.hourly_cap, 6);
        assert_eq!(
            policy.rules.get(Material::Ewaste).and_then(|e| e.bin),
            Some(Bin::Special)
        );
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "caps: [not, a, map]").unwrap();
        file.flush().unwrap();

        let policy = load_policy(file.path());
        assert_eq!(policy.cap_for(Material::Glass), Some(2000.0));
    }
}
