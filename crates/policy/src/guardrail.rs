//! Guardrail: turns an untrusted candidate decision into a policy-compliant
//! [`Decision`].
//!
//! Candidates come from the advisory backend, which may return anything.
//! Parsing only insists on a JSON object with a string `material`; every
//! other field is coerced or defaulted here instead of being rejected.

use serde_json::Value;

use crate::config::PolicyConfig;
use crate::decision::{truncate_tip, Decision, FALLBACK_YEARS};
use crate::error::AdvisoryError;
use crate::labels::Label;
use crate::material::{Bin, Material};
use crate::risk::{self, Meta};
use crate::rules::RuleTable;

/// Loosely typed candidate, as proposed by an advisory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub material: String,
    pub bin: Option<String>,
    pub tip: Option<String>,
    pub years: Option<f64>,
    pub risk_score: Option<f64>,
}

fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

impl Candidate {
    pub fn from_value(value: &Value) -> Result<Candidate, AdvisoryError> {
        let obj = value
            .as_object()
            .ok_or_else(|| AdvisoryError::Schema("expected a JSON object".into()))?;
        let material = obj
            .get("material")
            .and_then(Value::as_str)
            .ok_or_else(|| AdvisoryError::Schema("missing string field 'material'".into()))?;
        Ok(Candidate {
            material: material.to_string(),
            bin: obj.get("bin").and_then(Value::as_str).map(str::to_string),
            tip: obj.get("tip").and_then(Value::as_str).map(str::to_string),
            years: obj.get("years").and_then(coerce_number),
            risk_score: obj.get("risk_score").and_then(coerce_number),
        })
    }
}

/// Inputs the guardrail needs besides the candidate itself.
pub struct GuardContext<'a> {
    pub rules: &'a RuleTable,
    pub meta: &'a Meta,
    pub labels: &'a [Label],
    pub policy: &'a PolicyConfig,
}

pub fn guardrail(candidate: &Candidate, ctx: &GuardContext<'_>) -> Decision {
    let risk_score = candidate
        .risk_score
        .unwrap_or_else(|| risk::score(ctx.meta, ctx.labels, &ctx.policy.risk));

    let Some(material) = Material::parse(&candidate.material) else {
        tracing::debug!(material = %candidate.material, "candidate material outside taxonomy");
        return Decision::unknown(ctx.policy.tips.out_of_taxonomy.clone(), risk_score, ctx.policy);
    };

    let mut bin = candidate
        .bin
        .as_deref()
        .and_then(Bin::parse)
        .unwrap_or(Bin::Landfill);
    let mut years = candidate.years.unwrap_or(FALLBACK_YEARS);
    let mut tip = candidate
        .tip
        .as_deref()
        .map(truncate_tip)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| ctx.policy.tips.generic.clone());

    let entry = ctx.rules.get(material);
    match entry.and_then(|e| e.bin) {
        Some(rule_bin) => bin = rule_bin,
        // Landfill from the candidate alone is corrected; a Rule Table bin is final.
        None if bin == Bin::Landfill => bin = ctx.rules.resolve(material).bin,
        None => {}
    }
    if let Some(entry) = entry {
        if let Some(rule_years) = entry.years {
            years = rule_years;
        }
        if let Some(rule_tip) = &entry.tip {
            tip = rule_tip.clone();
        }
    }

    Decision {
        material,
        bin,
        tip,
        years,
        risk_score,
    }
    .seal(ctx.policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleEntry;
    use serde_json::json;

    fn run(value: Value, rules: &RuleTable) -> Decision {
        let policy = PolicyConfig::default();
        let meta = Meta::default();
        let labels = vec![Label::new("bottle", 0.9)];
        let candidate = Candidate::from_value(&value).expect("valid candidate");
        guardrail(
            &candidate,
            &GuardContext {
                rules,
                meta: &meta,
                labels: &labels,
                policy: &policy,
            },
        )
    }

    #[test]
    fn non_objects_and_missing_material_violate_schema() {
        assert!(matches!(
            Candidate::from_value(&json!(["plastic"])),
            Err(AdvisoryError::Schema(_))
        ));
        assert!(matches!(
            Candidate::from_value(&json!({"bin": "recycling"})),
            Err(AdvisoryError::Schema(_))
        ));
        assert!(matches!(
            Candidate::from_value(&json!({"material": 7})),
            Err(AdvisoryError::Schema(_))
        ));
    }

    #[test]
    fn out_of_taxonomy_material_is_forced_to_landfill() {
        let decision = run(
            json!({"material": "Elephant", "bin": "recycling", "years": 9000, "tip": "Zoo"}),
            &RuleTable::new(),
        );
        assert_eq!(decision.material, Material::Unknown);
        assert_eq!(decision.bin, Bin::Landfill);
        assert_eq!(decision.tip, PolicyConfig::default().tips.out_of_taxonomy);
        assert_eq!(decision.years, FALLBACK_YEARS);
    }

    #[test]
    fn invalid_bin_and_years_are_defaulted() {
        let decision = run(
            json!({"material": "METAL", "bin": "bucket", "years": "forever", "tip": ""}),
            &RuleTable::new(),
        );
        assert_eq!(decision.material, Material::Metal);
        // Landfill fallback for a recognized material becomes its policy bin.
        assert_eq!(decision.bin, Bin::Recycling);
        assert_eq!(decision.years, FALLBACK_YEARS);
        assert_eq!(decision.tip, PolicyConfig::default().tips.generic);
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let decision = run(
            json!({"material": "plastic", "bin": "recycling", "years": " 300 ", "risk_score": "0.2"}),
            &RuleTable::new(),
        );
        assert_eq!(decision.years, 300.0);
        assert_eq!(decision.risk_score, 0.2);
    }

    #[test]
    fn rule_table_overrides_advisory() {
        let rules: RuleTable = [(
            Material::Plastic,
            RuleEntry {
                bin: Some(Bin::Recycling),
                years: Some(450.0),
                tip: Some("Rinse to avoid contamination.".into()),
            },
        )]
        .into_iter()
        .collect();
        let decision = run(
            json!({"material": "plastic", "bin": "compost", "years": 3, "tip": "Eat it"}),
            &rules,
        );
        assert_eq!(decision.bin, Bin::Recycling);
        assert_eq!(decision.years, 450.0);
        assert_eq!(decision.tip, "Rinse to avoid contamination.");
    }

    #[test]
    fn rule_table_landfill_is_not_corrected() {
        let rules: RuleTable = [(
            Material::Plastic,
            RuleEntry {
                bin: Some(Bin::Landfill),
                years: Some(450.0),
                ..RuleEntry::default()
            },
        )]
        .into_iter()
        .collect();
        let decision = run(json!({"material": "plastic", "bin": "landfill"}), &rules);
        assert_eq!(decision.bin, Bin::Landfill);
        let decision = run(json!({"material": "plastic", "bin": "recycling"}), &rules);
        assert_eq!(decision.bin, Bin::Landfill);
        assert_eq!(decision.years, 450.0);
    }

    #[test]
    fn glass_cap_applies_after_rule_override() {
        let rules: RuleTable = [(
            Material::Glass,
            RuleEntry {
                years: Some(1_000_000.0),
                ..RuleEntry::default()
            },
        )]
        .into_iter()
        .collect();
        let decision = run(json!({"material": "glass", "bin": "recycling"}), &rules);
        assert_eq!(decision.years, 2000.0);
    }

    #[test]
    fn risk_is_clamped_or_computed() {
        let decision = run(
            json!({"material": "paper", "bin": "recycling", "risk_score": 3}),
            &RuleTable::new(),
        );
        assert_eq!(decision.risk_score, 1.0);

        // Top label 0.9 with default meta carries no risk.
        let decision = run(json!({"material": "paper", "bin": "recycling"}), &RuleTable::new());
        assert_eq!(decision.risk_score, 0.0);
    }

    #[test]
    fn long_tips_are_truncated() {
        let decision = run(
            json!({"material": "cardboard", "bin": "recycling", "tip": "x".repeat(500)}),
            &RuleTable::new(),
        );
        assert_eq!(decision.tip.chars().count(), 140);
    }
}
