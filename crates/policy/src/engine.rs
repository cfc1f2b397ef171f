//! Decision Engine.
//!
//! One attempt at the advisory, then the deterministic heuristic:
//!
//! ```text
//! ATTEMPT_ADVISORY ──ok──▶ NORMALIZE_ADVISORY ──▶ DONE
//!        │
//!        └─any failure──▶ HEURISTIC_FALLBACK ───▶ DONE
//! ```
//!
//! There are no retries within a decision and no failure ever reaches the
//! caller. The engine holds no mutable state, so one instance can serve
//! concurrent requests.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::advisory::{Advisory, AdvisoryRequest};
use crate::config::PolicyConfig;
use crate::decision::Decision;
use crate::error::AdvisoryError;
use crate::guardrail::{guardrail, Candidate, GuardContext};
use crate::labels::{normalize, seed_paper_label, top_probability, Label, LabelClass};
use crate::material::Material;
use crate::risk::{self, Meta};
use crate::rules::RuleTable;

/// Which path produced a decision. Diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DecisionPath {
    Advisory { model: String },
    Heuristic { reason: &'static str },
}

impl DecisionPath {
    pub fn mode(&self) -> &'static str {
        match self {
            DecisionPath::Advisory { .. } => "advisory",
            DecisionPath::Heuristic { .. } => "heuristic",
        }
    }

    pub fn model(&self) -> &str {
        match self {
            DecisionPath::Advisory { model } => model,
            DecisionPath::Heuristic { .. } => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub decision: Decision,
    pub path: DecisionPath,
}

#[derive(Clone)]
pub struct DecisionEngine {
    policy: Arc<PolicyConfig>,
    advisory: Option<Arc<dyn Advisory>>,
}

impl DecisionEngine {
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        Self {
            policy,
            advisory: None,
        }
    }

    pub fn with_advisory(mut self, advisory: Arc<dyn Advisory>) -> Self {
        self.advisory = Some(advisory);
        self
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn advisory_model(&self) -> Option<&str> {
        self.advisory.as_deref().map(|a| a.model())
    }

    /// Decides for one capture event. `rules` are layered over the policy's
    /// base table.
    pub async fn decide(&self, labels: &[Label], rules: &RuleTable, meta: &Meta) -> Outcome {
        let rules = self.policy.rules.overlay(rules);

        match self.attempt_advisory(labels, &rules, meta).await {
            Ok((decision, model)) => {
                debug!(material = %decision.material, bin = %decision.bin, model = %model, "advisory decision accepted");
                Outcome {
                    decision,
                    path: DecisionPath::Advisory { model },
                }
            }
            Err(err) => {
                match &err {
                    AdvisoryError::NotConfigured => {}
                    other => warn!(error = %other, "advisory failed, using heuristic"),
                }
                let decision = heuristic(labels, &rules, meta, &self.policy);
                debug!(material = %decision.material, bin = %decision.bin, reason = err.reason(), "heuristic decision");
                Outcome {
                    decision,
                    path: DecisionPath::Heuristic {
                        reason: err.reason(),
                    },
                }
            }
        }
    }

    async fn attempt_advisory(
        &self,
        labels: &[Label],
        rules: &RuleTable,
        meta: &Meta,
    ) -> Result<(Decision, String), AdvisoryError> {
        let advisory = self.advisory.clone().ok_or(AdvisoryError::NotConfigured)?;
        let model = advisory.model().to_string();

        let seeded = if self.policy.advisory.seed_paper {
            seed_paper_label(labels)
        } else {
            labels.to_vec()
        };
        let request = AdvisoryRequest::new(seeded, rules, *meta);

        // Run on its own task so a panicking backend degrades like any other
        // failure, and so a timed-out call can be dropped.
        let task = tokio::spawn(async move { advisory.propose(&request).await });
        let abort = task.abort_handle();
        let timeout = self.policy.advisory.timeout();
        let raw = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => return Err(AdvisoryError::Aborted(join_err.to_string())),
            Err(_) => {
                abort.abort();
                return Err(AdvisoryError::Timeout(self.policy.advisory.timeout_ms));
            }
        };

        let candidate = Candidate::from_value(&raw)?;
        let decision = guardrail(
            &candidate,
            &GuardContext {
                rules,
                meta,
                labels,
                policy: &self.policy,
            },
        );
        Ok((decision, model))
    }
}

/// Deterministic, advisory-free decision.
pub fn heuristic(labels: &[Label], rules: &RuleTable, meta: &Meta, policy: &PolicyConfig) -> Decision {
    let risk_score = risk::score(meta, labels, &policy.risk);

    if top_probability(labels) < policy.thresholds.min_confidence {
        return Decision::unknown(policy.tips.low_confidence.clone(), risk_score, policy);
    }

    match normalize(labels, policy.thresholds.label_floor).class {
        LabelClass::PaperCup => Decision::unknown(policy.tips.paper_cup.clone(), risk_score, policy),
        LabelClass::Material(Material::Unknown) => {
            Decision::unknown(policy.tips.unknown.clone(), risk_score, policy)
        }
        LabelClass::Material(material) => {
            let rule = rules.resolve(material);
            let mut years = rule.years;
            if let Some(cap) = policy.cap_for(material) {
                years = years.min(cap);
            }
            years = years.max(policy.floor_for(material));
            Decision {
                material,
                bin: rule.bin,
                tip: rule.tip,
                years,
                risk_score,
            }
            .seal(policy)
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
