//! Optional advisory backend (typically an LLM) proposing candidate
//! decisions.
//!
//! Everything an advisory returns is untrusted: replies go through
//! [`extract_json_object`], then [`crate::guardrail`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::AdvisoryError;
use crate::labels::Label;
use crate::material::Material;
use crate::risk::Meta;
use crate::rules::{Rule, RuleTable};

/// Structured input handed to an advisory.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryRequest {
    pub labels: Vec<Label>,
    /// Fully resolved rule for every taxonomy member.
    pub rules: BTreeMap<Material, Rule>,
    pub meta: Meta,
}

impl AdvisoryRequest {
    pub fn new(labels: Vec<Label>, rules: &RuleTable, meta: Meta) -> Self {
        let rules = Material::TAXONOMY
            .iter()
            .map(|m| (*m, rules.resolve(*m)))
            .collect();
        Self {
            labels,
            rules,
            meta,
        }
    }

    /// Single-turn instruction for a chat model.
    pub fn prompt(&self) -> String {
        let labels = serde_json::to_string(&self.labels).unwrap_or_else(|_| "[]".into());
        let rules = serde_json::to_string(&self.rules).unwrap_or_else(|_| "{}".into());
        let meta = serde_json::to_string(&self.meta).unwrap_or_else(|_| "{}".into());
        let taxonomy = Material::TAXONOMY
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join("|");
        format!(
            "You are a recycling policy engine. Given image labels with probabilities and local rules, \
             output strict JSON: {{\"material\":\"{taxonomy}|unknown\",\"bin\":\"recycling|compost|landfill|special\",\
             \"rationale\":\"...\",\"tip\":\"...\",\"years\":number,\"risk_score\":0-1}}.\n\
             Labels:{labels}\n\
             Rules:{rules}\n\
             FraudMeta:{meta}\n\
             Constraints: choose the material of the object itself, not of any picture printed on it; \
             if ambiguous pick the stricter rule; years from rules (cap glass at 2000); tip under 140 characters; \
             risk_score higher for low motion, many recent scans, or very low confidence. OUTPUT ONLY JSON."
        )
    }
}

#[async_trait]
pub trait Advisory: Send + Sync {
    /// Model or backend identifier, reported for observability only.
    fn model(&self) -> &str;

    /// Returns a raw candidate decision as JSON.
    async fn propose(&self, request: &AdvisoryRequest) -> Result<Value, AdvisoryError>;
}

/// Finds the JSON object in a free-text model reply.
///
/// Accepts a bare object, an object wrapped in a Markdown code fence, or an
/// object surrounded by prose.
pub fn extract_json_object(text: &str) -> Result<Value, AdvisoryError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AdvisoryError::Parse("empty reply".into()));
    }
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) else {
        return Err(AdvisoryError::Parse("no JSON object in reply".into()));
    };
    if end < start {
        return Err(AdvisoryError::Parse("no JSON object in reply".into()));
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .map_err(|err| AdvisoryError::Parse(err.to_string()))
}
