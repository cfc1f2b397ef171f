//! Lenient parsing of decision requests.
//!
//! Request bodies come from browsers and scripts of varying quality. Nothing
//! here fails: unusable parts are dropped and the engine decides on what is
//! left.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::labels::Label;
use crate::risk::Meta;
use crate::rules::RuleTable;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionRequest {
    pub labels: Vec<Label>,
    pub rules: RuleTable,
    pub meta: Meta,
}

impl DecisionRequest {
    pub fn from_slice(body: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => Self::from_value(&value),
            Err(err) => {
                tracing::debug!(error = %err, "request body is not JSON");
                Self::default()
            }
        }
    }

    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        Self {
            labels: obj.get("labels").map(parse_labels).unwrap_or_default(),
            rules: obj.get("rules").map(RuleTable::from_value).unwrap_or_default(),
            meta: obj
                .get("meta")
                .and_then(Value::as_object)
                .map(parse_meta)
                .unwrap_or_default(),
        }
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64).filter(|n| n.is_finite())
}

fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

/// Accepts `name`/`className` and `prob`/`probability`; entries without a
/// usable name are dropped, missing probabilities become 0.
pub fn parse_labels(value: &Value) -> Vec<Label> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let name = first(obj, &["name", "className"])?.as_str()?.trim();
            if name.is_empty() {
                return None;
            }
            let probability = number(first(obj, &["prob", "probability"])).unwrap_or(0.0);
            Some(Label::new(name, probability))
        })
        .collect()
}

pub fn parse_meta(obj: &Map<String, Value>) -> Meta {
    Meta {
        confidence: number(first(obj, &["conf", "confidence"])),
        motion_delta: number(first(obj, &["delta", "motionDelta"])),
        recent_submission_count: number(first(obj, &["recentCount", "recentSubmissionCount"]))
            .map(|n| n.max(0.0).min(f64::from(u32::MAX)) as u32),
    }
}
