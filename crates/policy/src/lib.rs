//! Recycling policy core for binsight.
//!
//! Turns vision labels plus anti-abuse signals into a [`Decision`]: material,
//! bin, years avoided, a short tip and a risk score. An optional
//! [`Advisory`] backend may propose the decision; whatever it says passes
//! through the guardrail, and any failure falls back to the deterministic
//! heuristic.

pub mod advisory;
pub mod capture;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod guardrail;
pub mod labels;
pub mod material;
pub mod points;
pub mod risk;
pub mod rules;
pub mod wire;

pub use advisory::{extract_json_object, Advisory, AdvisoryRequest};
pub use capture::{AverageHash, CaptureLedger, CaptureRejection};
pub use config::{load_policy, load_policy_strict, PolicyConfig, DEFAULT_POLICY};
pub use decision::Decision;
pub use engine::{heuristic, DecisionEngine, DecisionPath, Outcome};
pub use error::{AdvisoryError, PolicyError};
pub use labels::{merge_labels, normalize, select_primary, Detection, Label};
pub use material::{Bin, Material};
pub use points::award;
pub use risk::Meta;
pub use rules::{builtin_rule, Rule, RuleEntry, RuleTable};
pub use wire::DecisionRequest;
