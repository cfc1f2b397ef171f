//! Label Normalizer: free-text vision labels → one canonical material.
//!
//! Matching is done on word tokens, not raw substrings, so `tin` does not
//! fire on `printing` and `box` does not fire on `boxer`. Families are checked
//! in a fixed precedence order across all eligible labels and the first family
//! with a hit wins.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::material::Material;

/// A candidate description of the imaged item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    #[serde(rename = "prob", alias = "probability")]
    pub probability: f64,
}

impl Label {
    pub fn new(name: impl Into<String>, probability: f64) -> Self {
        Self {
            name: name.into(),
            probability: clamp_probability(probability),
        }
    }
}

/// Object detector output (bounding box is `[x, y, w, h]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class: String,
    pub score: f64,
    #[serde(default)]
    pub bbox: [f64; 4],
}

pub(crate) fn clamp_probability(p: f64) -> f64 {
    if p.is_finite() {
        p.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Probability of the most significant label, 0 when there is none.
pub fn top_probability(labels: &[Label]) -> f64 {
    labels
        .first()
        .map(|l| clamp_probability(l.probability))
        .unwrap_or(0.0)
}

/// Outcome class of normalization. The paper-cup case is kept apart from
/// the taxonomy; downstream it is disposed of like an unknown item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelClass {
    Material(Material),
    PaperCup,
}

/// Which precedence step produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Electronics,
    PaperCup,
    PaperSubstrate,
    GlassContainer,
    Glass,
    Metal,
    Cardboard,
    Paper,
    Organic,
    Plastic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub class: LabelClass,
    pub step: Option<Step>,
    /// Name of the label that triggered `step`.
    pub evidence: Option<String>,
}

impl Inference {
    fn unknown() -> Self {
        Self {
            class: LabelClass::Material(Material::Unknown),
            step: None,
            evidence: None,
        }
    }

    fn hit(class: LabelClass, step: Step, label: &str) -> Self {
        Self {
            class,
            step: Some(step),
            evidence: Some(label.to_string()),
        }
    }
}

const ELECTRONICS: &[&str] = &[
    "battery",
    "batteries",
    "phone",
    "cellphone",
    "smartphone",
    "telephone",
    "electronic",
    "electronics",
    "laptop",
    "computer",
    "keyboard",
    "charger",
    "cable",
    "remote control",
    "headphone",
    "headphones",
    "earbuds",
    "circuit",
];

const CUP_PHRASES: &[&str] = &["paper cup", "coffee cup", "hot cup"];

const PAPER_SUBSTRATE: &[&str] = &[
    "document",
    "doc",
    "sheet",
    "a4",
    "page",
    "printer paper",
    "notebook",
    "book",
    "comic book",
    "magazine",
    "newspaper",
    "envelope",
    "receipt",
    "invoice",
    "letter",
    "menu",
    "binder",
    "flyer",
    "brochure",
];

const CONTAINERS: &[&str] = &["jar", "jars", "bottle", "bottles"];

const GLASS: &[&str] = &["glass", "glassware", "jar", "jars", "goblet"];

const METAL: &[&str] = &[
    "metal",
    "aluminum",
    "aluminium",
    "tin",
    "steel",
    "can",
    "cans",
    "foil",
];

const CARDBOARD: &[&str] = &[
    "cardboard",
    "box",
    "boxes",
    "carton",
    "cartons",
    "corrugated",
];

const PAPER: &[&str] = &["paper", "papers", "napkin", "tissue", "paper towel"];

const ORGANIC: &[&str] = &[
    "banana",
    "apple",
    "orange",
    "lemon",
    "food",
    "peel",
    "compost",
    "fruit",
    "vegetable",
    "vegetables",
    "bread",
    "bagel",
    "pizza",
    "sandwich",
    "donut",
    "cake",
    "carrot",
    "broccoli",
    "cauliflower",
    "cucumber",
    "corn",
    "potato",
    "mushroom",
    "pineapple",
    "strawberry",
    "pomegranate",
    "eggshell",
    "coffee grounds",
    "leaf",
    "leaves",
];

const PLASTIC: &[&str] = &[
    "plastic",
    "bottle",
    "bottles",
    "clamshell",
    "film",
    "tub",
    "bag",
    "bags",
    "straw",
    "straws",
    "wrapper",
    "cup",
    "lid",
    "container",
];

fn tokens(name: &str) -> Vec<String> {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn has_phrase(tokens: &[String], phrase: &str) -> bool {
    let wanted: Vec<&str> = phrase.split(' ').collect();
    tokens
        .windows(wanted.len())
        .any(|w| w.iter().zip(&wanted).all(|(a, b)| a == b))
}

fn matches_any(tokens: &[String], family: &[&str]) -> bool {
    family.iter().any(|phrase| has_phrase(tokens, phrase))
}

fn is_cup_cue(tokens: &[String]) -> bool {
    // A bare `cup` label is the detector's class name for takeaway cups.
    matches_any(tokens, CUP_PHRASES) || (tokens.len() == 1 && tokens[0] == "cup")
}

/// True when any label names a paper or coffee cup.
pub fn has_cup_cue(labels: &[Label]) -> bool {
    labels.iter().any(|l| is_cup_cue(&tokens(&l.name)))
}

/// True when any label names a flat paper substrate (sheet, book, receipt…).
pub fn has_paper_substrate_cue(labels: &[Label]) -> bool {
    labels
        .iter()
        .any(|l| matches_any(&tokens(&l.name), PAPER_SUBSTRATE))
}

struct Candidate<'a> {
    name: &'a str,
    tokens: Vec<String>,
}

fn first_match<'a>(candidates: &'a [Candidate<'a>], family: &[&str]) -> Option<&'a str> {
    candidates
        .iter()
        .find(|c| matches_any(&c.tokens, family))
        .map(|c| c.name)
}

/// Maps an ordered label list to a single class.
///
/// The top label is always considered; other labels only when their
/// probability reaches `label_floor`. The confidence gate is not applied
/// here, it belongs to the caller.
pub fn normalize(labels: &[Label], label_floor: f64) -> Inference {
    let candidates: Vec<Candidate<'_>> = labels
        .iter()
        .enumerate()
        .filter(|(idx, l)| *idx == 0 || clamp_probability(l.probability) >= label_floor)
        .map(|(_, l)| Candidate {
            name: &l.name,
            tokens: tokens(&l.name),
        })
        .collect();

    if candidates.is_empty() {
        return Inference::unknown();
    }

    if let Some(name) = first_match(&candidates, ELECTRONICS) {
        return Inference::hit(LabelClass::Material(Material::Ewaste), Step::Electronics, name);
    }

    if let Some(c) = candidates.iter().find(|c| is_cup_cue(&c.tokens)) {
        return Inference::hit(LabelClass::PaperCup, Step::PaperCup, c.name);
    }

    // Printed subjects ("elephant" on a notebook) never name the material;
    // the substrate does. No cup cue can be present past the step above.
    if let Some(name) = first_match(&candidates, PAPER_SUBSTRATE) {
        return Inference::hit(
            LabelClass::Material(Material::Paper),
            Step::PaperSubstrate,
            name,
        );
    }

    let glass_hit = first_match(&candidates, &["glass"]);
    if glass_hit.is_some() {
        if let Some(name) = first_match(&candidates, CONTAINERS) {
            return Inference::hit(
                LabelClass::Material(Material::Glass),
                Step::GlassContainer,
                name,
            );
        }
    }
    if let Some(name) = first_match(&candidates, GLASS) {
        return Inference::hit(LabelClass::Material(Material::Glass), Step::Glass, name);
    }

    let ordered: [(&[&str], Material, Step); 5] = [
        (METAL, Material::Metal, Step::Metal),
        (CARDBOARD, Material::Cardboard, Step::Cardboard),
        (PAPER, Material::Paper, Step::Paper),
        (ORGANIC, Material::Organic, Step::Organic),
        (PLASTIC, Material::Plastic, Step::Plastic),
    ];
    for (family, material, step) in ordered {
        if let Some(name) = first_match(&candidates, family) {
            return Inference::hit(LabelClass::Material(material), step, name);
        }
    }

    Inference::unknown()
}

/// Prepends a high-confidence `paper` label when substrate cues are present
/// without cup cues, biasing an advisory the same way [`normalize`] is biased.
pub fn seed_paper_label(labels: &[Label]) -> Vec<Label> {
    let mut out = labels.to_vec();
    let already_seeded = labels
        .first()
        .is_some_and(|l| l.name.eq_ignore_ascii_case("paper"));
    if !already_seeded && has_paper_substrate_cue(labels) && !has_cup_cue(labels) {
        let probability = top_probability(labels).max(0.9);
        out.insert(0, Label::new("paper", probability));
    }
    out
}

const MAX_MERGED_LABELS: usize = 12;
const MAX_DETECTIONS: usize = 5;

const PRIORITY_CLASSES: &[&str] = &[
    "cup",
    "bottle",
    "wine glass",
    "bowl",
    "banana",
    "apple",
    "orange",
    "pizza",
    "sandwich",
    "donut",
    "cake",
    "carrot",
    "broccoli",
    "book",
    "laptop",
    "keyboard",
    "cell phone",
];

fn by_score_desc(a: &Detection, b: &Detection) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}

/// Picks the detection to crop around: the best-scoring priority class,
/// otherwise the best-scoring detection.
pub fn select_primary(detections: &[Detection]) -> Option<&Detection> {
    let mut sorted: Vec<&Detection> = detections.iter().collect();
    sorted.sort_by(|a, b| by_score_desc(a, b));
    sorted
        .iter()
        .find(|d| PRIORITY_CLASSES.contains(&d.class.to_lowercase().as_str()))
        .or_else(|| sorted.first())
        .copied()
}

/// Merges detector and classifier output into one significance-ranked list.
pub fn merge_labels(detections: &[Detection], classifications: &[Label]) -> Vec<Label> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(by_score_desc);
    sorted.truncate(MAX_DETECTIONS);

    let mut out: Vec<Label> = Vec::new();
    for det in &sorted {
        let class = det.class.to_lowercase();
        let score = clamp_probability(det.score);
        match class.as_str() {
            "cup" => {
                out.push(Label::new("paper cup", score * 0.85));
                out.push(Label::new("coffee cup", score * 0.8));
            }
            "bottle" => {
                out.push(Label::new("plastic bottle", score * 0.9));
                out.push(Label::new("glass bottle", score * 0.7));
            }
            _ => {}
        }
        out.push(Label::new(class, score));
    }

    for label in classifications {
        let name = label.name.to_lowercase();
        if !out.iter().any(|l| l.name == name) {
            out.push(Label::new(name, label.probability));
        }
    }

    let mut out = seed_paper_label(&out);
    out.truncate(MAX_MERGED_LABELS);
    out
}

#[cfg(test)]
#[path = "labels_tests.rs"]
mod tests;
