//! Canonical material taxonomy and disposal streams.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical waste category.
///
/// `Unknown` is the sentinel for everything outside the taxonomy; it is a
/// valid terminal classification, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Material {
    Plastic,
    Metal,
    Glass,
    Paper,
    Cardboard,
    Organic,
    Ewaste,
    Unknown,
}

impl Material {
    /// Recognized materials, in the order they are presented to operators.
    pub const TAXONOMY: [Material; 7] = [
        Material::Plastic,
        Material::Metal,
        Material::Glass,
        Material::Paper,
        Material::Cardboard,
        Material::Organic,
        Material::Ewaste,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Material::Plastic => "plastic",
            Material::Metal => "metal",
            Material::Glass => "glass",
            Material::Paper => "paper",
            Material::Cardboard => "cardboard",
            Material::Organic => "organic",
            Material::Ewaste => "ewaste",
            Material::Unknown => "unknown",
        }
    }

    pub fn is_recognized(self) -> bool {
        self != Material::Unknown
    }

    /// Parses a taxonomy member, tolerating case, surrounding whitespace and
    /// the spellings used by older rule tables (`e-waste`, `compost`).
    ///
    /// Returns `None` for anything outside the taxonomy, including the
    /// literal `"unknown"`.
    pub fn parse(raw: &str) -> Option<Material> {
        let key: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "plastic" | "plastics" => Some(Material::Plastic),
            "metal" | "metals" => Some(Material::Metal),
            "glass" => Some(Material::Glass),
            "paper" => Some(Material::Paper),
            "cardboard" => Some(Material::Cardboard),
            "organic" | "organics" | "compost" => Some(Material::Organic),
            "ewaste" => Some(Material::Ewaste),
            _ => None,
        }
    }
}

impl fmt::Display for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disposal stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bin {
    Recycling,
    Compost,
    Landfill,
    /// Drop-off for hazardous items (batteries, electronics).
    Special,
}

impl Bin {
    pub fn as_str(self) -> &'static str {
        match self {
            Bin::Recycling => "recycling",
            Bin::Compost => "compost",
            Bin::Landfill => "landfill",
            Bin::Special => "special",
        }
    }

    pub fn parse(raw: &str) -> Option<Bin> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "recycling" => Some(Bin::Recycling),
            "compost" => Some(Bin::Compost),
            "landfill" => Some(Bin::Landfill),
            "special" => Some(Bin::Special),
            _ => None,
        }
    }
}

impl fmt::Display for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
