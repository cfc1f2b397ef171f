//! Rule Table: the authoritative material → {bin, years, tip} mapping.
//!
//! Entries may be partial. Missing fields resolve against the built-in
//! defaults below, so every recognized material always has a complete rule.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::material::{Bin, Material};

/// A possibly partial rule as written in a config file or request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<Bin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub years: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip: Option<String>,
}

impl RuleEntry {
    /// Reads an entry from untrusted JSON. Fields of the wrong type, invalid
    /// bins and negative or non-finite years are dropped, not rejected.
    pub fn from_value(value: &Value) -> Option<RuleEntry> {
        let obj = value.as_object()?;
        Some(RuleEntry {
            bin: obj.get("bin").and_then(Value::as_str).and_then(Bin::parse),
            years: obj
                .get("years")
                .and_then(Value::as_f64)
                .filter(|y| y.is_finite() && *y >= 0.0),
            tip: obj
                .get("tip")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        })
    }

    /// Field-wise merge; fields set on `other` win.
    fn merged_with(&self, other: &RuleEntry) -> RuleEntry {
        RuleEntry {
            bin: other.bin.or(self.bin),
            years: other.years.or(self.years),
            tip: other.tip.clone().or_else(|| self.tip.clone()),
        }
    }
}

/// A fully resolved rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub bin: Bin,
    pub years: f64,
    pub tip: String,
}

/// Built-in rule for a material, used for any field the table leaves open.
pub fn builtin_rule(material: Material) -> Rule {
    let (bin, years, tip) = match material {
        Material::Plastic => (Bin::Recycling, 450.0, "Rinse to avoid contamination."),
        Material::Metal => (Bin::Recycling, 200.0, "Crush cans to save space."),
        Material::Glass => (
            Bin::Recycling,
            1_000_000.0,
            "Remove caps; glass is endlessly recyclable.",
        ),
        Material::Paper => (Bin::Recycling, 2.0, "Keep paper dry to recycle."),
        Material::Cardboard => (Bin::Recycling, 2.0, "Flatten boxes."),
        Material::Organic => (
            Bin::Compost,
            1.0,
            "Great for organics; use a liner if allowed.",
        ),
        Material::Ewaste => (
            Bin::Special,
            1000.0,
            "Take to an e-waste drop-off; hazardous if trashed.",
        ),
        Material::Unknown => (Bin::Landfill, 50.0, "Reduce single-use items next time."),
    };
    Rule {
        bin,
        years,
        tip: tip.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RuleTable(BTreeMap<Material, RuleEntry>);

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, material: Material) -> Option<&RuleEntry> {
        self.0.get(&material)
    }

    /// Unknown is never keyed; its handling is fixed policy.
    pub fn insert(&mut self, material: Material, entry: RuleEntry) {
        if material.is_recognized() {
            self.0.insert(material, entry);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Material, &RuleEntry)> {
        self.0.iter()
    }

    /// Reads a table from untrusted JSON. Keys outside the taxonomy
    /// (including bin names such as `landfill`) are skipped.
    pub fn from_value(value: &Value) -> RuleTable {
        let mut table = RuleTable::new();
        let Some(obj) = value.as_object() else {
            return table;
        };
        for (key, raw) in obj {
            let Some(material) = Material::parse(key) else {
                tracing::debug!(key = %key, "ignoring rule for non-taxonomy key");
                continue;
            };
            if let Some(entry) = RuleEntry::from_value(raw) {
                table.insert(material, entry);
            }
        }
        table
    }

    /// Returns a table where `other` is layered on top of `self`.
    pub fn overlay(&self, other: &RuleTable) -> RuleTable {
        let mut merged = self.0.clone();
        for (material, entry) in &other.0 {
            let next = match merged.get(material) {
                Some(base) => base.merged_with(entry),
                None => entry.clone(),
            };
            merged.insert(*material, next);
        }
        RuleTable(merged)
    }

    /// Complete rule for `material`, filling gaps from [`builtin_rule`].
    pub fn resolve(&self, material: Material) -> Rule {
        let builtin = builtin_rule(material);
        match self.get(material) {
            Some(entry) => Rule {
                bin: entry.bin.unwrap_or(builtin.bin),
                years: entry.years.unwrap_or(builtin.years),
                tip: entry.tip.clone().unwrap_or(builtin.tip),
            },
            None => builtin,
        }
    }
}

impl FromIterator<(Material, RuleEntry)> for RuleTable {
    fn from_iter<I: IntoIterator<Item = (Material, RuleEntry)>>(iter: I) -> Self {
        let mut table = RuleTable::new();
        for (material, entry) in iter {
            table.insert(material, entry);
        }
        table
    }
}

// Config files use the same lenient key spelling as request bodies, but the
// entries themselves are typed.
impl<'de> Deserialize<'de> for RuleTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, RuleEntry>::deserialize(deserializer)?;
        let mut table = RuleTable::new();
        for (key, entry) in raw {
            match Material::parse(&key) {
                Some(material) => table.insert(material, entry),
                None => tracing::warn!(key = %key, "rule key outside the taxonomy, skipped"),
            }
        }
        Ok(table)
    }
}
