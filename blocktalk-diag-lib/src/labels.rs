//! Measuring block labels, keyed by module part number.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Human-readable names for one measuring block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BlockLabels {
    pub name: String,
    pub desc: [String; 4],
    pub sub_desc: [String; 4],
    pub long_desc: [String; 4],
    pub bin_desc: [String; 4],
}

/// Labels for every known block of one module.
pub type ModuleLabels = BTreeMap<u8, BlockLabels>;

/// Source of block labels.
pub trait LabelRepository: Send {
    /// Labels for the module with this (dashed) part number, if known.
    fn lookup(&self, part_number: &str) -> Option<ModuleLabels>;
}

/// Repository that never has labels.
#[derive(Debug, Default)]
pub struct NoLabels;

impl LabelRepository for NoLabels {
    fn lookup(&self, _part_number: &str) -> Option<ModuleLabels> {
        None
    }
}

/// In-memory repository, optionally loaded from a JSON file shaped like
/// `{"038-906-019-FE": {"1": {"desc": ["Engine Speed", ...]}}}`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticLabels {
    modules: HashMap<String, ModuleLabels>,
}

impl StaticLabels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, part_number: &str, labels: ModuleLabels) {
        self.modules.insert(part_number.to_string(), labels);
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        debug!("Loading labels from {}", path.display());
        let buf = std::fs::read(path)?;
        let labels: Self = serde_json::from_slice(&buf)?;
        debug!("Labels loaded for {} modules", labels.modules.len());
        Ok(labels)
    }
}

impl LabelRepository for StaticLabels {
    fn lookup(&self, part_number: &str) -> Option<ModuleLabels> {
        self.modules.get(part_number).cloned()
    }
}

/// Derive the label key from the part number field of a long identification:
/// the first word, cut into groups of three characters joined by `-`
/// (`038906019FE` becomes `038-906-019-FE`).
pub fn label_part_number(part_number: &str) -> String {
    let word = part_number.split_whitespace().next().unwrap_or("");
    word.chars()
        .collect::<Vec<_>>()
        .chunks(3)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}
