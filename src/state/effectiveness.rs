//! Gate effectiveness counters that outlive sessions.

use super::store::{lock_path_for, read_json, write_json_atomic, FileLock};
use crate::config::Paths;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectivenessField {
    /// The gate blocked a call
    Blocks,
    /// The same call went through later without the gate's advice being taken
    Overrides,
    /// The agent did what the gate asked before retrying
    Prevented,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateEffectiveness {
    pub blocks: u64,
    pub overrides: u64,
    pub prevented: u64,
}

impl GateEffectiveness {
    fn bump(&mut self, field: EffectivenessField) {
        match field {
            EffectivenessField::Blocks => self.blocks += 1,
            EffectivenessField::Overrides => self.overrides += 1,
            EffectivenessField::Prevented => self.prevented += 1,
        }
    }
}

pub type EffectivenessTable = BTreeMap<String, GateEffectiveness>;

pub fn load_gate_effectiveness(paths: &Paths) -> EffectivenessTable {
    read_json(&paths.effectiveness_file())
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Increment one counter for `gate` in the persistent file
pub fn update_gate_effectiveness(
    paths: &Paths,
    gate: &str,
    field: EffectivenessField,
) -> Result<()> {
    let path = paths.effectiveness_file();
    let _lock = FileLock::exclusive(&lock_path_for(&path))?;
    let mut table = load_gate_effectiveness(paths);
    table.entry(gate.to_string()).or_default().bump(field);
    write_json_atomic(&path, &table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_update_accumulates() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        update_gate_effectiveness(&paths, "gate_01", EffectivenessField::Blocks).unwrap();
        update_gate_effectiveness(&paths, "gate_01", EffectivenessField::Blocks).unwrap();
        update_gate_effectiveness(&paths, "gate_01", EffectivenessField::Prevented).unwrap();
        update_gate_effectiveness(&paths, "gate_04", EffectivenessField::Overrides).unwrap();

        let table = load_gate_effectiveness(&paths);
        assert_eq!(table["gate_01"].blocks, 2);
        assert_eq!(table["gate_01"].prevented, 1);
        assert_eq!(table["gate_04"].overrides, 1);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::under(dir.path());
        assert!(load_gate_effectiveness(&paths).is_empty());
    }
}
