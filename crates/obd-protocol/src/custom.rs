//! Custom PID JSON store
//!
//! File layout:
//!
//! ```json
//! { "pids": [ { "mode": 34, "pid": 5, "name": "Oil_pressure", "unit": "kPa",
//!               "formula": "A*4", "num_bytes": 1, "min_val": 0, "max_val": 1000 } ] }
//! ```

use crate::error::ObdResult;
use crate::formula::{Formula, FormulaError};
use crate::pid::PidDefinition;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

fn default_mode() -> u8 {
    0x01
}

fn default_formula() -> String {
    "A".to_string()
}

fn default_num_bytes() -> usize {
    1
}

fn default_max_val() -> f64 {
    100.0
}

/// One stored custom PID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPidEntry {
    #[serde(default = "default_mode")]
    pub mode: u8,
    pub pid: u8,
    pub name: String,
    /// Falls back to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_formula")]
    pub formula: String,
    #[serde(default = "default_num_bytes")]
    pub num_bytes: usize,
    #[serde(default)]
    pub min_val: f64,
    #[serde(default = "default_max_val")]
    pub max_val: f64,
}

impl CustomPidEntry {
    /// Compile the formula into a usable definition
    pub fn compile(&self) -> Result<PidDefinition, FormulaError> {
        let formula = Formula::compile(&self.formula, self.num_bytes)?;
        Ok(PidDefinition::custom(
            self.mode,
            self.pid,
            self.name.clone(),
            self.description.clone().unwrap_or_else(|| self.name.clone()),
            self.unit.clone(),
            formula,
            self.min_val,
            self.max_val,
        ))
    }

    /// Entry for a formula-backed definition; built-in decoders have no
    /// textual form
    pub fn from_definition(def: &PidDefinition) -> Option<Self> {
        let formula = def.decoder.formula()?;
        Some(Self {
            mode: def.mode,
            pid: def.pid,
            name: def.name.to_string(),
            description: Some(def.description.to_string()),
            unit: def.unit.to_string(),
            formula: formula.source().to_string(),
            num_bytes: def.num_bytes,
            min_val: def.min_val,
            max_val: def.max_val,
        })
    }
}

/// Whole custom PID file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomPidFile {
    #[serde(default)]
    pub pids: Vec<CustomPidEntry>,
}

impl CustomPidFile {
    /// Read `path`; a missing file is an empty store
    pub fn load(path: &Path) -> ObdResult<Self> {
        if !path.exists() {
            debug!("No custom PID file at {}", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> ObdResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
