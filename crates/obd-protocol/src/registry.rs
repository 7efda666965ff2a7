//! PID registry: custom definitions layered over the standard table

use crate::custom::{CustomPidEntry, CustomPidFile};
use crate::error::{ObdError, ObdResult};
use crate::formula::Formula;
use crate::mode;
use crate::pid::{hex_string, standard_pid, PidDefinition, PidValue};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Decode engine state owned by a session
#[derive(Debug, Clone, Default)]
pub struct PidRegistry {
    custom: BTreeMap<(u8, u8), PidDefinition>,
}

impl PidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a custom definition, returning the one it replaced
    pub fn register(&mut self, definition: PidDefinition) -> Option<PidDefinition> {
        debug!(
            "Registering custom PID {:02X}/{:02X} ({})",
            definition.mode, definition.pid, definition.name
        );
        self.custom.insert(definition.key(), definition)
    }

    /// Compile `formula` and register it
    pub fn register_formula(
        &mut self,
        mode: u8,
        pid: u8,
        name: &str,
        unit: &str,
        formula: &str,
        num_bytes: usize,
    ) -> ObdResult<()> {
        let formula = Formula::compile(formula, num_bytes)
            .map_err(|e| ObdError::CustomPid(format!("{name}: {e}")))?;
        self.register(PidDefinition::custom(mode, pid, name, name, unit, formula, 0.0, 100.0));
        Ok(())
    }

    pub fn remove(&mut self, mode: u8, pid: u8) -> Option<PidDefinition> {
        self.custom.remove(&(mode, pid))
    }

    /// Custom definition only
    pub fn custom(&self, mode: u8, pid: u8) -> Option<&PidDefinition> {
        self.custom.get(&(mode, pid))
    }

    /// Effective definition: custom first, then the standard table for
    /// current data and freeze frames
    pub fn definition(&self, mode: u8, pid: u8) -> Option<&PidDefinition> {
        self.custom(mode, pid).or_else(|| match mode {
            mode::CURRENT_DATA | mode::FREEZE_FRAME => standard_pid(pid),
            _ => None,
        })
    }

    /// Decode data bytes; unknown PIDs come back as hex text
    pub fn decode(&self, mode: u8, pid: u8, bytes: &[u8]) -> PidValue {
        match self.definition(mode, pid) {
            Some(definition) => definition.decode(bytes),
            None => hex_string(bytes),
        }
    }

    /// Take every custom definition from `other`; its entries win
    pub fn merge(&mut self, other: PidRegistry) -> usize {
        let count = other.custom.len();
        self.custom.extend(other.custom);
        count
    }

    pub fn custom_definitions(&self) -> impl Iterator<Item = &PidDefinition> {
        self.custom.values()
    }

    pub fn len(&self) -> usize {
        self.custom.len()
    }

    pub fn is_empty(&self) -> bool {
        self.custom.is_empty()
    }

    /// Load custom definitions from a JSON file, skipping entries whose
    /// formula does not compile. Returns the number registered.
    pub fn load_file(&mut self, path: &Path) -> ObdResult<usize> {
        let file = CustomPidFile::load(path)?;
        let mut loaded = 0;
        for entry in &file.pids {
            match entry.compile() {
                Ok(definition) => {
                    self.register(definition);
                    loaded += 1;
                }
                Err(e) => warn!(
                    "Skipping custom PID {:02X}/{:02X} ({}): {}",
                    entry.mode, entry.pid, entry.name, e
                ),
            }
        }
        info!("Loaded {} custom PIDs from {}", loaded, path.display());
        Ok(loaded)
    }

    pub fn save_file(&self, path: &Path) -> ObdResult<()> {
        let pids = self
            .custom
            .values()
            .filter_map(|def| {
                let entry = CustomPidEntry::from_definition(def);
                if entry.is_none() {
                    warn!("Custom PID {} has no formula, not saved", def.name);
                }
                entry
            })
            .collect();
        CustomPidFile { pids }.save(path)?;
        info!("Saved {} custom PIDs to {}", self.custom.len(), path.display());
        Ok(())
    }

    /// `"1726.00 RPM"`, `"38 °C"`, or just the value when there is no unit
    pub fn format_value(&self, mode: u8, pid: u8, value: &PidValue) -> String {
        let unit = self.definition(mode, pid).map(|d| d.unit.as_ref()).unwrap_or("");
        let text = match value {
            PidValue::Float(f) => format!("{f:.2} {unit}"),
            other => format!("{other} {unit}"),
        };
        text.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("obd-registry-{}-{}.json", std::process::id(), name))
    }

    #[test]
    fn test_standard_fallback_and_hex() {
        let registry = PidRegistry::new();
        assert_eq!(registry.decode(0x01, 0x05, &[0x4E]), PidValue::Integer(38));
        assert_eq!(registry.decode(0x02, 0x05, &[0x4E]), PidValue::Integer(38));
        assert_eq!(registry.decode(0x22, 0x05, &[0x4E, 0x01]), PidValue::Text("4E 01".into()));
        assert_eq!(registry.decode(0x01, 0xFE, &[0xAB]), PidValue::Text("AB".into()));
    }

    #[test]
    fn test_custom_shadows_standard() {
        let mut registry = PidRegistry::new();
        registry
            .register_formula(0x01, 0x05, "Coolant_F", "°F", "(A-40)*9/5+32", 1)
            .unwrap();
        let fahrenheit = registry.decode(0x01, 0x05, &[0x4E]).as_f64().unwrap();
        assert!((fahrenheit - 100.4).abs() < 1e-9);

        registry.remove(0x01, 0x05);
        assert_eq!(registry.decode(0x01, 0x05, &[0x4E]), PidValue::Integer(38));
    }

    #[test]
    fn test_bad_formula_rejected() {
        let mut registry = PidRegistry::new();
        let err = registry.register_formula(0x22, 0x01, "Bad", "", "A +* open()", 1);
        assert!(matches!(err, Err(ObdError::CustomPid(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_format_value() {
        let registry = PidRegistry::new();
        assert_eq!(registry.format_value(0x01, 0x0C, &PidValue::Float(1726.0)), "1726.00 RPM");
        assert_eq!(registry.format_value(0x01, 0x05, &PidValue::Integer(38)), "38 °C");
        assert_eq!(registry.format_value(0x01, 0x00, &PidValue::Text("BE 1F".into())), "BE 1F");
    }

    #[test]
    fn test_merge_prefers_incoming() {
        let mut base = PidRegistry::new();
        base.register_formula(0x22, 0x01, "Old", "", "A", 1).unwrap();
        let mut incoming = PidRegistry::new();
        incoming.register_formula(0x22, 0x01, "New", "", "A*2", 1).unwrap();
        incoming.register_formula(0x22, 0x02, "Other", "", "A", 1).unwrap();

        assert_eq!(base.merge(incoming), 2);
        assert_eq!(base.len(), 2);
        assert_eq!(base.custom(0x22, 0x01).unwrap().name, "New");
    }

    #[test]
    fn test_save_then_load_file() {
        let path = temp_path("roundtrip");
        let mut registry = PidRegistry::new();
        registry.register_formula(0x22, 0x10, "Boost", "kPa", "(A*256+B)/10", 2).unwrap();
        registry.save_file(&path).unwrap();

        let mut loaded = PidRegistry::new();
        assert_eq!(loaded.load_file(&path).unwrap(), 1);
        let def = loaded.custom(0x22, 0x10).unwrap();
        assert_eq!(def.decoder.formula().unwrap().source(), "(A*256+B)/10");
        assert_eq!(loaded.decode(0x22, 0x10, &[0x01, 0x00]), PidValue::Float(25.6));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_skips_uncompilable_entries() {
        let path = temp_path("skips");
        std::fs::write(
            &path,
            r#"{"pids": [
                {"mode": 34, "pid": 1, "name": "Good", "formula": "A*2"},
                {"mode": 34, "pid": 2, "name": "Evil", "formula": "__import__('os').system('x')"}
            ]}"#,
        )
        .unwrap();

        let mut registry = PidRegistry::new();
        assert_eq!(registry.load_file(&path).unwrap(), 1);
        assert!(registry.custom(0x22, 0x02).is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_missing_file() {
        let mut registry = PidRegistry::new();
        assert_eq!(registry.load_file(&temp_path("missing")).unwrap(), 0);
    }
}
