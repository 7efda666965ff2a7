//! ECUs seen on the vehicle network

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Well known OBD-II response identifiers
pub fn common_ecu_name(can_id: u32) -> Option<&'static str> {
    match can_id {
        0x7E8 => Some("Engine Control Module (ECM)"),
        0x7E9 => Some("Transmission Control Module (TCM)"),
        0x7EA => Some("Anti-lock Braking System (ABS)"),
        0x7EB => Some("Body Control Module (BCM)"),
        0x7EC => Some("Instrument Cluster"),
        0x7ED => Some("Airbag Control Module"),
        0x7EE => Some("HVAC Control Module"),
        0x7EF => Some("Gateway Module"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcuInfo {
    pub can_id: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub supported_pids: BTreeSet<u8>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl EcuInfo {
    /// Record named from the common table, or `ECU 0x7A0` style
    pub fn new(can_id: u32) -> Self {
        let name = common_ecu_name(can_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("ECU 0x{can_id:03X}"));
        Self::named(can_id, name)
    }

    pub fn named(can_id: u32, name: impl Into<String>) -> Self {
        Self {
            can_id,
            name: name.into(),
            description: String::new(),
            protocol: String::new(),
            supported_pids: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }
}

impl fmt::Display for EcuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ID: 0x{:03X})", self.name, self.can_id)
    }
}

/// ECUs discovered during this session, keyed by CAN id
#[derive(Debug, Clone, Default)]
pub struct EcuDatabase {
    ecus: BTreeMap<u32, EcuInfo>,
}

impl EcuDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the stored record
    pub fn add(&mut self, ecu: EcuInfo) -> &mut EcuInfo {
        let slot = self.add_id(ecu.can_id);
        *slot = ecu;
        slot
    }

    /// Add with a name from the common table unless already known
    pub fn add_id(&mut self, can_id: u32) -> &mut EcuInfo {
        self.ecus.entry(can_id).or_insert_with(|| EcuInfo::new(can_id))
    }

    pub fn remove(&mut self, can_id: u32) -> Option<EcuInfo> {
        self.ecus.remove(&can_id)
    }

    pub fn get(&self, can_id: u32) -> Option<&EcuInfo> {
        self.ecus.get(&can_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &EcuInfo> {
        self.ecus.values()
    }

    /// No-op for unknown ids
    pub fn update_supported_pids(&mut self, can_id: u32, pids: impl IntoIterator<Item = u8>) {
        if let Some(ecu) = self.ecus.get_mut(&can_id) {
            ecu.supported_pids = pids.into_iter().collect();
        }
    }

    /// No-op for unknown ids
    pub fn set_property(&mut self, can_id: u32, key: impl Into<String>, value: serde_json::Value) {
        if let Some(ecu) = self.ecus.get_mut(&can_id) {
            ecu.properties.insert(key.into(), value);
        }
    }

    pub fn property(&self, can_id: u32, key: &str) -> Option<&serde_json::Value> {
        self.ecus.get(&can_id)?.properties.get(key)
    }

    pub fn clear(&mut self) {
        self.ecus.clear();
    }

    pub fn len(&self) -> usize {
        self.ecus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ecus.is_empty()
    }
}
