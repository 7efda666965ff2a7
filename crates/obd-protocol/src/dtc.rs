//! Diagnostic Trouble Codes
//!
//! Two wire bytes per code:
//!
//! ```text
//! byte 1: [7:6] system letter (P C B U)  [5:4] first digit  [3:0] second digit
//! byte 2: [7:4] third digit              [3:0] fourth digit
//! ```
//!
//! `00 00` is padding, not a code.

use crate::error::{ObdError, ObdResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

const SYSTEM_LETTERS: [char; 4] = ['P', 'C', 'B', 'U'];

/// Decode one code; `None` for the `00 00` filler
pub fn decode_dtc(b1: u8, b2: u8) -> Option<String> {
    if b1 == 0 && b2 == 0 {
        return None;
    }
    let letter = SYSTEM_LETTERS[usize::from(b1 >> 6)];
    let first = (b1 >> 4) & 0x03;
    let second = b1 & 0x0F;
    Some(format!("{letter}{first}{second:X}{b2:02X}"))
}

/// Whether `code` has the canonical form `^[PCBU][0-3][0-9A-F]{3}$`
pub fn is_valid_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 5
        && SYSTEM_LETTERS.contains(&(bytes[0] as char))
        && (b'0'..=b'3').contains(&bytes[1])
        && bytes[2..].iter().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(b))
}

/// Inverse of [`decode_dtc`]
pub fn encode_dtc(code: &str) -> ObdResult<[u8; 2]> {
    if !is_valid_code(code) {
        return Err(ObdError::InvalidArgument(format!("not a DTC: '{code}'")));
    }
    let bytes = code.as_bytes();
    let letter = SYSTEM_LETTERS
        .iter()
        .position(|l| *l as u8 == bytes[0])
        .unwrap_or_default() as u8;
    let nibble = |b: u8| (b as char).to_digit(16).unwrap_or_default() as u8;

    Ok([
        (letter << 6) | ((bytes[1] - b'0') << 4) | nibble(bytes[2]),
        (nibble(bytes[3]) << 4) | nibble(bytes[4]),
    ])
}

/// Decode a run of 4-hex-digit groups (spaces allowed), skipping filler
/// and anything that is not hex
pub fn parse_dtc_payload(hex: &str) -> Vec<String> {
    let compact: Vec<u8> = hex.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    compact
        .chunks_exact(4)
        .filter_map(|group| {
            let group = std::str::from_utf8(group).ok()?;
            let value = u16::from_str_radix(group, 16).ok()?;
            decode_dtc((value >> 8) as u8, value as u8)
        })
        .collect()
}

/// Where a code was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcKind {
    /// Mode 03
    Stored,
    /// Mode 07
    Pending,
    /// Mode 0A
    Permanent,
}

impl DtcKind {
    /// OBD-II request mode
    pub fn mode(&self) -> u8 {
        match self {
            DtcKind::Stored => crate::mode::READ_DTC,
            DtcKind::Pending => crate::mode::PENDING_DTC,
            DtcKind::Permanent => crate::mode::PERMANENT_DTC,
        }
    }

    /// Positive response echo, e.g. `"43"`
    pub fn response_prefix(&self) -> String {
        format!("{:02X}", self.mode() + 0x40)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DtcKind::Stored => "stored",
            DtcKind::Pending => "pending",
            DtcKind::Permanent => "permanent",
        }
    }
}

impl fmt::Display for DtcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Rough estimate from a short list of well known codes
    pub fn of(code: &str) -> Self {
        match code {
            "P0100" | "P0300" | "P0301" | "P0302" | "P0303" | "P0304" => Severity::Critical,
            "P0171" | "P0172" | "P0420" | "P0430" | "P0500" => Severity::High,
            "P0440" | "P0455" | "P0700" => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A trouble code with its description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dtc {
    pub code: String,
    pub description: String,
    pub kind: DtcKind,
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

// Sorted by code
static DESCRIPTIONS: &[(&str, &str)] = &[
    ("P0000", "No fault"),
    ("P0100", "Mass or Volume Air Flow Circuit Malfunction"),
    ("P0101", "Mass or Volume Air Flow Circuit Range/Performance Problem"),
    ("P0102", "Mass or Volume Air Flow Circuit Low Input"),
    ("P0103", "Mass or Volume Air Flow Circuit High Input"),
    ("P0104", "Mass or Volume Air Flow Circuit Intermittent"),
    ("P0105", "Manifold Absolute Pressure/Barometric Pressure Circuit Malfunction"),
    ("P0106", "Manifold Absolute Pressure/Barometric Pressure Circuit Range/Performance Problem"),
    ("P0107", "Manifold Absolute Pressure/Barometric Pressure Circuit Low Input"),
    ("P0108", "Manifold Absolute Pressure/Barometric Pressure Circuit High Input"),
    ("P0109", "Manifold Absolute Pressure/Barometric Pressure Circuit Intermittent"),
    ("P0110", "Intake Air Temperature Circuit Malfunction"),
    ("P0111", "Intake Air Temperature Circuit Range/Performance Problem"),
    ("P0112", "Intake Air Temperature Circuit Low Input"),
    ("P0113", "Intake Air Temperature Circuit High Input"),
    ("P0114", "Intake Air Temperature Circuit Intermittent"),
    ("P0115", "Engine Coolant Temperature Circuit Malfunction"),
    ("P0116", "Engine Coolant Temperature Circuit Range/Performance Problem"),
    ("P0117", "Engine Coolant Temperature Circuit Low Input"),
    ("P0118", "Engine Coolant Temperature Circuit High Input"),
    ("P0119", "Engine Coolant Temperature Circuit Intermittent"),
    ("P0120", "Throttle Position Sensor/Switch A Circuit Malfunction"),
    ("P0121", "Throttle Position Sensor/Switch A Circuit Range/Performance Problem"),
    ("P0122", "Throttle Position Sensor/Switch A Circuit Low Input"),
    ("P0123", "Throttle Position Sensor/Switch A Circuit High Input"),
    ("P0124", "Throttle Position Sensor/Switch A Circuit Intermittent"),
    ("P0125", "Insufficient Coolant Temperature for Closed Loop Fuel Control"),
    ("P0130", "O2 Sensor Circuit Malfunction (Bank 1, Sensor 1)"),
    ("P0131", "O2 Sensor Circuit Low Voltage (Bank 1, Sensor 1)"),
    ("P0132", "O2 Sensor Circuit High Voltage (Bank 1, Sensor 1)"),
    ("P0133", "O2 Sensor Circuit Slow Response (Bank 1, Sensor 1)"),
    ("P0134", "O2 Sensor Circuit No Activity Detected (Bank 1, Sensor 1)"),
    ("P0135", "O2 Sensor Heater Circuit Malfunction (Bank 1, Sensor 1)"),
    ("P0171", "System Too Lean (Bank 1)"),
    ("P0172", "System Too Rich (Bank 1)"),
    ("P0174", "System Too Lean (Bank 2)"),
    ("P0175", "System Too Rich (Bank 2)"),
    ("P0200", "Injector Circuit Malfunction"),
    ("P0300", "Random/Multiple Cylinder Misfire Detected"),
    ("P0301", "Cylinder 1 Misfire Detected"),
    ("P0302", "Cylinder 2 Misfire Detected"),
    ("P0303", "Cylinder 3 Misfire Detected"),
    ("P0304", "Cylinder 4 Misfire Detected"),
    ("P0305", "Cylinder 5 Misfire Detected"),
    ("P0306", "Cylinder 6 Misfire Detected"),
    ("P0307", "Cylinder 7 Misfire Detected"),
    ("P0308", "Cylinder 8 Misfire Detected"),
    ("P0420", "Catalyst System Efficiency Below Threshold (Bank 1)"),
    ("P0430", "Catalyst System Efficiency Below Threshold (Bank 2)"),
    ("P0440", "Evaporative Emission Control System Malfunction"),
    ("P0441", "Evaporative Emission Control System Incorrect Purge Flow"),
    ("P0442", "Evaporative Emission Control System Leak Detected (Small Leak)"),
    ("P0443", "Evaporative Emission Control System Purge Control Valve Circuit Malfunction"),
    ("P0446", "Evaporative Emission Control System Vent Control Circuit Malfunction"),
    ("P0455", "Evaporative Emission Control System Leak Detected (Large Leak)"),
    ("P0500", "Vehicle Speed Sensor Malfunction"),
    ("P0505", "Idle Control System Malfunction"),
    ("P0506", "Idle Control System RPM Lower Than Expected"),
    ("P0507", "Idle Control System RPM Higher Than Expected"),
    ("P0600", "Serial Communication Link Malfunction"),
    ("P0700", "Transmission Control System Malfunction"),
    ("P0705", "Transmission Range Sensor Circuit Malfunction (PRNDL Input)"),
    ("P0710", "Transmission Fluid Temperature Sensor Circuit Malfunction"),
];

/// Code descriptions: user overrides, then the built-in table, then a
/// generic text per system letter
#[derive(Debug, Clone, Default)]
pub struct DtcDatabase {
    custom: HashMap<String, String>,
}

impl DtcDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_custom_description(&mut self, code: impl Into<String>, description: impl Into<String>) {
        self.custom.insert(code.into(), description.into());
    }

    pub fn description(&self, code: &str) -> String {
        if let Some(custom) = self.custom.get(code) {
            return custom.clone();
        }
        if let Ok(index) = DESCRIPTIONS.binary_search_by_key(&code, |(c, _)| *c) {
            return DESCRIPTIONS[index].1.to_string();
        }
        match code.chars().next() {
            Some('P') => "Powertrain fault",
            Some('C') => "Chassis fault",
            Some('B') => "Body fault",
            Some('U') => "Network/communication fault",
            _ => "Unknown fault",
        }
        .to_string()
    }

    pub fn create(&self, code: &str, kind: DtcKind) -> Dtc {
        Dtc {
            code: code.to_string(),
            description: self.description(code),
            kind,
        }
    }

    pub fn parse_codes<S: AsRef<str>>(&self, codes: &[S], kind: DtcKind) -> Vec<Dtc> {
        codes.iter().map(|c| self.create(c.as_ref(), kind)).collect()
    }

    pub fn filter_by_kind(dtcs: &[Dtc], kind: DtcKind) -> Vec<&Dtc> {
        dtcs.iter().filter(|d| d.kind == kind).collect()
    }

    pub fn severity(&self, code: &str) -> Severity {
        Severity::of(code)
    }
}
