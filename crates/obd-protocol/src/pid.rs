//! OBD-II PID Definitions and Decoded Values
//!
//! Defines the standard Mode 01 Parameter IDs (PIDs), their decoding formulas
//! and the value types produced by the decode engine.

use crate::formula::Formula;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Frequently used Mode 01 PIDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Intake air temperature (0x0F)
    IntakeTemp = 0x0F,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Mass air flow rate (0x10)
    Maf = 0x10,
    /// Fuel tank level (0x2F)
    FuelLevel = 0x2F,
    /// Intake manifold absolute pressure (0x0B)
    IntakeManifoldPressure = 0x0B,
}

impl Pid {
    /// Quick-access set, in display order
    pub const COMMON: [Pid; 9] = [
        Pid::Rpm,
        Pid::Speed,
        Pid::CoolantTemp,
        Pid::IntakeTemp,
        Pid::ThrottlePosition,
        Pid::EngineLoad,
        Pid::Maf,
        Pid::FuelLevel,
        Pid::IntakeManifoldPressure,
    ];

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Get the sampling priority (higher = more frequent)
    pub fn sampling_priority(&self) -> u8 {
        match self {
            Pid::Rpm | Pid::Speed | Pid::ThrottlePosition | Pid::EngineLoad => 10,
            Pid::CoolantTemp | Pid::IntakeTemp | Pid::Maf => 5,
            _ => 2,
        }
    }
}

/// PIDs for quick access, as raw numbers
pub fn common_pids() -> Vec<u8> {
    Pid::COMMON.iter().map(Pid::as_hex).collect()
}

/// Decoded PID value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PidValue {
    Integer(i64),
    Float(f64),
    /// Bitmaps and undecodable data, as space separated hex
    Text(String),
}

impl PidValue {
    /// Numeric view, `None` for text
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PidValue::Integer(i) => Some(*i as f64),
            PidValue::Float(f) => Some(*f),
            PidValue::Text(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, PidValue::Text(_))
    }
}

impl fmt::Display for PidValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PidValue::Integer(i) => write!(f, "{i}"),
            PidValue::Float(x) => write!(f, "{x:?}"),
            PidValue::Text(s) => f.write_str(s),
        }
    }
}

/// Render bytes as `"BE 1F A8 13"`
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex rendering used whenever a decoder cannot produce a number
pub fn hex_string(bytes: &[u8]) -> PidValue {
    PidValue::Text(format_hex(bytes))
}

/// How a definition turns data bytes into a value
#[derive(Clone)]
pub enum Decoder {
    /// Built-in decoder; `None` when the reply is too short
    Standard(fn(&[u8]) -> Option<PidValue>),
    /// Compiled custom formula
    Formula(Formula),
}

impl Decoder {
    pub fn decode(&self, bytes: &[u8]) -> PidValue {
        match self {
            Decoder::Standard(decode) => decode(bytes).unwrap_or_else(|| hex_string(bytes)),
            Decoder::Formula(formula) => formula.decode(bytes),
        }
    }

    /// Formula source, if this is a custom decoder
    pub fn formula(&self) -> Option<&Formula> {
        match self {
            Decoder::Standard(_) => None,
            Decoder::Formula(formula) => Some(formula),
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decoder::Standard(_) => f.write_str("Standard"),
            Decoder::Formula(formula) => f.debug_tuple("Formula").field(&formula.source()).finish(),
        }
    }
}

/// A PID the decode engine knows about
#[derive(Debug, Clone)]
pub struct PidDefinition {
    pub mode: u8,
    pub pid: u8,
    pub name: Cow<'static, str>,
    pub description: Cow<'static, str>,
    pub unit: Cow<'static, str>,
    /// Expected number of data bytes
    pub num_bytes: usize,
    /// Gauge range
    pub min_val: f64,
    pub max_val: f64,
    pub decoder: Decoder,
}

impl PidDefinition {
    /// Custom definition backed by a compiled formula
    #[allow(clippy::too_many_arguments)]
    pub fn custom(
        mode: u8,
        pid: u8,
        name: impl Into<String>,
        description: impl Into<String>,
        unit: impl Into<String>,
        formula: Formula,
        min_val: f64,
        max_val: f64,
    ) -> Self {
        Self {
            mode,
            pid,
            name: Cow::Owned(name.into()),
            description: Cow::Owned(description.into()),
            unit: Cow::Owned(unit.into()),
            num_bytes: formula.num_bytes(),
            min_val,
            max_val,
            decoder: Decoder::Formula(formula),
        }
    }

    /// (mode, pid) lookup key
    pub fn key(&self) -> (u8, u8) {
        (self.mode, self.pid)
    }

    pub fn decode(&self, bytes: &[u8]) -> PidValue {
        self.decoder.decode(bytes)
    }
}

/// One decoded answer from the vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedReading {
    pub mode: u8,
    pub pid: u8,
    pub value: PidValue,
    /// Data bytes after the mode/PID echo
    pub raw_bytes: Vec<u8>,
    /// Timestamp when the response was received (Unix ms)
    pub timestamp_ms: u64,
}

impl DecodedReading {
    pub fn new(mode: u8, pid: u8, value: PidValue, raw_bytes: Vec<u8>) -> Self {
        Self {
            mode,
            pid,
            value,
            raw_bytes,
            timestamp_ms: now_ms(),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn a(bytes: &[u8]) -> Option<i64> {
    bytes.first().map(|b| i64::from(*b))
}

fn ab(bytes: &[u8]) -> Option<i64> {
    match bytes {
        [a, b, ..] => Some(i64::from(*a) * 256 + i64::from(*b)),
        _ => None,
    }
}

fn decode_bitmap(bytes: &[u8]) -> Option<PidValue> {
    Some(hex_string(bytes))
}

fn decode_percent(bytes: &[u8]) -> Option<PidValue> {
    a(bytes).map(|a| PidValue::Float(a as f64 * 100.0 / 255.0))
}

fn decode_temp(bytes: &[u8]) -> Option<PidValue> {
    a(bytes).map(|a| PidValue::Integer(a - 40))
}

fn decode_fuel_trim(bytes: &[u8]) -> Option<PidValue> {
    a(bytes).map(|a| PidValue::Float((a - 128) as f64 * 100.0 / 128.0))
}

fn decode_fuel_pressure(bytes: &[u8]) -> Option<PidValue> {
    a(bytes).map(|a| PidValue::Integer(a * 3))
}

fn decode_byte(bytes: &[u8]) -> Option<PidValue> {
    a(bytes).map(PidValue::Integer)
}

fn decode_rpm(bytes: &[u8]) -> Option<PidValue> {
    ab(bytes).map(|v| PidValue::Float(v as f64 / 4.0))
}

fn decode_timing_advance(bytes: &[u8]) -> Option<PidValue> {
    a(bytes).map(|a| PidValue::Float((a - 128) as f64 / 2.0))
}

fn decode_maf(bytes: &[u8]) -> Option<PidValue> {
    ab(bytes).map(|v| PidValue::Float(v as f64 / 100.0))
}

fn decode_o2_voltage(bytes: &[u8]) -> Option<PidValue> {
    a(bytes).map(|a| PidValue::Float(a as f64 / 200.0))
}

fn decode_word(bytes: &[u8]) -> Option<PidValue> {
    ab(bytes).map(PidValue::Integer)
}

fn decode_module_voltage(bytes: &[u8]) -> Option<PidValue> {
    ab(bytes).map(|v| PidValue::Float(v as f64 / 1000.0))
}

fn decode_absolute_load(bytes: &[u8]) -> Option<PidValue> {
    ab(bytes).map(|v| PidValue::Float(v as f64 * 100.0 / 255.0))
}

fn decode_equiv_ratio(bytes: &[u8]) -> Option<PidValue> {
    ab(bytes).map(|v| PidValue::Float(v as f64 / 32768.0))
}

#[allow(clippy::too_many_arguments)]
const fn standard(
    pid: u8,
    name: &'static str,
    description: &'static str,
    unit: &'static str,
    num_bytes: usize,
    min_val: f64,
    max_val: f64,
    decode: fn(&[u8]) -> Option<PidValue>,
) -> PidDefinition {
    PidDefinition {
        mode: 0x01,
        pid,
        name: Cow::Borrowed(name),
        description: Cow::Borrowed(description),
        unit: Cow::Borrowed(unit),
        num_bytes,
        min_val,
        max_val,
        decoder: Decoder::Standard(decode),
    }
}

/// Standard Mode 01 PIDs, ordered by PID
static STANDARD_PIDS: [PidDefinition; 31] = [
    standard(0x00, "PIDs_supported", "PIDs supported [01-20]", "", 4, 0.0, 100.0, decode_bitmap),
    standard(0x01, "Monitor_status", "Monitor status since DTCs cleared", "", 4, 0.0, 100.0, decode_bitmap),
    standard(0x03, "Fuel_system_status", "Fuel system status", "", 2, 0.0, 100.0, decode_bitmap),
    standard(0x04, "Engine_load", "Calculated engine load", "%", 1, 0.0, 100.0, decode_percent),
    standard(0x05, "Coolant_temp", "Engine coolant temperature", "°C", 1, -40.0, 215.0, decode_temp),
    standard(0x06, "Short_fuel_trim_1", "Short term fuel trim - Bank 1", "%", 1, -100.0, 99.2, decode_fuel_trim),
    standard(0x07, "Long_fuel_trim_1", "Long term fuel trim - Bank 1", "%", 1, -100.0, 99.2, decode_fuel_trim),
    standard(0x08, "Short_fuel_trim_2", "Short term fuel trim - Bank 2", "%", 1, -100.0, 99.2, decode_fuel_trim),
    standard(0x09, "Long_fuel_trim_2", "Long term fuel trim - Bank 2", "%", 1, -100.0, 99.2, decode_fuel_trim),
    standard(0x0A, "Fuel_pressure", "Fuel pressure", "kPa", 1, 0.0, 765.0, decode_fuel_pressure),
    standard(0x0B, "Intake_pressure", "Intake manifold absolute pressure", "kPa", 1, 0.0, 255.0, decode_byte),
    standard(0x0C, "Engine_RPM", "Engine RPM", "RPM", 2, 0.0, 16383.0, decode_rpm),
    standard(0x0D, "Vehicle_speed", "Vehicle speed", "km/h", 1, 0.0, 255.0, decode_byte),
    standard(0x0E, "Timing_advance", "Timing advance", "° before TDC", 1, -64.0, 63.5, decode_timing_advance),
    standard(0x0F, "Intake_temp", "Intake air temperature", "°C", 1, -40.0, 215.0, decode_temp),
    standard(0x10, "MAF_flow", "Mass air flow rate", "g/s", 2, 0.0, 655.35, decode_maf),
    standard(0x11, "Throttle_position", "Throttle position", "%", 1, 0.0, 100.0, decode_percent),
    standard(0x14, "O2_voltage_B1S1", "Oxygen sensor voltage - Bank 1, Sensor 1", "V", 2, 0.0, 1.275, decode_o2_voltage),
    standard(0x1F, "Runtime", "Run time since engine start", "s", 2, 0.0, 65535.0, decode_word),
    standard(0x21, "Distance_with_MIL", "Distance traveled with MIL on", "km", 2, 0.0, 65535.0, decode_word),
    standard(0x2F, "Fuel_level", "Fuel tank level input", "%", 1, 0.0, 100.0, decode_percent),
    standard(0x33, "Barometric_pressure", "Absolute barometric pressure", "kPa", 1, 0.0, 255.0, decode_byte),
    standard(0x42, "Control_module_voltage", "Control module voltage", "V", 2, 0.0, 65.535, decode_module_voltage),
    standard(0x43, "Absolute_load", "Absolute load value", "%", 2, 0.0, 25700.0, decode_absolute_load),
    standard(0x44, "Commanded_equiv_ratio", "Commanded equivalence ratio", "", 2, 0.0, 2.0, decode_equiv_ratio),
    standard(0x45, "Relative_throttle", "Relative throttle position", "%", 1, 0.0, 100.0, decode_percent),
    standard(0x46, "Ambient_temp", "Ambient air temperature", "°C", 1, -40.0, 215.0, decode_temp),
    standard(0x49, "Accelerator_pedal_D", "Accelerator pedal position D", "%", 1, 0.0, 100.0, decode_percent),
    standard(0x4C, "Commanded_throttle", "Commanded throttle actuator", "%", 1, 0.0, 100.0, decode_percent),
    standard(0x51, "Fuel_type", "Fuel type", "", 1, 0.0, 100.0, decode_byte),
    standard(0x5C, "Engine_oil_temp", "Engine oil temperature", "°C", 1, -40.0, 215.0, decode_temp),
];

/// All standard definitions
pub fn standard_pids() -> &'static [PidDefinition] {
    &STANDARD_PIDS
}

/// Standard Mode 01 definition for `pid`
pub fn standard_pid(pid: u8) -> Option<&'static PidDefinition> {
    STANDARD_PIDS
        .binary_search_by_key(&pid, |def| def.pid)
        .ok()
        .map(|index| &STANDARD_PIDS[index])
}

/// Standard definition by its name, e.g. `"Engine_RPM"`
pub fn pid_by_name(name: &str) -> Option<&'static PidDefinition> {
    STANDARD_PIDS.iter().find(|def| def.name == name)
}
