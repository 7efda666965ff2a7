//! OBD-II Protocol Implementation
//!
//! This crate talks to ELM327-compatible OBD-II adapters over a serial link:
//! prompt-framed command transport, AT configuration, OBD-II requests, raw
//! CAN frames, and decoding of PIDs and trouble codes.

pub mod can;
mod client;
pub mod config;
pub mod custom;
pub mod dtc;
pub mod ecu;
pub mod elm;
mod error;
pub mod formula;
pub mod mock;
pub mod obd2;
pub mod pid;
mod protocol;
pub mod registry;
pub mod transport;

pub use can::{parse_frames, CanBus, CanFrame};
pub use client::ObdClient;
pub use config::{AdapterSettings, ConnectionSettings, ObdConfig};
pub use dtc::{decode_dtc, encode_dtc, Dtc, DtcDatabase, DtcKind, Severity};
pub use ecu::{EcuDatabase, EcuInfo};
pub use elm::{AdapterInfo, AtCommands};
pub use error::{ObdError, ObdResult};
pub use formula::{Formula, FormulaError};
pub use mock::MockAdapter;
pub use obd2::{bitmap_to_pids, Obd2};
pub use pid::{common_pids, pid_by_name, standard_pid, DecodedReading, Pid, PidDefinition, PidValue};
pub use protocol::{ObdProtocol, ProtocolNumber};
pub use registry::PidRegistry;
pub use transport::{CancelHandle, Command, LinkEvent, Response, SerialLink, Transport};

/// OBD-II mode constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Freeze frame data
    pub const FREEZE_FRAME: u8 = 0x02;
    /// Diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// Vehicle information
    pub const VEHICLE_INFO: u8 = 0x09;
    /// Permanent trouble codes
    pub const PERMANENT_DTC: u8 = 0x0A;
}
