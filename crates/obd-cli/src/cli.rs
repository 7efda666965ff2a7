//! Command-line arguments

use clap::{ArgAction, Parser, Subcommand};
use obd_protocol::pid::standard_pids;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "obd-diag", version)]
#[command(about = "Diagnostics over ELM327-compatible OBD-II adapters")]
pub struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serial port, e.g. /dev/ttyUSB0 or COM3
    #[arg(short, long)]
    pub port: Option<String>,

    /// Baud rate (9600, 38400, 57600 or 115200)
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Protocol code: 0 for automatic, 1-9 or A-C
    #[arg(long)]
    pub protocol: Option<char>,

    /// JSON file with custom PID definitions
    #[arg(long)]
    pub custom_pids: Option<PathBuf>,

    /// Use the built-in adapter emulator instead of a serial port
    #[arg(long)]
    pub mock: bool,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Adapter version, protocol and supply voltage
    Info,

    /// Read PIDs by hex number (0C) or name (Engine_RPM)
    Read {
        /// OBD-II mode
        #[arg(short, long, default_value = "01", value_parser = parse_hex_u8)]
        mode: u8,

        #[arg(required = true, value_parser = parse_pid)]
        pids: Vec<u8>,
    },

    /// Read diagnostic trouble codes
    Dtc {
        /// Include pending and permanent codes
        #[arg(short, long)]
        all: bool,
    },

    /// Clear trouble codes and turn off the MIL
    ClearDtc {
        /// Confirm; freeze frames and readiness monitors are lost too
        #[arg(long)]
        yes: bool,
    },

    /// List supported Mode 01 PIDs
    Supported,

    /// Read the vehicle identification number
    Vin,

    /// Print CAN frames seen on the bus
    Monitor {
        /// How long to listen (milliseconds)
        #[arg(short, long, default_value = "2000")]
        duration_ms: u64,
    },

    /// Find ECUs answering on the bus
    Ecus,

    /// Stream live data until interrupted
    Watch {
        /// PIDs to poll; the configured defaults when empty
        #[arg(value_parser = parse_pid)]
        pids: Vec<u8>,

        /// Sampling rate in Hz
        #[arg(short, long)]
        rate: Option<f64>,

        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },

    /// Send one raw CAN frame
    Send {
        /// Arbitration id in hex
        #[arg(value_parser = parse_hex_u32)]
        id: u32,

        /// Data bytes in hex, e.g. "02 01 0C"
        #[arg(required = true)]
        data: Vec<String>,

        /// 29-bit identifier
        #[arg(short, long)]
        extended: bool,
    },

    /// Send an AT or OBD command verbatim and print the reply
    Raw { command: String },

    /// List serial ports on this machine
    Ports,
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

pub fn parse_hex_u8(s: &str) -> Result<u8, String> {
    u8::from_str_radix(strip_hex_prefix(s), 16).map_err(|e| format!("invalid hex byte '{s}': {e}"))
}

pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    u32::from_str_radix(strip_hex_prefix(s), 16).map_err(|e| format!("invalid hex id '{s}': {e}"))
}

/// Hex PID or a standard PID name (case-insensitive)
pub fn parse_pid(s: &str) -> Result<u8, String> {
    parse_hex_u8(s).or_else(|_| {
        standard_pids()
            .iter()
            .find(|def| def.name.eq_ignore_ascii_case(s))
            .map(|def| def.pid)
            .ok_or_else(|| format!("unknown PID '{s}'"))
    })
}

/// Hex bytes, with or without spaces between them
pub fn parse_hex_bytes<S: AsRef<str>>(parts: &[S]) -> Result<Vec<u8>, String> {
    let digits: String = parts
        .iter()
        .flat_map(|part| part.as_ref().chars())
        .filter(|c| !c.is_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{digits}'"));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| parse_hex_u8(&digits[i..i + 2]))
        .collect()
}
