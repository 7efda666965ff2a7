//! OBD-II Protocol Definitions

use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bus protocols selectable with `ATSP<code>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ObdProtocol {
    /// Automatic protocol detection
    #[default]
    Auto,
    /// SAE J1850 PWM (41.6 kbaud)
    J1850Pwm,
    /// SAE J1850 VPW (10.4 kbaud)
    J1850Vpw,
    /// ISO 9141-2 (5 baud init)
    Iso9141_2,
    /// ISO 14230-4 KWP (5 baud init)
    Iso14230_4Kwp,
    /// ISO 14230-4 KWP (fast init)
    Iso14230_4KwpFast,
    /// ISO 15765-4 CAN (11 bit ID, 500 kbaud)
    Iso15765_4Can11bit500,
    /// ISO 15765-4 CAN (29 bit ID, 500 kbaud)
    Iso15765_4Can29bit500,
    /// ISO 15765-4 CAN (11 bit ID, 250 kbaud)
    Iso15765_4Can11bit250,
    /// ISO 15765-4 CAN (29 bit ID, 250 kbaud)
    Iso15765_4Can29bit250,
    /// SAE J1939 CAN (29 bit ID, 250 kbaud)
    SaeJ1939Can29bit250,
    /// User1 CAN (11 bit ID, 125 kbaud)
    User1Can11bit125,
    /// User2 CAN (11 bit ID, 50 kbaud)
    User2Can11bit50,
}

impl ObdProtocol {
    /// Every protocol, in code order
    pub const ALL: [ObdProtocol; 13] = [
        ObdProtocol::Auto,
        ObdProtocol::J1850Pwm,
        ObdProtocol::J1850Vpw,
        ObdProtocol::Iso9141_2,
        ObdProtocol::Iso14230_4Kwp,
        ObdProtocol::Iso14230_4KwpFast,
        ObdProtocol::Iso15765_4Can11bit500,
        ObdProtocol::Iso15765_4Can29bit500,
        ObdProtocol::Iso15765_4Can11bit250,
        ObdProtocol::Iso15765_4Can29bit250,
        ObdProtocol::SaeJ1939Can29bit250,
        ObdProtocol::User1Can11bit125,
        ObdProtocol::User2Can11bit50,
    ];

    /// Single-character code used by `ATSP` and reported by `ATDPN`
    pub fn code(&self) -> char {
        match self {
            ObdProtocol::Auto => '0',
            ObdProtocol::J1850Pwm => '1',
            ObdProtocol::J1850Vpw => '2',
            ObdProtocol::Iso9141_2 => '3',
            ObdProtocol::Iso14230_4Kwp => '4',
            ObdProtocol::Iso14230_4KwpFast => '5',
            ObdProtocol::Iso15765_4Can11bit500 => '6',
            ObdProtocol::Iso15765_4Can29bit500 => '7',
            ObdProtocol::Iso15765_4Can11bit250 => '8',
            ObdProtocol::Iso15765_4Can29bit250 => '9',
            ObdProtocol::SaeJ1939Can29bit250 => 'A',
            ObdProtocol::User1Can11bit125 => 'B',
            ObdProtocol::User2Can11bit50 => 'C',
        }
    }

    /// Parse a protocol code; case-insensitive
    pub fn from_code(code: char) -> Result<Self, ObdError> {
        let upper = code.to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.code() == upper)
            .ok_or_else(|| ObdError::UnsupportedProtocol(format!("unknown protocol code '{code}'")))
    }

    /// Get the ELM327 AT command for this protocol
    pub fn to_elm_command(&self) -> String {
        format!("ATSP{}", self.code())
    }

    /// Human readable name
    pub fn description(&self) -> &'static str {
        match self {
            ObdProtocol::Auto => "Automatic",
            ObdProtocol::J1850Pwm => "SAE J1850 PWM (41.6 kbaud)",
            ObdProtocol::J1850Vpw => "SAE J1850 VPW (10.4 kbaud)",
            ObdProtocol::Iso9141_2 => "ISO 9141-2 (5 baud init)",
            ObdProtocol::Iso14230_4Kwp => "ISO 14230-4 KWP (5 baud init)",
            ObdProtocol::Iso14230_4KwpFast => "ISO 14230-4 KWP (fast init)",
            ObdProtocol::Iso15765_4Can11bit500 => "ISO 15765-4 CAN (11 bit ID, 500 kbaud)",
            ObdProtocol::Iso15765_4Can29bit500 => "ISO 15765-4 CAN (29 bit ID, 500 kbaud)",
            ObdProtocol::Iso15765_4Can11bit250 => "ISO 15765-4 CAN (11 bit ID, 250 kbaud)",
            ObdProtocol::Iso15765_4Can29bit250 => "ISO 15765-4 CAN (29 bit ID, 250 kbaud)",
            ObdProtocol::SaeJ1939Can29bit250 => "SAE J1939 CAN (29 bit ID, 250 kbaud)",
            ObdProtocol::User1Can11bit125 => "User1 CAN (11 bit ID, 125 kbaud)",
            ObdProtocol::User2Can11bit50 => "User2 CAN (11 bit ID, 50 kbaud)",
        }
    }

    /// Check if this is a CAN protocol
    pub fn is_can(&self) -> bool {
        matches!(
            self,
            ObdProtocol::Iso15765_4Can11bit500
                | ObdProtocol::Iso15765_4Can29bit500
                | ObdProtocol::Iso15765_4Can11bit250
                | ObdProtocol::Iso15765_4Can29bit250
                | ObdProtocol::SaeJ1939Can29bit250
                | ObdProtocol::User1Can11bit125
                | ObdProtocol::User2Can11bit50
        )
    }
}

impl fmt::Display for ObdProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl TryFrom<String> for ObdProtocol {
    type Error = ObdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let mut chars = value.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(code), None) => ObdProtocol::from_code(code),
            _ => Err(ObdError::UnsupportedProtocol(format!(
                "protocol code must be one character, got '{value}'"
            ))),
        }
    }
}

impl From<ObdProtocol> for String {
    fn from(protocol: ObdProtocol) -> Self {
        protocol.code().to_string()
    }
}

/// Parsed `ATDPN` reply: an `A` prefix means the protocol was auto-detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolNumber {
    pub automatic: bool,
    pub protocol: ObdProtocol,
}

impl ProtocolNumber {
    /// Parse replies such as `A6`, `6` or `A`
    pub fn parse(reply: &str) -> Result<Self, ObdError> {
        let reply = reply.trim().to_ascii_uppercase();
        let (automatic, rest) = match reply.strip_prefix('A') {
            // a bare "A" is protocol A, not an auto flag
            Some(rest) if !rest.is_empty() => (true, rest),
            _ => (false, reply.as_str()),
        };
        let mut chars = rest.chars();
        match (chars.next(), chars.next()) {
            (Some(code), None) => Ok(Self {
                automatic,
                protocol: ObdProtocol::from_code(code)?,
            }),
            _ => Err(ObdError::InvalidResponse(format!(
                "unexpected protocol number: {reply}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for protocol in ObdProtocol::ALL {
            assert_eq!(ObdProtocol::from_code(protocol.code()).unwrap(), protocol);
        }
        assert_eq!(ObdProtocol::from_code('a').unwrap(), ObdProtocol::SaeJ1939Can29bit250);
    }

    #[test]
    fn test_invalid_code_rejected() {
        assert!(matches!(
            ObdProtocol::from_code('D'),
            Err(ObdError::UnsupportedProtocol(_))
        ));
        assert!(ObdProtocol::try_from("12".to_string()).is_err());
    }

    #[test]
    fn test_elm_command() {
        assert_eq!(ObdProtocol::Auto.to_elm_command(), "ATSP0");
        assert_eq!(ObdProtocol::User2Can11bit50.to_elm_command(), "ATSPC");
        assert!(ObdProtocol::Iso15765_4Can29bit250.is_can());
        assert!(!ObdProtocol::Iso9141_2.is_can());
    }

    #[test]
    fn test_protocol_number() {
        let number = ProtocolNumber::parse("A6").unwrap();
        assert!(number.automatic);
        assert_eq!(number.protocol, ObdProtocol::Iso15765_4Can11bit500);

        let number = ProtocolNumber::parse("A").unwrap();
        assert!(!number.automatic);
        assert_eq!(number.protocol, ObdProtocol::SaeJ1939Can29bit250);

        assert!(ProtocolNumber::parse("?").is_err());
    }

    #[test]
    fn test_serde_as_code() {
        let json = serde_json::to_string(&ObdProtocol::Iso15765_4Can11bit500).unwrap();
        assert_eq!(json, "\"6\"");
        let parsed: ObdProtocol = serde_json::from_str("\"b\"").unwrap();
        assert_eq!(parsed, ObdProtocol::User1Can11bit125);
    }
}
