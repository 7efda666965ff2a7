//! ELM327 AT command layer

use crate::config::AdapterSettings;
use crate::error::{ObdError, ObdResult};
use crate::protocol::{ObdProtocol, ProtocolNumber};
use crate::transport::{Command, Response, Transport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// `ATZ` reboots the adapter; it prints its banner after about a second
const RESET_SETTLE: Duration = Duration::from_millis(1500);
const WARM_START_SETTLE: Duration = Duration::from_secs(1);

/// What initialization learned about the adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// Reset banner, e.g. `ELM327 v1.5`
    pub version: String,
    /// `ATDP` description of the active protocol
    pub protocol: String,
    /// Last voltage reading
    pub voltage: Option<f64>,
}

/// Parse `ATRV` output such as `12.6V`
pub fn parse_voltage(reply: &str) -> ObdResult<f64> {
    let trimmed = reply.trim();
    let number = trimmed
        .strip_suffix(['V', 'v'])
        .unwrap_or(trimmed)
        .trim();
    number
        .parse::<f64>()
        .map_err(|_| ObdError::InvalidResponse(format!("unexpected voltage reply: {trimmed:?}")))
}

/// Whether a configuration command was accepted
///
/// Some adapters leave the echo on the same line (`ATE0 OK`, `ATE0OK`), so
/// any line containing `OK` counts.
pub fn is_acknowledged(response: &Response) -> bool {
    response
        .lines()
        .iter()
        .any(|line| line.to_ascii_uppercase().contains("OK"))
}

/// `ATST` argument: the adapter counts in 4 ms steps, up to 0xFF
pub fn timeout_code(timeout_ms: u32) -> u8 {
    (timeout_ms / 4).min(255) as u8
}

/// Borrowing view over a transport for `AT` commands
#[derive(Debug, Clone, Copy)]
pub struct AtCommands<'a> {
    transport: &'a Transport,
}

impl<'a> AtCommands<'a> {
    pub fn new(transport: &'a Transport) -> Self {
        Self { transport }
    }

    /// Reset and configure the adapter
    pub async fn initialize(&self, settings: &AdapterSettings) -> ObdResult<AdapterInfo> {
        info!("Initializing ELM327 on {}", self.transport.port());

        let version = self.reset().await?;
        if !version.to_ascii_uppercase().contains("ELM327") {
            return Err(ObdError::Protocol(format!(
                "invalid reset response: {version:?}"
            )));
        }

        self.set_echo(settings.echo).await?;
        self.set_protocol(settings.protocol).await?;
        self.set_headers(settings.headers).await?;
        self.set_spaces(settings.spaces).await?;

        let voltage = match self.voltage().await {
            Ok(voltage) => voltage,
            Err(ObdError::InvalidResponse(reason)) => {
                return Err(ObdError::Protocol(format!("initialization failed: {reason}")))
            }
            Err(e) => return Err(e),
        };
        let protocol = self.describe_protocol().await?;

        info!("Adapter {} ready, {} at {:.1}V", version, protocol, voltage);
        Ok(AdapterInfo {
            version,
            protocol,
            voltage: Some(voltage),
        })
    }

    /// `ATZ`; returns the banner
    pub async fn reset(&self) -> ObdResult<String> {
        let response = self
            .transport
            .exchange(&Command::new("ATZ").with_settle(RESET_SETTLE))
            .await?;
        Ok(response.text())
    }

    /// `ATI`
    pub async fn version(&self) -> ObdResult<String> {
        Ok(self.transport.send("ATI").await?.text())
    }

    pub async fn set_echo(&self, enabled: bool) -> ObdResult<()> {
        self.configure(if enabled { "ATE1" } else { "ATE0" }).await
    }

    pub async fn set_protocol(&self, protocol: ObdProtocol) -> ObdResult<()> {
        self.configure(&protocol.to_elm_command()).await
    }

    /// Select a protocol by its `ATSP` code; unknown codes never reach the
    /// adapter
    pub async fn set_protocol_code(&self, code: char) -> ObdResult<()> {
        self.set_protocol(ObdProtocol::from_code(code)?).await
    }

    /// `ATDP`
    pub async fn describe_protocol(&self) -> ObdResult<String> {
        Ok(self.transport.send("ATDP").await?.text())
    }

    /// `ATDPN`
    pub async fn describe_protocol_number(&self) -> ObdResult<ProtocolNumber> {
        let response = self.transport.send("ATDPN").await?;
        ProtocolNumber::parse(&response.text())
    }

    pub async fn set_headers(&self, enabled: bool) -> ObdResult<()> {
        self.configure(if enabled { "ATH1" } else { "ATH0" }).await
    }

    pub async fn set_spaces(&self, enabled: bool) -> ObdResult<()> {
        self.configure(if enabled { "ATS1" } else { "ATS0" }).await
    }

    /// `ATRV`, in volts
    pub async fn voltage(&self) -> ObdResult<f64> {
        let response = self.transport.send("ATRV").await?;
        parse_voltage(&response.text())
    }

    /// `ATST`: how long the adapter waits for the vehicle
    pub async fn set_timeout(&self, timeout_ms: u32) -> ObdResult<()> {
        self.configure(&format!("ATST{:02X}", timeout_code(timeout_ms)))
            .await
    }

    /// `ATAT0` off, `ATAT1` normal, `ATAT2` aggressive
    pub async fn set_adaptive_timing(&self, mode: u8) -> ObdResult<()> {
        if mode > 2 {
            return Err(ObdError::InvalidArgument(format!(
                "adaptive timing mode must be 0, 1 or 2, got {mode}"
            )));
        }
        self.configure(&format!("ATAT{mode}")).await
    }

    /// `ATPC`
    pub async fn close_protocol(&self) -> ObdResult<()> {
        self.configure("ATPC").await
    }

    /// `ATWS`: reboot keeping user settings; returns the banner
    pub async fn warm_start(&self) -> ObdResult<String> {
        let response = self
            .transport
            .exchange(&Command::new("ATWS").with_settle(WARM_START_SETTLE))
            .await?;
        Ok(response.text())
    }

    /// `ATCF`: 3 hex digits for 11-bit ids, 8 for 29-bit
    pub async fn set_can_filter(&self, id: u32, extended: bool) -> ObdResult<()> {
        self.configure(&format!("ATCF{}", format_can_id(id, extended)))
            .await
    }

    /// `ATCM`
    pub async fn set_can_mask(&self, mask: u32, extended: bool) -> ObdResult<()> {
        self.configure(&format!("ATCM{}", format_can_id(mask, extended)))
            .await
    }

    /// Send anything; no acknowledgement check
    pub async fn raw(&self, command: &str, settle: Duration) -> ObdResult<Response> {
        self.transport
            .exchange(&Command::new(command).with_settle(settle))
            .await
    }

    async fn configure(&self, command: &str) -> ObdResult<()> {
        let response = self.transport.send(command).await?;
        if is_acknowledged(&response) {
            debug!("{} acknowledged", command);
            Ok(())
        } else {
            warn!("{} not acknowledged: {:?}", command, response.lines());
            Err(ObdError::Protocol(format!(
                "{command} not acknowledged: {:?}",
                response.text()
            )))
        }
    }
}

pub(crate) fn format_can_id(id: u32, extended: bool) -> String {
    if extended {
        format!("{id:08X}")
    } else {
        format!("{id:03X}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    fn transport(adapter: MockAdapter) -> Transport {
        Transport::from_link("mock", adapter.spawn(), Duration::from_secs(1))
    }

    #[test]
    fn test_parse_voltage() {
        assert_eq!(parse_voltage("12.6V").unwrap(), 12.6);
        assert_eq!(parse_voltage(" 13.1 v ").unwrap(), 13.1);
        assert_eq!(parse_voltage("14").unwrap(), 14.0);
        assert!(matches!(parse_voltage("?"), Err(ObdError::InvalidResponse(_))));
    }

    #[test]
    fn test_acknowledgement() {
        assert!(is_acknowledged(&Response::from_lines([" ok "])));
        assert!(is_acknowledged(&Response::from_lines(["ATE0 OK"])));
        assert!(is_acknowledged(&Response::from_lines(["ATE0OK"])));
        assert!(!is_acknowledged(&Response::from_lines(["?"])));
        assert!(!is_acknowledged(&Response::default()));
    }

    #[test]
    fn test_timeout_code() {
        assert_eq!(timeout_code(200), 0x32);
        assert_eq!(timeout_code(5000), 0xFF);
        assert_eq!(timeout_code(0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_against_mock() {
        let transport = transport(MockAdapter::new());
        let info = AtCommands::new(&transport)
            .initialize(&AdapterSettings::default())
            .await
            .unwrap();

        assert_eq!(info.version, "ELM327 v1.5");
        assert_eq!(info.voltage, Some(12.6));
        assert_eq!(info.protocol, "AUTO, ISO 15765-4 (CAN 11/500)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_rejects_non_elm_banner() {
        let transport = transport(MockAdapter::new().with_response("ATZ", "OBDLink"));
        let err = AtCommands::new(&transport)
            .initialize(&AdapterSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_requires_ok() {
        let transport = transport(MockAdapter::new().with_response("ATSP0", "?"));
        let err = AtCommands::new(&transport)
            .initialize(&AdapterSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_malformed_voltage_is_protocol_error() {
        let transport = transport(MockAdapter::new().with_response("ATRV", "N/A"));
        let err = AtCommands::new(&transport)
            .initialize(&AdapterSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_timeout_propagates() {
        let transport = transport(MockAdapter::new().silent_on("ATE0"));
        let err = AtCommands::new(&transport)
            .initialize(&AdapterSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::Timeout { ref command, .. } if command == "ATE0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_number_and_filters() {
        let transport = transport(MockAdapter::new());
        let at = AtCommands::new(&transport);

        let number = at.describe_protocol_number().await.unwrap();
        assert!(number.automatic);
        assert_eq!(number.protocol, ObdProtocol::Iso15765_4Can11bit500);

        at.set_can_filter(0x7E8, false).await.unwrap();
        at.set_can_mask(0x1FFFFFFF, true).await.unwrap();
        at.set_timeout(200).await.unwrap();
        at.set_adaptive_timing(1).await.unwrap();
        assert!(matches!(
            at.set_adaptive_timing(3).await,
            Err(ObdError::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_protocol_code_not_sent() {
        let transport = transport(MockAdapter::new());
        let err = AtCommands::new(&transport)
            .set_protocol_code('Z')
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::UnsupportedProtocol(_)));
    }
}
