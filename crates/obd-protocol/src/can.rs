//! Raw CAN frames over the ELM327
//!
//! The adapter prints monitored frames as bare hex with no length field, so
//! the identifier width is inferred from the line length: exactly 11 digits
//! is a 3-digit (11-bit) id with four data bytes, 16 or more is an 8-digit
//! (29-bit) id. Lengths in between are ambiguous and dropped.

use crate::elm::{format_can_id, AtCommands};
use crate::error::{ObdError, ObdResult};
use crate::obd2::{classify, Reply};
use crate::pid::format_hex;
use crate::transport::{compact, Command, Response, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MAX_STANDARD_ID: u32 = 0x7FF;
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
pub const MAX_DATA_LEN: usize = 8;

/// Functional broadcast address for OBD-II requests
pub const BROADCAST_ID: u32 = 0x7DF;

/// Response ids of the eight OBD-II ECUs
pub const ECU_RESPONSE_IDS: std::ops::RangeInclusive<u32> = 0x7E8..=0x7EF;

const STANDARD_LINE_LEN: usize = 11;
const EXTENDED_LINE_LEN: usize = 16;
const MAX_UDS_DATA: usize = 6;
const UDS_REPLY_SETTLE: Duration = Duration::from_millis(500);
const ECU_DISCOVERY_WINDOW: Duration = Duration::from_secs(2);

/// Lines the monitor prints that are never frames
const NON_FRAME_LINES: [&str; 3] = ["SEARCHING...", "STOPPED", "NO DATA"];

/// A validated CAN frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFrame {
    id: u32,
    data: Vec<u8>,
    extended: bool,
}

impl CanFrame {
    pub fn new(id: u32, data: impl Into<Vec<u8>>, extended: bool) -> ObdResult<Self> {
        let data = data.into();
        let max_id = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
        if id > max_id {
            return Err(ObdError::InvalidFrame(format!(
                "id 0x{id:X} exceeds 0x{max_id:X}"
            )));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(ObdError::InvalidFrame(format!(
                "{} data bytes, at most {MAX_DATA_LEN} allowed",
                data.len()
            )));
        }
        Ok(Self { id, data, extended })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Id and data as the adapter expects them, e.g. `7DF023E00`
    pub fn to_command(&self) -> String {
        let mut command = format_can_id(self.id, self.extended);
        for byte in &self.data {
            command.push_str(&format!("{byte:02X}"));
        }
        command
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID: {}, Data: {}",
            format_can_id(self.id, self.extended),
            format_hex(&self.data)
        )
    }
}

fn parse_line(line: &str) -> Option<CanFrame> {
    let trimmed = line.trim();
    if trimmed.is_empty() || NON_FRAME_LINES.iter().any(|l| trimmed.eq_ignore_ascii_case(l)) {
        return None;
    }

    let hex = compact(trimmed);
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let (id_len, extended) = match hex.len() {
        STANDARD_LINE_LEN => (3, false),
        n if n >= EXTENDED_LINE_LEN => (8, true),
        _ => return None,
    };

    let id = u32::from_str_radix(&hex[..id_len], 16).ok()?;
    let data = hex[id_len..]
        .as_bytes()
        .chunks_exact(2)
        .map(|pair| std::str::from_utf8(pair).ok().and_then(|p| u8::from_str_radix(p, 16).ok()))
        .collect::<Option<Vec<u8>>>()?;
    if data.is_empty() {
        return None;
    }

    CanFrame::new(id, data, extended).ok()
}

/// Frames in monitor output; anything that is not a well formed frame is
/// skipped
pub fn parse_frames(text: &str) -> Vec<CanFrame> {
    text.lines()
        .flat_map(|line| line.split('\r'))
        .filter_map(parse_line)
        .collect()
}

/// Borrowing view over a transport for raw CAN work
#[derive(Debug, Clone, Copy)]
pub struct CanBus<'a> {
    transport: &'a Transport,
}

impl<'a> CanBus<'a> {
    pub fn new(transport: &'a Transport) -> Self {
        Self { transport }
    }

    fn at(&self) -> AtCommands<'a> {
        AtCommands::new(self.transport)
    }

    /// Put one frame on the bus
    pub async fn send_frame(&self, id: u32, data: &[u8], extended: bool) -> ObdResult<()> {
        let frame = CanFrame::new(id, data, extended)?;

        let priority = if extended { "ATCP18" } else { "ATCP00" };
        let response = self.transport.send(priority).await?;
        if !response.contains("OK") {
            debug!("{} answered {:?}", priority, response.lines());
        }

        let response = self.transport.send(&frame.to_command()).await?;
        if response.is_empty() || response.contains("OK") {
            debug!("Sent {}", frame);
            Ok(())
        } else {
            warn!("Frame {} rejected: {:?}", frame, response.lines());
            Err(ObdError::InvalidResponse(format!(
                "frame {} rejected: {}",
                frame.to_command(),
                response.text()
            )))
        }
    }

    /// First frame seen within `window`
    pub async fn receive_frame(&self, window: Duration) -> ObdResult<Option<CanFrame>> {
        Ok(self.monitor_bus(window).await?.into_iter().next())
    }

    /// `ATMA` for `duration`
    pub async fn monitor_bus(&self, duration: Duration) -> ObdResult<Vec<CanFrame>> {
        let response = self
            .transport
            .monitor(&Command::new("ATMA"), duration)
            .await?;
        match classify(&response) {
            Reply::NoData => Ok(Vec::new()),
            _ => {
                let frames = parse_frames(&response.text());
                debug!("Monitored {} frames in {:?}", frames.len(), duration);
                Ok(frames)
            }
        }
    }

    pub async fn set_can_filter(&self, id: u32, extended: bool) -> ObdResult<()> {
        self.at().set_can_filter(id, extended).await
    }

    pub async fn set_can_mask(&self, mask: u32, extended: bool) -> ObdResult<()> {
        self.at().set_can_mask(mask, extended).await
    }

    /// Accept every frame again
    pub async fn clear_can_filter(&self) -> ObdResult<()> {
        self.set_can_filter(0, false).await?;
        self.set_can_mask(0, false).await
    }

    /// Single-frame request `[len, service, data..]`, padded to 8 bytes;
    /// returns whatever the adapter collects afterwards
    pub async fn send_uds_request(&self, service: u8, data: &[u8], ecu_id: u32) -> ObdResult<Response> {
        if data.len() > MAX_UDS_DATA {
            return Err(ObdError::InvalidFrame(format!(
                "UDS single frame carries at most {MAX_UDS_DATA} data bytes, got {}",
                data.len()
            )));
        }

        let mut payload = Vec::with_capacity(MAX_DATA_LEN);
        payload.push(data.len() as u8 + 1);
        payload.push(service);
        payload.extend_from_slice(data);
        payload.resize(MAX_DATA_LEN, 0x00);

        self.send_frame(ecu_id, &payload, false).await?;
        self.transport
            .exchange(&Command::new("").with_settle(UDS_REPLY_SETTLE))
            .await
    }

    /// Broadcast tester-present and collect the OBD-II ECUs that answer,
    /// in the order first seen
    pub async fn detect_ecus(&self) -> ObdResult<Vec<u32>> {
        self.send_frame(BROADCAST_ID, &[0x02, 0x3E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00], false)
            .await?;

        let mut ecus = Vec::new();
        for frame in self.monitor_bus(ECU_DISCOVERY_WINDOW).await? {
            if ECU_RESPONSE_IDS.contains(&frame.id()) && !ecus.contains(&frame.id()) {
                ecus.push(frame.id());
            }
        }
        info!("Detected {} ECUs: {:03X?}", ecus.len(), ecus);
        Ok(ecus)
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
    fn test_frame_validation() {
        assert!(CanFrame::new(0x7FF, vec![0; 8], false).is_ok());
        assert!(matches!(CanFrame::new(0x800, vec![], false), Err(ObdError::InvalidFrame(_))));
        assert!(CanFrame::new(0x800, vec![], true).is_ok());
        assert!(CanFrame::new(0x2000_0000, vec![], true).is_err());
        assert!(CanFrame::new(0x7E8, vec![0; 9], false).is_err());
    }

    #[test]
    fn test_frame_formatting() {
        let frame = CanFrame::new(0x7DF, vec![0x02, 0x01, 0x0C], false).unwrap();
        assert_eq!(frame.to_command(), "7DF02010C");
        assert_eq!(frame.to_string(), "ID: 7DF, Data: 02 01 0C");

        let frame = CanFrame::new(0x18DA_F110, vec![0x02], true).unwrap();
        assert_eq!(frame.to_command(), "18DAF11002");
    }

    #[test]
    fn test_eleven_digits_is_standard() {
        let frames = parse_frames("7E8 02 7E 00 00");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), 0x7E8);
        assert!(!frames[0].is_extended());
        assert_eq!(frames[0].data(), &[0x02, 0x7E, 0x00, 0x00]);
    }

    #[test]
    fn test_sixteen_digits_is_extended() {
        let frames = parse_frames("18DAF110027E0000");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), 0x18DA_F110);
        assert!(frames[0].is_extended());
        assert_eq!(frames[0].data(), &[0x02, 0x7E, 0x00, 0x00]);
    }

    #[test]
    fn test_ambiguous_and_short_lines_dropped() {
        // 10 digits
        assert!(parse_frames("7E8027E000").is_empty());
        for line in ["7E8027E00001", "7E8027E000012", "7E8027E0000123", "7E8027E00001234"] {
            assert!(parse_frames(line).is_empty(), "{} digits", line.len());
        }
    }

    #[test]
    fn test_malformed_lines_dropped() {
        let text = "SEARCHING...\r\n7E8 02 7E 00 00\nSTOPPED\nNO DATA\n7E8 ZZ 7E 00 00\n\
                    FFFFFFFF0102030405060708090A\n7E802\n";
        let frames = parse_frames(text);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), 0x7E8);
    }

    #[test]
    fn test_odd_trailing_digit_ignored() {
        let frames = parse_frames("18DAF110027E00001");
        assert_eq!(frames[0].data(), &[0x02, 0x7E, 0x00, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_frame_validates_before_sending() {
        let transport = transport(MockAdapter::new());
        let err = CanBus::new(&transport)
            .send_frame(0x800, &[0x01], false)
            .await
            .unwrap_err();
        assert!(matches!(err, ObdError::InvalidFrame(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_and_detect_ecus() {
        let transport = transport(MockAdapter::new());
        let bus = CanBus::new(&transport);

        let frames = bus.monitor_bus(Duration::from_millis(500)).await.unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[2].is_extended());

        assert_eq!(bus.detect_ecus().await.unwrap(), vec![0x7E8, 0x7E9]);
        assert_eq!(bus.receive_frame(Duration::from_millis(100)).await.unwrap().unwrap().id(), 0x7E8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_bus() {
        let transport = transport(MockAdapter::new().with_bus_traffic(Vec::<String>::new()));
        let bus = CanBus::new(&transport);
        assert!(bus.monitor_bus(Duration::from_millis(200)).await.unwrap().is_empty());
        assert!(bus.detect_ecus().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_uds_request() {
        let transport = transport(MockAdapter::new().with_response("", "7E8 06 62 F1 90 31 48 47"));
        let bus = CanBus::new(&transport);

        let reply = bus.send_uds_request(0x22, &[0xF1, 0x90], 0x7E0).await.unwrap();
        assert_eq!(reply.lines(), &["7E8 06 62 F1 90 31 48 47".to_string()]);

        let err = bus.send_uds_request(0x22, &[0; 7], 0x7E0).await.unwrap_err();
        assert!(matches!(err, ObdError::InvalidFrame(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters() {
        let transport = transport(MockAdapter::new());
        let bus = CanBus::new(&transport);
        bus.set_can_filter(0x7E8, false).await.unwrap();
        bus.set_can_mask(0x7FF, false).await.unwrap();
        bus.clear_can_filter().await.unwrap();
    }
}
