//! OBD-II request layer: mode/PID queries, trouble codes and VIN

use crate::dtc::{parse_dtc_payload, Dtc, DtcDatabase, DtcKind};
use crate::error::{ObdError, ObdResult};
use crate::mode;
use crate::pid::DecodedReading;
use crate::registry::PidRegistry;
use crate::transport::{compact, Response, Transport};
use tracing::{debug, warn};

/// Replies the adapter prints instead of data
const ERROR_TOKENS: [&str; 8] = [
    "NO DATA",
    "UNABLE TO CONNECT",
    "ERROR",
    "CAN ERROR",
    "BUS ERROR",
    "BUFFER FULL",
    "STOPPED",
    "?",
];

/// Progress lines printed while the adapter negotiates a protocol
const STATUS_PREFIXES: [&str; 2] = ["SEARCHING", "BUS INIT"];

/// Bitmap query PIDs
const SUPPORTED_PID_BASES: [u8; 8] = [0x00, 0x20, 0x40, 0x60, 0x80, 0xA0, 0xC0, 0xE0];

const VIN_LENGTH: usize = 17;

/// Classified reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    Data(Vec<String>),
    /// `NO DATA` or nothing at all
    NoData,
    Error(String),
}

pub(crate) fn is_status_line(line: &str) -> bool {
    let upper = line.trim().to_ascii_uppercase();
    STATUS_PREFIXES.iter().any(|prefix| upper.starts_with(prefix))
}

pub(crate) fn classify(response: &Response) -> Reply {
    let lines: Vec<String> = response
        .lines()
        .iter()
        .filter(|line| !is_status_line(line))
        .cloned()
        .collect();

    if lines.is_empty() {
        return Reply::NoData;
    }
    for line in &lines {
        let upper = line.trim().to_ascii_uppercase();
        if upper == "NO DATA" {
            return Reply::NoData;
        }
        if ERROR_TOKENS.contains(&upper.as_str()) {
            return Reply::Error(upper);
        }
    }
    Reply::Data(lines)
}

/// Hex text to bytes; an odd trailing digit is padded with `0`
pub(crate) fn hex_bytes(hex: &str) -> Option<Vec<u8>> {
    let mut digits = hex.to_string();
    if digits.len() % 2 == 1 {
        digits.push('0');
    }
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

/// PIDs flagged in a 4-byte support bitmap; bit 7 of the first byte is
/// `base + 1`
pub fn bitmap_to_pids(base: u8, bitmap: &[u8]) -> Vec<u8> {
    bitmap
        .iter()
        .take(4)
        .enumerate()
        .flat_map(|(byte_index, byte)| {
            (0u8..8).filter_map(move |bit| {
                if byte & (0x80u8 >> bit) == 0 {
                    return None;
                }
                let pid = u16::from(base) + (byte_index as u16) * 8 + u16::from(bit) + 1;
                u8::try_from(pid).ok()
            })
        })
        .collect()
}

/// Payload after an ISO-TP frame index such as `0:`; `None` without one
pub(crate) fn strip_frame_index(hex: &str) -> Option<&str> {
    let (index, rest) = hex.split_once(':')?;
    (!index.is_empty() && index.chars().all(|c| c.is_ascii_hexdigit())).then_some(rest)
}

/// Reassemble a multi-frame reply: an optional byte count line, then the
/// indexed frames in order
pub(crate) fn join_frames(lines: &[String]) -> String {
    let mut length = None;
    let mut data = String::new();
    for line in lines {
        let hex = compact(line);
        match strip_frame_index(&hex) {
            Some(payload) => data.push_str(payload),
            None => length = usize::from_str_radix(&hex, 16).ok(),
        }
    }
    if let Some(bytes) = length {
        data.truncate(bytes * 2);
    }
    data
}

/// Printable characters of mode 09 PID 02 lines
pub(crate) fn decode_vin(lines: &[String]) -> Option<String> {
    let mut vin = String::new();
    for line in lines {
        let compacted = compact(line);
        let hex = strip_frame_index(&compacted).unwrap_or(&compacted);
        let hex = hex.strip_prefix("4902").unwrap_or(hex);
        for pair in hex.as_bytes().chunks_exact(2) {
            let byte = std::str::from_utf8(pair)
                .ok()
                .and_then(|p| u8::from_str_radix(p, 16).ok());
            if let Some(byte @ 32..=126) = byte {
                vin.push(byte as char);
            }
        }
    }

    let vin = vin.trim();
    (vin.chars().count() == VIN_LENGTH).then(|| vin.to_string())
}

/// Borrowing view over a transport for OBD-II requests
#[derive(Debug, Clone, Copy)]
pub struct Obd2<'a> {
    transport: &'a Transport,
    registry: &'a PidRegistry,
    dtcs: &'a DtcDatabase,
}

impl<'a> Obd2<'a> {
    pub fn new(transport: &'a Transport, registry: &'a PidRegistry, dtcs: &'a DtcDatabase) -> Self {
        Self {
            transport,
            registry,
            dtcs,
        }
    }

    /// Query and decode one PID
    pub async fn query_pid(&self, mode: u8, pid: u8) -> ObdResult<DecodedReading> {
        let raw = self.query_pid_raw(mode, pid).await?;
        let value = self.registry.decode(mode, pid, &raw);
        Ok(DecodedReading::new(mode, pid, value, raw))
    }

    /// Data bytes of the reply, after the mode/PID echo
    pub async fn query_pid_raw(&self, mode: u8, pid: u8) -> ObdResult<Vec<u8>> {
        let command = format!("{mode:02X}{pid:02X}");
        self.request(&command, mode, pid).await
    }

    /// Query each PID in turn, skipping the ones the vehicle does not answer
    pub async fn query_multiple_pids(&self, mode: u8, pids: &[u8]) -> ObdResult<Vec<DecodedReading>> {
        let mut readings = Vec::with_capacity(pids.len());
        for &pid in pids {
            match self.query_pid(mode, pid).await {
                Ok(reading) => readings.push(reading),
                Err(e) if e.is_recoverable() => {
                    debug!("Skipping {:02X}{:02X}: {}", mode, pid, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(readings)
    }

    /// Mode 01
    pub async fn current_data(&self, pid: u8) -> ObdResult<DecodedReading> {
        self.query_pid(mode::CURRENT_DATA, pid).await
    }

    /// Mode 02: `02 <pid> <frame>`; the reply repeats the frame number
    /// before the data
    pub async fn freeze_frame(&self, pid: u8, frame: u8) -> ObdResult<DecodedReading> {
        let command = format!("{:02X}{pid:02X}{frame:02X}", mode::FREEZE_FRAME);
        let mut raw = self.request(&command, mode::FREEZE_FRAME, pid).await?;
        if raw.is_empty() {
            return Err(ObdError::InvalidResponse(format!("{command}: no frame number")));
        }
        raw.remove(0);
        let value = self.registry.decode(mode::FREEZE_FRAME, pid, &raw);
        Ok(DecodedReading::new(mode::FREEZE_FRAME, pid, value, raw))
    }

    /// Mode 09
    pub async fn vehicle_info(&self, pid: u8) -> ObdResult<DecodedReading> {
        self.query_pid(mode::VEHICLE_INFO, pid).await
    }

    /// Mode 03
    pub async fn get_dtcs(&self) -> ObdResult<Vec<Dtc>> {
        self.read_dtcs(DtcKind::Stored).await
    }

    /// Mode 07
    pub async fn get_pending_dtcs(&self) -> ObdResult<Vec<Dtc>> {
        self.read_dtcs(DtcKind::Pending).await
    }

    /// Mode 0A
    pub async fn get_permanent_dtcs(&self) -> ObdResult<Vec<Dtc>> {
        self.read_dtcs(DtcKind::Permanent).await
    }

    /// Codes only, without descriptions
    pub async fn read_dtc_codes(&self, kind: DtcKind) -> ObdResult<Vec<String>> {
        let command = format!("{:02X}", kind.mode());
        let response = self.transport.send(&command).await?;

        let lines = match classify(&response) {
            Reply::Data(lines) => lines,
            Reply::NoData => return Ok(Vec::new()),
            Reply::Error(token) => {
                return Err(ObdError::InvalidResponse(format!("{command}: {token}")))
            }
        };

        let prefix = kind.response_prefix();
        if lines.iter().any(|line| strip_frame_index(&compact(line)).is_some()) {
            // CAN multi-frame: one payload, led by the number of codes
            let joined = join_frames(&lines);
            let payload = joined.strip_prefix(prefix.as_str()).unwrap_or(&joined);
            let payload = payload.get(2..).unwrap_or_default();
            return Ok(parse_dtc_payload(payload));
        }

        let codes = lines
            .iter()
            .flat_map(|line| {
                let hex = compact(line);
                let payload = hex.strip_prefix(prefix.as_str()).unwrap_or(&hex);
                parse_dtc_payload(payload)
            })
            .collect();
        Ok(codes)
    }

    async fn read_dtcs(&self, kind: DtcKind) -> ObdResult<Vec<Dtc>> {
        let codes = self.read_dtc_codes(kind).await?;
        debug!("{} DTCs: {:?}", kind, codes);
        Ok(self.dtcs.parse_codes(&codes, kind))
    }

    /// Mode 04
    pub async fn clear_dtcs(&self) -> ObdResult<()> {
        let command = format!("{:02X}", mode::CLEAR_DTC);
        let response = self.transport.send(&command).await?;
        if response.is_empty() || response.contains("OK") || response.contains("44") {
            Ok(())
        } else {
            warn!("Clearing DTCs refused: {:?}", response.lines());
            Err(ObdError::InvalidResponse(format!("{command}: {}", response.text())))
        }
    }

    /// Walk the support bitmaps `00, 20, .., E0` until one is not answered
    pub async fn get_supported_pids(&self, mode: u8) -> ObdResult<Vec<u8>> {
        let mut supported = Vec::new();
        for base in SUPPORTED_PID_BASES {
            match self.query_pid_raw(mode, base).await {
                Ok(bitmap) if bitmap.len() >= 4 => supported.extend(bitmap_to_pids(base, &bitmap)),
                Ok(bitmap) => {
                    debug!("Short support bitmap at {:02X}: {:02X?}", base, bitmap);
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    debug!("Support scan stopped at {:02X}{:02X}: {}", mode, base, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(supported)
    }

    /// Mode 09 PID 02; `None` if the vehicle does not report a 17 character VIN
    pub async fn get_vin(&self) -> ObdResult<Option<String>> {
        let response = self.transport.send("0902").await?;
        match classify(&response) {
            Reply::Data(lines) => Ok(decode_vin(&lines)),
            Reply::NoData | Reply::Error(_) => Ok(None),
        }
    }

    async fn request(&self, command: &str, mode: u8, pid: u8) -> ObdResult<Vec<u8>> {
        let response = self.transport.send(command).await?;
        let lines = match classify(&response) {
            Reply::Data(lines) => lines,
            Reply::NoData => return Err(ObdError::InvalidResponse(format!("{command}: NO DATA"))),
            Reply::Error(token) => return Err(ObdError::InvalidResponse(format!("{command}: {token}"))),
        };

        let header = format!("{:02X}{pid:02X}", mode.wrapping_add(0x40));
        let payload = lines
            .iter()
            .map(|line| compact(line))
            .find_map(|hex| hex.strip_prefix(header.as_str()).map(str::to_string))
            .ok_or_else(|| {
                ObdError::InvalidResponse(format!("{command}: no {header} reply in {lines:?}"))
            })?;

        hex_bytes(&payload).ok_or_else(|| {
            ObdError::InvalidResponse(format!("{command}: non-hex data {payload:?}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;
    use crate::pid::PidValue;
    use std::time::Duration;

    struct Fixture {
        transport: Transport,
        registry: PidRegistry,
        dtcs: DtcDatabase,
    }

    impl Fixture {
        fn new(adapter: MockAdapter) -> Self {
            Self {
                transport: Transport::from_link("mock", adapter.spawn(), Duration::from_secs(1)),
                registry: PidRegistry::new(),
                dtcs: DtcDatabase::new(),
            }
        }

        fn obd(&self) -> Obd2<'_> {
            Obd2::new(&self.transport, &self.registry, &self.dtcs)
        }
    }

    #[test]
    fn test_bitmap_to_pids() {
        assert_eq!(
            bitmap_to_pids(0x00, &[0xBE, 0x1F, 0xA8, 0x13]),
            vec![1, 3, 4, 5, 6, 7, 12, 13, 14, 15, 16, 17, 19, 21, 28, 31, 32]
        );
        assert_eq!(bitmap_to_pids(0x20, &[0x80, 0, 0, 0x01]), vec![0x21, 0x40]);
        // 0xE0 + 32 does not fit a PID
        assert_eq!(bitmap_to_pids(0xE0, &[0, 0, 0, 0x03]), vec![0xFF]);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&Response::from_lines(["SEARCHING...", "NO DATA"])), Reply::NoData);
        assert_eq!(classify(&Response::default()), Reply::NoData);
        assert_eq!(
            classify(&Response::from_lines(["UNABLE TO CONNECT"])),
            Reply::Error("UNABLE TO CONNECT".into())
        );
        assert_eq!(
            classify(&Response::from_lines(["BUS INIT: ...", "41 0C 1A F8"])),
            Reply::Data(vec!["41 0C 1A F8".into()])
        );
    }

    #[test]
    fn test_hex_bytes_pads_odd_digit() {
        assert_eq!(hex_bytes("1AF8"), Some(vec![0x1A, 0xF8]));
        assert_eq!(hex_bytes("1AF"), Some(vec![0x1A, 0xF0]));
        assert_eq!(hex_bytes("1G"), None);
    }

    #[test]
    fn test_decode_vin_formats() {
        let plain: Vec<String> = [
            "49 02 01 00 00 00 31",
            "49 02 02 48 47 43 4D",
            "49 02 03 38 32 36 33",
            "49 02 04 33 41 30 30",
            "49 02 05 34 33 35 32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(decode_vin(&plain).as_deref(), Some("1HGCM82633A004352"));

        let iso_tp: Vec<String> = [
            "014",
            "0: 49 02 01 31 48 47",
            "1: 43 4D 38 32 36 33 33",
            "2: 41 30 30 34 33 35 32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(decode_vin(&iso_tp).as_deref(), Some("1HGCM82633A004352"));

        assert_eq!(decode_vin(&["49 02 01 31 32".to_string()]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_pid_decodes() {
        let fixture = Fixture::new(MockAdapter::new());
        let rpm = fixture.obd().current_data(0x0C).await.unwrap();
        assert_eq!(rpm.value, PidValue::Float(1726.0));
        assert_eq!(rpm.raw_bytes, vec![0x1A, 0xF8]);

        let coolant = fixture.obd().query_pid(0x01, 0x05).await.unwrap();
        assert_eq!(coolant.value, PidValue::Integer(38));
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_pid_error_tokens() {
        let fixture = Fixture::new(
            MockAdapter::new()
                .with_response("0142", "UNABLE TO CONNECT")
                .with_response("0143", "SEARCHING...\rNO DATA")
                .with_response("0144", "41 44 ZZ"),
        );
        for pid in [0x42, 0x43, 0x44, 0x46] {
            let err = fixture.obd().current_data(pid).await.unwrap_err();
            assert!(matches!(err, ObdError::InvalidResponse(_)), "{pid:02X}: {err}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_multiple_skips_failures() {
        let fixture = Fixture::new(MockAdapter::new());
        let readings = fixture
            .obd()
            .query_multiple_pids(0x01, &[0x0C, 0x42, 0x0D])
            .await
            .unwrap();
        let pids: Vec<u8> = readings.iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![0x0C, 0x0D]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_freeze_frame_uses_standard_table() {
        let fixture = Fixture::new(MockAdapter::new().with_response("020500", "42 05 00 4E"));
        let reading = fixture.obd().freeze_frame(0x05, 0).await.unwrap();
        assert_eq!(reading.mode, 0x02);
        assert_eq!(reading.value, PidValue::Integer(38));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dtc_reads() {
        let fixture = Fixture::new(
            MockAdapter::new()
                .with_response("07", "47 04 20 00 00")
                .with_response("0A", "UNABLE TO CONNECT"),
        );
        let stored = fixture.obd().get_dtcs().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].code, "P0133");
        assert_eq!(stored[0].kind, DtcKind::Stored);

        let pending = fixture.obd().get_pending_dtcs().await.unwrap();
        assert_eq!(pending[0].code, "P0420");
        assert_eq!(pending[0].kind, DtcKind::Pending);

        assert!(matches!(
            fixture.obd().get_permanent_dtcs().await,
            Err(ObdError::InvalidResponse(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_frame_dtc_reply() {
        let fixture = Fixture::new(
            MockAdapter::new().with_response("03", "00A\r0: 43 04 01 33 01 71\r1: 03 00 04 20 00 00"),
        );
        let codes = fixture.obd().read_dtc_codes(DtcKind::Stored).await.unwrap();
        assert_eq!(codes, vec!["P0133", "P0171", "P0300", "P0420"]);
    }

    #[test]
    fn test_join_frames() {
        let lines: Vec<String> = ["00A", "0: 43 04 01 33 01 71", "1: 03 00 04 20 00 00"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(join_frames(&lines), "43040133017103000420");
        assert_eq!(strip_frame_index("0:4902"), Some("4902"));
        assert_eq!(strip_frame_index(":4902"), None);
        assert_eq!(strip_frame_index("4902"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_data_means_no_codes() {
        let fixture = Fixture::new(MockAdapter::new().with_response("03", "NO DATA"));
        assert!(fixture.obd().get_dtcs().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_dtcs() {
        let fixture = Fixture::new(MockAdapter::new());
        fixture.obd().clear_dtcs().await.unwrap();

        let refused = Fixture::new(MockAdapter::new().with_response("04", "ERROR"));
        assert!(refused.obd().clear_dtcs().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supported_pids_stop_at_first_gap() {
        let fixture = Fixture::new(MockAdapter::new());
        let pids = fixture.obd().get_supported_pids(0x01).await.unwrap();
        assert_eq!(pids, vec![1, 3, 4, 5, 6, 7, 12, 13, 14, 15, 16, 17, 19, 21, 28, 31, 32]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supported_pids_keep_what_was_read_on_timeout() {
        let fixture = Fixture::new(MockAdapter::new().silent_on("0120"));
        let pids = fixture.obd().get_supported_pids(0x01).await.unwrap();
        assert_eq!(pids.len(), 17);
        assert_eq!(pids.last(), Some(&0x20));

        let fixture = Fixture::new(
            MockAdapter::new()
                .with_response("0120", "41 20 80 00 00 01")
                .silent_on("0140"),
        );
        let pids = fixture.obd().get_supported_pids(0x01).await.unwrap();
        assert_eq!(pids.len(), 19);
        assert_eq!(&pids[17..], &[0x21, 0x40]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supported_pids_propagates_transport_failure() {
        let fixture = Fixture::new(MockAdapter::new().hang_up_on("0100"));
        let err = fixture.obd().get_supported_pids(0x01).await.unwrap_err();
        assert!(matches!(err, ObdError::TransportFailure { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vin() {
        let fixture = Fixture::new(MockAdapter::new());
        assert_eq!(fixture.obd().get_vin().await.unwrap().as_deref(), Some("1HGCM82633A004352"));

        let missing = Fixture::new(MockAdapter::new().with_response("0902", "NO DATA"));
        assert_eq!(missing.obd().get_vin().await.unwrap(), None);
    }
}
