//! In-process ELM327 emulator
//!
//! Serves a scripted adapter on one end of a `tokio::io::duplex` pipe so the
//! whole stack can run without hardware. Used by the tests and by the
//! command line `--mock` mode.

use crate::transport::{compact, PROMPT};
use std::collections::{HashMap, HashSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::{debug, trace};

const PIPE_CAPACITY: usize = 4096;

/// Builder for a simulated adapter on a 2008-ish CAN vehicle
#[derive(Debug, Clone)]
pub struct MockAdapter {
    responses: HashMap<String, String>,
    bus_traffic: Vec<String>,
    silent: HashSet<String>,
    hang_up: HashSet<String>,
    echo: bool,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Adapter with a healthy engine, one stored code and a VIN
    pub fn new() -> Self {
        let defaults = [
            ("ATZ", "ELM327 v1.5"),
            ("ATWS", "ELM327 v1.5"),
            ("ATI", "ELM327 v1.5"),
            ("ATRV", "12.6V"),
            ("ATDP", "AUTO, ISO 15765-4 (CAN 11/500)"),
            ("ATDPN", "A6"),
            ("0100", "41 00 BE 1F A8 13"),
            ("0104", "41 04 66"),
            ("0105", "41 05 4E"),
            ("010B", "41 0B 21"),
            ("010C", "41 0C 1A F8"),
            ("010D", "41 0D 28"),
            ("010F", "41 0F 44"),
            ("0110", "41 10 01 2C"),
            ("0111", "41 11 33"),
            ("03", "43 01 33 00 00"),
            ("07", "47"),
            ("0A", "4A"),
            ("04", "44"),
            (
                "0902",
                "49 02 01 00 00 00 31\r49 02 02 48 47 43 4D\r49 02 03 38 32 36 33\r\
                 49 02 04 33 41 30 30\r49 02 05 34 33 35 32",
            ),
        ];

        Self {
            responses: defaults
                .iter()
                .map(|(command, reply)| (compact(command), reply.to_string()))
                .collect(),
            bus_traffic: vec![
                "7E8027E0000".to_string(),
                "7E9027E0000".to_string(),
                "18DAF110027E000000".to_string(),
            ],
            silent: HashSet::new(),
            hang_up: HashSet::new(),
            echo: true,
        }
    }

    /// Answer `command` with `reply`; lines separated by `\r` or `\n`
    pub fn with_response(mut self, command: &str, reply: &str) -> Self {
        self.responses.insert(compact(command), reply.to_string());
        self
    }

    /// Lines printed while `ATMA` runs
    pub fn with_bus_traffic<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bus_traffic = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Never answer `command`
    pub fn silent_on(mut self, command: &str) -> Self {
        self.silent.insert(compact(command));
        self
    }

    /// Close the pipe when `command` arrives
    pub fn hang_up_on(mut self, command: &str) -> Self {
        self.hang_up.insert(compact(command));
        self
    }

    /// Echo state before the first `ATZ`/`ATE0`
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Start serving; returns the client end of the pipe
    pub fn spawn(self) -> DuplexStream {
        let (client, adapter) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(self.serve(adapter));
        client
    }

    async fn serve(mut self, mut stream: DuplexStream) {
        loop {
            let Some(received) = read_line(&mut stream).await else {
                debug!("Mock adapter: client went away");
                return;
            };
            let command = compact(&received);
            trace!("Mock adapter <- {:?}", received);

            if self.hang_up.contains(&command) {
                debug!("Mock adapter: hanging up on {:?}", command);
                return;
            }
            if self.silent.contains(&command) {
                continue;
            }

            let mut out = String::new();
            if self.echo {
                out.push_str(&received);
                out.push('\r');
            }

            if command == "ATMA" {
                for line in &self.bus_traffic {
                    out.push_str(line);
                    out.push('\r');
                }
                if stream.write_all(out.as_bytes()).await.is_err() {
                    return;
                }
                out.clear();
                // any key stops the monitor
                if read_line(&mut stream).await.is_none() {
                    return;
                }
                if self.bus_traffic.is_empty() {
                    out.push_str("NO DATA\r");
                }
            } else {
                for line in self.reply_to(&command).split(['\r', '\n']) {
                    out.push_str(line.trim());
                    out.push('\r');
                }
            }
            out.push('\r');
            out.push(PROMPT as char);

            if stream.write_all(out.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    fn reply_to(&mut self, command: &str) -> String {
        match command {
            "ATZ" | "ATWS" | "ATE1" => self.echo = true,
            "ATE0" => self.echo = false,
            _ => {}
        }

        if let Some(reply) = self.responses.get(command) {
            return reply.clone();
        }
        if command.starts_with("AT") {
            return "OK".to_string();
        }
        // raw frames: 3-digit id plus whole bytes is odd, 8-digit ids are long
        let frame_len = command.len() >= 10 || (command.len() >= 5 && command.len() % 2 == 1);
        if frame_len && command.chars().all(|c| c.is_ascii_hexdigit()) {
            return "OK".to_string();
        }
        "NO DATA".to_string()
    }
}

async fn read_line(stream: &mut DuplexStream) -> Option<String> {
    let mut line = Vec::new();
    loop {
        match stream.read_u8().await.ok()? {
            b'\r' => return Some(String::from_utf8_lossy(&line).into_owned()),
            b'\n' => {}
            byte => line.push(byte),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::time::Duration;

    fn transport(adapter: MockAdapter) -> Transport {
        Transport::from_link("mock", adapter.spawn(), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_follows_ate() {
        let transport = transport(MockAdapter::new());
        // echo is on but stripped by the transport
        assert_eq!(transport.send("ATI").await.unwrap().text(), "ELM327 v1.5");
        transport.send("ATE0").await.unwrap();
        assert_eq!(transport.send("010D").await.unwrap().text(), "41 0D 28");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_obd_request() {
        let transport = transport(MockAdapter::new().with_echo(false));
        assert_eq!(transport.send("0162").await.unwrap().text(), "NO DATA");
        assert_eq!(transport.send("ATL0").await.unwrap().text(), "OK");
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_line_reply() {
        let transport = transport(MockAdapter::new().with_echo(false));
        assert_eq!(transport.send("0902").await.unwrap().lines().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_prints_traffic() {
        let transport = transport(MockAdapter::new());
        let response = transport
            .monitor(&"ATMA".into(), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(response.lines()[0], "7E8027E0000");
        assert_eq!(response.lines().len(), 3);
        // the adapter is usable again afterwards
        assert_eq!(transport.send("ATRV").await.unwrap().text(), "12.6V");
    }
}
