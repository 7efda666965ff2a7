//! Subcommand implementations
//!
//! Every command writes its result to `out`, as text or as JSON.

use crate::cli::{parse_hex_bytes, Command};
use anyhow::{bail, Context};
use obd_protocol::{DecodedReading, ObdClient};
use obd_scheduler::{PidPoller, PollerConfig};
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_serial::SerialPortType;
use tracing::{info, warn};

const READING_BUFFER: usize = 64;

/// Human name for a PID, falling back to its number
fn describe(client: &ObdClient, mode: u8, pid: u8) -> String {
    client
        .registry()
        .definition(mode, pid)
        .map(|def| def.description.to_string())
        .unwrap_or_else(|| format!("PID {pid:02X}"))
}

fn write_json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn write_reading<W: Write>(out: &mut W, client: &ObdClient, reading: &DecodedReading, json: bool) -> anyhow::Result<()> {
    if json {
        // one object per line so the stream stays parseable
        writeln!(out, "{}", serde_json::to_string(reading)?)?;
    } else {
        writeln!(
            out,
            "{:02X} {:<32} {}",
            reading.pid,
            describe(client, reading.mode, reading.pid),
            client.registry().format_value(reading.mode, reading.pid, &reading.value)
        )?;
    }
    Ok(())
}

/// Serial ports the OS reports
pub fn list_ports<W: Write>(out: &mut W, json: bool) -> anyhow::Result<()> {
    let ports = tokio_serial::available_ports().context("failed to enumerate serial ports")?;

    let described: Vec<(String, String)> = ports
        .into_iter()
        .map(|port| {
            let kind = match port.port_type {
                SerialPortType::UsbPort(usb) => format!(
                    "USB {:04X}:{:04X} {}",
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::Unknown => String::new(),
            };
            (port.port_name, kind.trim().to_string())
        })
        .collect();

    if json {
        let ports: Vec<_> = described
            .iter()
            .map(|(name, kind)| json!({ "port": name, "type": kind }))
            .collect();
        return write_json(out, &ports);
    }
    if described.is_empty() {
        writeln!(out, "No serial ports found")?;
    }
    for (name, kind) in described {
        writeln!(out, "{name:<24} {kind}")?;
    }
    Ok(())
}

/// Run one subcommand against a connected client
pub async fn execute<W: Write>(
    client: &mut ObdClient,
    command: &Command,
    poller: &PollerConfig,
    json: bool,
    out: &mut W,
) -> anyhow::Result<()> {
    match command {
        Command::Info => {
            let voltage = client.refresh_voltage().await?;
            let number = client.at().describe_protocol_number().await?;
            let adapter = client.adapter_info();
            if json {
                return write_json(
                    out,
                    &json!({
                        "port": client.port(),
                        "version": adapter.version,
                        "protocol": adapter.protocol,
                        "protocol_code": number.protocol.code().to_string(),
                        "automatic": number.automatic,
                        "voltage": voltage,
                    }),
                );
            }
            writeln!(out, "Port:     {}", client.port())?;
            writeln!(out, "Adapter:  {}", adapter.version)?;
            writeln!(
                out,
                "Protocol: {} ({}{})",
                adapter.protocol,
                number.protocol.code(),
                if number.automatic { ", auto" } else { "" }
            )?;
            writeln!(out, "Voltage:  {voltage:.1} V")?;
        }

        Command::Read { mode, pids } => {
            let mut readings = Vec::new();
            for &pid in pids {
                match client.query_pid(*mode, pid).await {
                    Ok(reading) => readings.push(reading),
                    Err(e) if e.is_recoverable() => {
                        warn!("PID {:02X}{:02X} not read: {}", mode, pid, e);
                        if !json {
                            writeln!(out, "{:02X} {:<32} not available", pid, describe(client, *mode, pid))?;
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if json {
                return write_json(out, &readings);
            }
            for reading in &readings {
                write_reading(out, client, reading, false)?;
            }
        }

        Command::Dtc { all } => {
            let dtcs = if *all {
                client.read_all_dtcs().await?
            } else {
                client.read_dtcs().await?
            };
            if json {
                return write_json(out, &dtcs);
            }
            if dtcs.is_empty() {
                writeln!(out, "No trouble codes")?;
            }
            for dtc in &dtcs {
                writeln!(
                    out,
                    "{} [{}, {}]",
                    dtc,
                    dtc.kind,
                    client.dtc_database().severity(&dtc.code)
                )?;
            }
        }

        Command::ClearDtc { yes } => {
            if !yes {
                bail!("clearing also erases freeze frames and readiness monitors; pass --yes to proceed");
            }
            client.clear_dtcs().await?;
            info!("Trouble codes cleared on {}", client.port());
            writeln!(out, "Trouble codes cleared")?;
        }

        Command::Supported => {
            let pids = client.supported_pids().await?;
            if json {
                return write_json(out, &pids);
            }
            for pid in pids {
                writeln!(out, "{:02X} {}", pid, describe(client, obd_protocol::mode::CURRENT_DATA, pid))?;
            }
        }

        Command::Vin => {
            let vin = client.vin().await?;
            if json {
                return write_json(out, &json!({ "vin": vin }));
            }
            match vin {
                Some(vin) => writeln!(out, "{vin}")?,
                None => writeln!(out, "VIN not available")?,
            }
        }

        Command::Monitor { duration_ms } => {
            let frames = client.can().monitor_bus(Duration::from_millis(*duration_ms)).await?;
            if json {
                return write_json(out, &frames);
            }
            for frame in &frames {
                writeln!(out, "{frame}")?;
            }
            writeln!(out, "{} frames", frames.len())?;
        }

        Command::Ecus => {
            let ecus = client.discover_ecus().await?;
            if json {
                return write_json(out, &ecus);
            }
            if ecus.is_empty() {
                writeln!(out, "No ECUs answered")?;
            }
            for ecu in &ecus {
                writeln!(out, "{ecu}")?;
            }
        }

        Command::Watch { pids, rate, seconds } => {
            let mut config = poller.clone();
            if !pids.is_empty() {
                config.default_pids = pids.clone();
            }
            if let Some(rate) = rate {
                config.refresh_rate_hz = *rate;
            }
            let client: &ObdClient = client;
            let mut poller = PidPoller::new(config);
            let (tx, mut rx) = mpsc::channel(READING_BUFFER);
            let (stop_tx, stop_rx) = watch::channel(false);

            let stopper = async {
                let deadline = async {
                    match seconds {
                        Some(secs) => tokio::time::sleep(Duration::from_secs(*secs)).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                    _ = deadline => {}
                    _ = stop_tx.closed() => {}
                }
                let _ = stop_tx.send(true);
            };
            let stop = &stop_tx;
            let printer = async move {
                while let Some(reading) = rx.recv().await {
                    if let Err(e) = write_reading(out, client, &reading, json) {
                        // the receiver is dropped on return as well
                        let _ = stop.send(true);
                        return Err(e);
                    }
                }
                anyhow::Ok(())
            };

            let (stats, (), printed) = tokio::join!(poller.run(client, tx, stop_rx), stopper, printer);
            printed?;
            let stats = stats?;
            info!(
                "Watch finished: {} readings, {} dropped, {} failures",
                stats.readings, stats.dropped, stats.failures
            );
        }

        Command::Send { id, data, extended } => {
            let bytes = parse_hex_bytes(data).map_err(anyhow::Error::msg)?;
            client.can().send_frame(*id, &bytes, *extended).await?;
            writeln!(out, "Frame sent")?;
        }

        Command::Raw { command } => {
            let response = client.at().raw(command, Duration::ZERO).await?;
            if json {
                return write_json(out, response.lines());
            }
            for line in response.lines() {
                writeln!(out, "{line}")?;
            }
        }

        Command::Ports => list_ports(out, json)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::ObdConfig;

    async fn run(command: Command, json: bool) -> anyhow::Result<String> {
        let mut client = ObdClient::mock(&ObdConfig::default()).await?;
        let mut out = Vec::new();
        execute(&mut client, &command, &PollerConfig::default(), json, &mut out).await?;
        Ok(String::from_utf8(out)?)
    }

    #[tokio::test(start_paused = true)]
    async fn test_info() {
        let text = run(Command::Info, false).await.unwrap();
        assert!(text.contains("ELM327 v1.5"));
        assert!(text.contains("Voltage:  12.6 V"));
        assert!(text.contains("(6, auto)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_text() {
        let text = run(
            Command::Read {
                mode: 1,
                pids: vec![0x0C, 0x0D, 0x42],
            },
            false,
        )
        .await
        .unwrap();
        assert!(text.contains("1726.00 RPM"));
        assert!(text.contains("40 km/h"));
        assert!(text.contains("not available"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_json() {
        let text = run(
            Command::Read {
                mode: 1,
                pids: vec![0x05],
            },
            true,
        )
        .await
        .unwrap();
        let readings: Vec<DecodedReading> = serde_json::from_str(&text).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].raw_bytes, vec![0x4E]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dtcs() {
        let text = run(Command::Dtc { all: true }, false).await.unwrap();
        assert!(text.starts_with("P0133: "));
        assert!(text.contains("[stored, low]"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_needs_confirmation() {
        assert!(run(Command::ClearDtc { yes: false }, false).await.is_err());
        let text = run(Command::ClearDtc { yes: true }, false).await.unwrap();
        assert_eq!(text, "Trouble codes cleared\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_supported_and_vin() {
        let text = run(Command::Supported, true).await.unwrap();
        let pids: Vec<u8> = serde_json::from_str(&text).unwrap();
        assert_eq!(pids.len(), 17);

        let text = run(Command::Vin, false).await.unwrap();
        assert_eq!(text.trim(), "1HGCM82633A004352");
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_and_ecus() {
        let text = run(Command::Monitor { duration_ms: 100 }, false).await.unwrap();
        assert!(text.contains("ID: 7E8, Data: 02 7E 00 00"));
        assert!(text.ends_with("3 frames\n"));

        let text = run(Command::Ecus, false).await.unwrap();
        assert!(text.contains("Engine Control Module (ECM) (ID: 0x7E8)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_raw() {
        let command = Command::Send {
            id: 0x7DF,
            data: vec!["02 01 0C".to_string()],
            extended: false,
        };
        assert_eq!(run(command, false).await.unwrap(), "Frame sent\n");

        let bad = Command::Send {
            id: 0x7DF,
            data: vec!["0".to_string()],
            extended: false,
        };
        assert!(run(bad, false).await.is_err());

        let text = run(Command::Raw { command: "ATRV".to_string() }, false).await.unwrap();
        assert_eq!(text, "12.6V\n");
    }

    /// Output that has gone away, like stdout piped into `head`
    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_ends_when_output_closes() {
        let mut client = ObdClient::mock(&ObdConfig::default()).await.unwrap();
        let command = Command::Watch {
            pids: vec![0x0C],
            rate: Some(5.0),
            seconds: None,
        };
        let result = tokio::time::timeout(
            Duration::from_secs(60),
            execute(&mut client, &command, &PollerConfig::default(), false, &mut ClosedPipe),
        )
        .await
        .expect("watch kept running after its output closed");

        let err = result.unwrap_err();
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_stops_after_deadline() {
        let text = run(
            Command::Watch {
                pids: vec![0x0C],
                rate: Some(5.0),
                seconds: Some(1),
            },
            true,
        )
        .await
        .unwrap();
        let readings: Vec<DecodedReading> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert!(!readings.is_empty());
        assert!(readings.iter().all(|r| r.pid == 0x0C));
    }
}
