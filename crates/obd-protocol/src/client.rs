//! OBD-II Client for ELM327 Adapters
//!
//! `ObdClient` is the session: it owns the transport and the decode state,
//! and hands out short-lived protocol views over them.

use crate::can::CanBus;
use crate::config::{AdapterSettings, ObdConfig};
use crate::dtc::{Dtc, DtcDatabase};
use crate::ecu::{EcuDatabase, EcuInfo};
use crate::elm::{AdapterInfo, AtCommands};
use crate::error::ObdResult;
use crate::mock::MockAdapter;
use crate::obd2::Obd2;
use crate::pid::DecodedReading;
use crate::protocol::ObdProtocol;
use crate::registry::PidRegistry;
use crate::transport::{CancelHandle, LinkEvent, SerialLink, Transport};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// OBD-II session with an ELM327-compatible adapter
#[derive(Debug)]
pub struct ObdClient {
    transport: Transport,
    config: ObdConfig,
    adapter: AdapterInfo,
    registry: PidRegistry,
    dtcs: DtcDatabase,
    ecus: EcuDatabase,
}

impl ObdClient {
    /// Open the configured serial port and initialize the adapter
    pub async fn connect(config: &ObdConfig) -> ObdResult<Self> {
        info!(
            "Connecting to {} at {} baud",
            config.connection.port, config.connection.baud_rate
        );
        let transport = Transport::open(&config.connection)?;
        Self::start(transport, config).await
    }

    /// Run a session over an already open link
    pub async fn from_link(
        port: impl Into<String>,
        link: impl SerialLink + 'static,
        config: &ObdConfig,
    ) -> ObdResult<Self> {
        let transport = Transport::from_link(port, link, config.connection.timeout());
        Self::start(transport, config).await
    }

    /// Session against the built-in adapter emulator (no hardware required)
    pub async fn mock(config: &ObdConfig) -> ObdResult<Self> {
        info!("Creating mock OBD client");
        Self::from_link("mock", MockAdapter::new().spawn(), config).await
    }

    async fn start(transport: Transport, config: &ObdConfig) -> ObdResult<Self> {
        let mut registry = PidRegistry::new();
        if let Some(path) = &config.custom_pids_path {
            registry.load_file(path)?;
        }

        let adapter = bring_up(&transport, &config.adapter).await?;
        Ok(Self {
            transport,
            config: config.clone(),
            adapter,
            registry,
            dtcs: DtcDatabase::new(),
            ecus: EcuDatabase::new(),
        })
    }

    /// Reset and configure the adapter with the session settings
    pub async fn initialize(&mut self) -> ObdResult<&AdapterInfo> {
        self.adapter = self.at().initialize(&self.config.adapter).await?;
        Ok(&self.adapter)
    }

    /// Close the link and forget discovered ECUs
    pub async fn disconnect(&mut self) {
        if self.transport.is_open() {
            info!("Disconnecting OBD client from {}", self.transport.port());
        }
        self.transport.close().await;
        self.ecus.clear();
    }

    /// Check if client is connected
    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    pub fn port(&self) -> &str {
        self.transport.port()
    }

    pub fn adapter_info(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn config(&self) -> &ObdConfig {
        &self.config
    }

    pub fn at(&self) -> AtCommands<'_> {
        AtCommands::new(&self.transport)
    }

    pub fn obd(&self) -> Obd2<'_> {
        Obd2::new(&self.transport, &self.registry, &self.dtcs)
    }

    pub fn can(&self) -> CanBus<'_> {
        CanBus::new(&self.transport)
    }

    pub fn registry(&self) -> &PidRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PidRegistry {
        &mut self.registry
    }

    pub fn dtc_database(&self) -> &DtcDatabase {
        &self.dtcs
    }

    pub fn dtc_database_mut(&mut self) -> &mut DtcDatabase {
        &mut self.dtcs
    }

    pub fn ecus(&self) -> &EcuDatabase {
        &self.ecus
    }

    /// Disconnect notifications
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.transport.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.transport.cancel_handle()
    }

    /// Query and decode any mode/PID
    pub async fn query_pid(&self, mode: u8, pid: u8) -> ObdResult<DecodedReading> {
        self.obd().query_pid(mode, pid).await
    }

    /// Mode 01 reading
    pub async fn read_pid(&self, pid: u8) -> ObdResult<DecodedReading> {
        self.obd().current_data(pid).await
    }

    /// Stored codes
    pub async fn read_dtcs(&self) -> ObdResult<Vec<Dtc>> {
        self.obd().get_dtcs().await
    }

    /// Stored, pending and permanent codes together
    pub async fn read_all_dtcs(&self) -> ObdResult<Vec<Dtc>> {
        let obd = self.obd();
        let mut dtcs = obd.get_dtcs().await?;
        dtcs.extend(obd.get_pending_dtcs().await?);
        dtcs.extend(obd.get_permanent_dtcs().await?);
        Ok(dtcs)
    }

    pub async fn clear_dtcs(&self) -> ObdResult<()> {
        self.obd().clear_dtcs().await
    }

    /// Mode 01 support scan
    pub async fn supported_pids(&self) -> ObdResult<Vec<u8>> {
        self.obd().get_supported_pids(crate::mode::CURRENT_DATA).await
    }

    pub async fn vin(&self) -> ObdResult<Option<String>> {
        self.obd().get_vin().await
    }

    /// Read the supply voltage and remember it
    pub async fn refresh_voltage(&mut self) -> ObdResult<f64> {
        let voltage = self.at().voltage().await?;
        self.adapter.voltage = Some(voltage);
        Ok(voltage)
    }

    /// Switch protocol and refresh the reported description
    pub async fn set_protocol(&mut self, protocol: ObdProtocol) -> ObdResult<()> {
        info!("Setting OBD protocol to {}", protocol);
        self.at().set_protocol(protocol).await?;
        self.config.adapter.protocol = protocol;
        self.adapter.protocol = self.at().describe_protocol().await?;
        Ok(())
    }

    /// Rescan the bus for OBD-II ECUs, replacing what was known
    pub async fn discover_ecus(&mut self) -> ObdResult<Vec<EcuInfo>> {
        self.ecus.clear();
        let ids = self.can().detect_ecus().await?;
        if ids.is_empty() {
            warn!("No ECUs answered on {}", self.transport.port());
        }
        for id in ids {
            let ecu = self.ecus.add_id(id);
            ecu.protocol = self.adapter.protocol.clone();
        }
        Ok(self.ecus.all().cloned().collect())
    }
}

/// Initialize the adapter; the link is closed if it does not come up
async fn bring_up(transport: &Transport, settings: &AdapterSettings) -> ObdResult<AdapterInfo> {
    match AtCommands::new(transport).initialize(settings).await {
        Ok(adapter) => Ok(adapter),
        Err(e) => {
            warn!("Initialization on {} failed: {}", transport.port(), e);
            transport.close().await;
            Err(e)
        }
    }
}
