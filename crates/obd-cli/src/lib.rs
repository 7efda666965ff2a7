//! `obd-diag` command-line front end
//!
//! Loads settings, installs logging, connects (or starts the emulator) and
//! runs one subcommand.

pub mod cli;
pub mod commands;
pub mod settings;

pub use cli::{Cli, Command};
pub use settings::Settings;

use anyhow::Context;
use obd_protocol::ObdClient;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Initialize logging
///
/// Logs go to stderr; stdout carries command output.
pub fn init_logging(level: Level) -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")
}

/// Run the parsed command line with resolved settings
pub async fn run(cli: &Cli, settings: &Settings) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    if cli.command == Command::Ports {
        return commands::list_ports(&mut stdout, cli.json);
    }

    let config = settings.obd_config();
    let mut client = if cli.mock {
        ObdClient::mock(&config).await?
    } else {
        ObdClient::connect(&config)
            .await
            .with_context(|| format!("no adapter on {}", config.connection.port))?
    };
    info!(
        "Connected to {} on {}",
        client.adapter_info().version,
        client.port()
    );

    let result = commands::execute(&mut client, &cli.command, &settings.poller, cli.json, &mut stdout).await;
    client.disconnect().await;
    result
}
