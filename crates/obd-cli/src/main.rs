//! OBD-II diagnostics - Main Entry Point

use clap::Parser;
use obd_cli::{init_logging, run, Cli, Settings};
use tracing::debug;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    settings.apply_overrides(&cli)?;
    init_logging(settings.log_level(cli.verbose))?;

    debug!("obd-diag v{} with {:?}", env!("CARGO_PKG_VERSION"), settings);
    run(&cli, &settings).await
}
