//! PeerShare command-line entry point.

mod app;
mod args;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = args::Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting PeerShare");

    let config = config::AppConfig::load(args.config.as_deref())?.with_overrides(&args);
    config.validate()?;
    tracing::info!(
        device = %config.device_name,
        download_dir = %config.download_dir.display(),
        timeout_ms = config.transfer.operation_timeout_ms,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, args))
}
