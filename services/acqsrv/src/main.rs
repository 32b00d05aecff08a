//! FieldPulse Acquisition Service (`acqsrv`)
//!
//! Polls Modbus field devices and persists their snapshots.

use anyhow::Context;
use clap::Parser;
use tracing::info;

use acqsrv::bootstrap::{self, Args};
use acqsrv::{AcquisitionService, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;

    let level = args.effective_log_level(&config.service.logging);
    let _appender_guard = bootstrap::init_logging(&level, &config.service.logging, args.no_color)
        .context("failed to initialize logging")?;

    if args.validate {
        bootstrap::report_validation(&config);
        return Ok(());
    }

    info!("{} starting (config: {})", config.service.name, args.config.display());
    let service = AcquisitionService::build(&config, args.simulate)
        .await
        .context("failed to build acquisition service")?;
    service.start().await;

    bootstrap::wait_for_shutdown().await;
    info!("shutdown signal received");
    service.shutdown().await;

    Ok(())
}
