//! Process bootstrap
//!
//! Command-line arguments, logging initialization and the shutdown signal
//! wait. The returned appender guard must stay alive for the process
//! lifetime or buffered file output is lost.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{AppConfig, LoggingConfig, DEFAULT_CONFIG_PATH};
use crate::error::{AcqError, Result};

/// Service startup arguments
#[derive(Debug, Parser)]
#[command(author, version, about = "Modbus field-device acquisition service")]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short = 'l', long, env = "RUST_LOG")]
    pub log_level: Option<String>,

    /// Run every port on the synthetic transport/reader pair
    #[arg(long)]
    pub simulate: bool,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    pub validate: bool,

    /// Disable colored output (useful for log files)
    #[arg(long)]
    pub no_color: bool,
}

impl Args {
    /// Effective log level: CLI/env first, then the config file.
    pub fn effective_log_level(&self, logging: &LoggingConfig) -> String {
        self.log_level.clone().unwrap_or_else(|| logging.level.clone())
    }
}

/// Initialize the tracing subscriber: console layer always, plus a
/// daily-rolling file layer when a log directory is configured.
pub fn init_logging(
    level: &str,
    logging: &LoggingConfig,
    no_color: bool,
) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| AcqError::config(format!("invalid log level '{level}': {e}")))?;
    let registry = tracing_subscriber::registry().with(filter);

    match &logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "acqsrv.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if logging.json {
                registry
                    .with(fmt::layer().with_ansi(!no_color))
                    .with(fmt::layer().json().with_writer(writer))
                    .init();
            } else {
                registry
                    .with(fmt::layer().with_ansi(!no_color))
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .init();
            }
            Ok(Some(guard))
        },
        None => {
            if logging.json {
                registry.with(fmt::layer().json()).init();
            } else {
                registry.with(fmt::layer().with_ansi(!no_color)).init();
            }
            Ok(None)
        },
    }
}

/// Log a validation report for `--validate` runs.
pub fn report_validation(config: &AppConfig) {
    info!("configuration valid");
    info!(
        "{} port(s), {} device(s), {} register(s)",
        config.ports.len(),
        config.device_count(),
        config.register_count()
    );
    for port in &config.ports {
        info!("  port {}: {} device(s)", port.name, port.devices.len());
        for device in &port.devices {
            info!(
                "    {} (slave {}): {} register(s), save every {}ms",
                device.slug,
                device.slave_id,
                device.registers.len(),
                device.save_interval_ms
            );
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM on Unix)
pub async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}, Ctrl+C only");
                None
            },
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(mut sig) = term_signal {
                    sig.recv().await;
                } else {
                    std::future::pending::<()>().await
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ============================================================================
// Tests
// ============================================================================
