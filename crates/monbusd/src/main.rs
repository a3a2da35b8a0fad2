//! monbusd - demo service host for monbus
//!
//! Hosts one IPC service and answers echo, stats and shutdown requests
//! until a client asks it to stop.

use anyhow::{Context, Result};
use clap::Parser;
use monbus_ipc::{IpcService, ServiceOptions};
use monbus_util::{ProcessRole, Timeout, MONBUS_ROOT_DIR_ENV};
use monbusd::{resolve_settings, serve, Dispatcher, Overrides};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// monbusd - demo service host for the monbus message bus
#[derive(Parser, Debug)]
#[command(name = "monbusd")]
#[command(about = "Demo service host for the monbus message bus", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket root directory override (or set MONBUS_ROOT_DIR env var)
    #[arg(short, long, env = MONBUS_ROOT_DIR_ENV)]
    root_dir: Option<PathBuf>,

    /// Service name override (or set MONBUS_SERVICE env var)
    #[arg(short, long, env = "MONBUS_SERVICE")]
    service: Option<String>,

    /// Process role: server, proxy, agent or none
    #[arg(long)]
    role: Option<ProcessRole>,

    /// Seconds between idle wakeups of the service loop
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    tick_secs: u64,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "monbusd starting");

    let overrides = Overrides {
        root_dir: args.root_dir.clone(),
        role: args.role,
        service_name: args.service.clone(),
    };
    let config = resolve_settings(args.config.as_deref(), &overrides)
        .context("Failed to resolve settings")?;

    std::fs::create_dir_all(config.paths.root()).with_context(|| {
        format!(
            "Failed to create socket directory {}",
            config.paths.root().display()
        )
    })?;

    let options = ServiceOptions {
        limits: config.limits,
        socket_mode: config.socket_mode,
    };
    let mut service = IpcService::start_with(&config.paths, &config.service_name, &options)
        .with_context(|| format!("Failed to start service {}", config.service_name))?;

    let mut dispatcher = Dispatcher::new();
    let result = serve(&mut service, &mut dispatcher, Timeout::from_secs(args.tick_secs));

    service.close();
    info!(
        messages_handled = dispatcher.messages_handled(),
        "monbusd stopped"
    );

    result.context("Service loop failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_defaults_to_one_second() {
        let args = Args::try_parse_from(["monbusd"]).unwrap();
        assert_eq!(args.tick_secs, 1);
    }

    #[test]
    fn zero_tick_is_rejected() {
        assert!(Args::try_parse_from(["monbusd", "--tick-secs", "0"]).is_err());
        assert!(Args::try_parse_from(["monbusd", "--tick-secs", "5"]).is_ok());
    }
}
