//! monbus-ping - send one request to a monbus service and print the reply

use anyhow::{Context, Result};
use clap::Parser;
use monbus_ipc::{AsyncSocket, IpcSocket};
use monbus_util::{ProcessRole, MONBUS_ROOT_DIR_ENV};
use monbusd::{code_name, resolve_settings, Overrides, ECHO};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "monbus-ping")]
#[command(about = "Send one request to a monbus service and print the reply", long_about = None)]
struct Args {
    /// Payload sent with the request
    #[arg(default_value = "ping")]
    payload: String,

    /// Request code (1 echo, 3 stats, 5 shutdown)
    #[arg(long, default_value_t = ECHO)]
    code: u32,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Socket root directory override (or set MONBUS_ROOT_DIR env var)
    #[arg(short, long, env = MONBUS_ROOT_DIR_ENV)]
    root_dir: Option<PathBuf>,

    /// Service name (or set MONBUS_SERVICE env var)
    #[arg(short, long, env = "MONBUS_SERVICE")]
    service: Option<String>,

    /// Role of the process hosting the service
    #[arg(long)]
    role: Option<ProcessRole>,

    /// Connect timeout in milliseconds (default: from config)
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    /// Use the non-blocking socket instead of the blocking one
    #[arg(long)]
    nonblocking: bool,

    /// Log level
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let overrides = Overrides {
        root_dir: args.root_dir.clone(),
        role: args.role,
        service_name: args.service.clone(),
    };
    let config = resolve_settings(args.config.as_deref(), &overrides)
        .context("Failed to resolve settings")?;
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(config.connect_timeout);

    let result = if args.nonblocking {
        AsyncSocket::exchange(
            &config.paths,
            &config.service_name,
            args.code,
            args.payload.as_bytes(),
            timeout,
        )
    } else {
        IpcSocket::open_with(&config.paths, &config.service_name, timeout, &config.limits)
            .and_then(|mut socket| socket.exchange(args.code, args.payload.as_bytes()))
    };
    let reply = result.with_context(|| format!("Request to {} failed", config.service_name))?;

    println!("{} ({})", code_name(reply.code()), reply.code());
    if !reply.payload().is_empty() {
        println!("{}", String::from_utf8_lossy(reply.payload()));
    }

    Ok(())
}
