//! Config validation CLI tool
//!
//! Validates a monbus configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("Usage: validate-config <config-file>");
            eprintln!();
            eprintln!("Validates a monbus configuration file.");
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match monbus_config::load_config(&config_path) {
        Ok(bus) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", monbus_config::CURRENT_CONFIG_VERSION);
            println!("  Service: {}", bus.service_name);
            println!("  Role: {}", bus.paths.role());
            match bus.paths.socket_path(&bus.service_name) {
                Ok(path) => println!("  Socket: {}", path.display()),
                Err(e) => println!("  Socket: {}", e),
            }
            println!("  Read buffer: {} bytes", bus.limits.read_buffer_size);
            match bus.limits.max_message_size {
                Some(max) => println!("  Max message: {} bytes", max),
                None => println!("  Max message: unbounded"),
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                monbus_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                monbus_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                monbus_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                monbus_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        monbus_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
