//! Settings resolution for the demo binaries
//!
//! Values come from an optional config file, then command-line (or
//! environment) overrides are applied on top.

use std::path::{Path, PathBuf};

use monbus_config::{load_config, validate_service_name, BusConfig, ConfigError, ValidationError};
use monbus_util::{default_root_dir, ProcessRole, SocketPaths};
use thiserror::Error;

/// Service name used when neither config nor command line give one
pub const DEFAULT_SERVICE_NAME: &str = "monbusd";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Values that take precedence over the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub root_dir: Option<PathBuf>,
    pub role: Option<ProcessRole>,
    pub service_name: Option<String>,
}

/// Build the bus configuration from `config_path` (if any) and `overrides`
pub fn resolve_settings(
    config_path: Option<&Path>,
    overrides: &Overrides,
) -> Result<BusConfig, SettingsError> {
    let mut config = match config_path {
        Some(path) => load_config(path)?,
        None => BusConfig::with_defaults(
            SocketPaths::new(default_root_dir(), ProcessRole::default()),
            DEFAULT_SERVICE_NAME,
        ),
    };

    if overrides.root_dir.is_some() || overrides.role.is_some() {
        let root = overrides
            .root_dir
            .clone()
            .unwrap_or_else(|| config.paths.root().to_path_buf());
        let role = overrides.role.unwrap_or(config.paths.role());
        config.paths = SocketPaths::new(root, role);
    }

    if let Some(name) = &overrides.service_name {
        validate_service_name(name)?;
        config.service_name = name.clone();
    }

    Ok(config)
}
