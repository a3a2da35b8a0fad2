//! Raw configuration schema (as parsed from TOML)

use monbus_util::ProcessRole;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Service naming and socket placement
    pub bus: RawBusConfig,

    /// Connection limits
    #[serde(default)]
    pub limits: RawLimits,
}

/// Service naming and socket placement
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawBusConfig {
    /// Directory holding the service sockets (default: runtime dir)
    pub root_dir: Option<PathBuf>,

    /// Role of the hosting process
    #[serde(default)]
    pub role: ProcessRole,

    /// Logical service name
    pub service_name: String,

    /// How long peers retry connecting, in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Permission bits applied to the socket file after bind
    pub socket_mode: Option<u32>,
}

/// Connection limits
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawLimits {
    /// Per-connection read-ahead buffer capacity in bytes
    pub read_buffer_size: Option<usize>,

    /// Percentage of the buffer above which payload reads bypass it
    pub bypass_percent: Option<u8>,

    /// Largest accepted payload in bytes; 0 or absent means unbounded
    pub max_message_size: Option<u32>,
}
