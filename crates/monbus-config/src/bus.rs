//! Validated bus configuration

use crate::schema::RawConfig;
use monbus_util::{default_root_dir, IpcLimits, SocketPaths, DEFAULT_SOCKET_MODE};
use std::time::Duration;

/// Default time a peer keeps retrying to connect to a service
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Validated configuration ready for use by services and peers
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Socket root directory and process role
    pub paths: SocketPaths,

    /// Logical service name
    pub service_name: String,

    /// How long peers retry connecting
    pub connect_timeout: Duration,

    /// Permission bits of the socket file
    pub socket_mode: u32,

    /// Connection limits
    pub limits: IpcLimits,
}

impl BusConfig {
    /// Configuration with every tunable at its default
    pub fn with_defaults(paths: SocketPaths, service_name: impl Into<String>) -> Self {
        Self {
            paths,
            service_name: service_name.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            socket_mode: DEFAULT_SOCKET_MODE,
            limits: IpcLimits::default(),
        }
    }

    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        let root = raw.bus.root_dir.unwrap_or_else(default_root_dir);
        let defaults = IpcLimits::default();

        let limits = IpcLimits {
            read_buffer_size: raw
                .limits
                .read_buffer_size
                .unwrap_or(defaults.read_buffer_size),
            bypass_percent: raw.limits.bypass_percent.unwrap_or(defaults.bypass_percent),
            // 0 means unbounded
            max_message_size: raw.limits.max_message_size.filter(|&max| max > 0),
        };

        Self {
            paths: SocketPaths::new(root, raw.bus.role),
            service_name: raw.bus.service_name,
            connect_timeout: raw
                .bus
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            socket_mode: raw.bus.socket_mode.unwrap_or(DEFAULT_SOCKET_MODE),
            limits,
        }
    }
}
