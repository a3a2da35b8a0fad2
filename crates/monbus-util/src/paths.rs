//! Socket path construction shared by services and their peers
//!
//! Every service socket lives at
//! `<root>/monbus_<role-tag><service-name>.sock`. Both ends compute the
//! path with the same function, so a peer only needs the root directory,
//! the hosting process role and the service name to find a service.
//!
//! Default root directory (no root required):
//! - `$MONBUS_ROOT_DIR` if set
//! - `$XDG_RUNTIME_DIR/monbus` if XDG_RUNTIME_DIR is set
//! - `/tmp/monbus-$USER` otherwise

use nix::sys::socket::UnixAddr;
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Default permission bits of a service socket file
pub const DEFAULT_SOCKET_MODE: u32 = 0o660;

/// Environment variable for overriding the socket root directory
pub const MONBUS_ROOT_DIR_ENV: &str = "MONBUS_ROOT_DIR";

/// Fixed prefix of every socket file name
pub const SOCKET_PREFIX: &str = "monbus_";

/// Fixed suffix of every socket file name
pub const SOCKET_SUFFIX: &str = ".sock";

/// Application subdirectory name
const APP_DIR: &str = "monbus";

/// Errors from socket path construction and root directory checks
#[derive(Debug, Error)]
pub enum SocketPathError {
    #[error("Socket path \"{path}\" exceeds the maximum socket path length")]
    TooLong { path: PathBuf },

    #[error("Socket root directory \"{path}\" does not exist")]
    RootMissing { path: PathBuf },

    #[error("Socket root path \"{path}\" is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("Socket root directory \"{path}\" is not accessible: {source}")]
    RootInaccessible {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Cannot inspect socket root directory \"{path}\": {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Role of the process hosting a service
///
/// The role is part of the socket name so that services of the same name
/// run by different process classes on one host do not collide.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Server,
    Proxy,
    Agent,
    #[default]
    None,
}

impl ProcessRole {
    /// Tag inserted between the socket prefix and the service name
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Server => "server_",
            Self::Proxy => "proxy_",
            Self::Agent => "agent_",
            Self::None => "",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Server => "server",
            Self::Proxy => "proxy",
            Self::Agent => "agent",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

impl FromStr for ProcessRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "proxy" => Ok(Self::Proxy),
            "agent" => Ok(Self::Agent),
            "none" | "" => Ok(Self::None),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// A role name that is not one of `server`, `proxy`, `agent` or `none`
#[derive(Debug, Error)]
#[error("Unknown process role: {0}")]
pub struct UnknownRole(pub String);

/// Where the sockets of one process family live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPaths {
    root: PathBuf,
    role: ProcessRole,
}

impl SocketPaths {
    pub fn new(root: impl Into<PathBuf>, role: ProcessRole) -> Self {
        Self {
            root: root.into(),
            role,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Canonical socket path of `service_name`.
    ///
    /// Fails rather than truncating when the path does not fit into a
    /// unix socket address.
    pub fn socket_path(&self, service_name: &str) -> Result<PathBuf, SocketPathError> {
        let file_name = format!(
            "{}{}{}{}",
            SOCKET_PREFIX,
            self.role.tag(),
            service_name,
            SOCKET_SUFFIX
        );
        let path = self.root.join(file_name);

        if UnixAddr::new(&path).is_err() {
            return Err(SocketPathError::TooLong { path });
        }

        Ok(path)
    }

    /// Check that the root directory exists and that this process may
    /// create, connect to and remove sockets in it.
    pub fn check_root_dir(&self) -> Result<(), SocketPathError> {
        let metadata = match std::fs::metadata(&self.root) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SocketPathError::RootMissing {
                    path: self.root.clone(),
                });
            }
            Err(source) => {
                return Err(SocketPathError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        if !metadata.is_dir() {
            return Err(SocketPathError::NotADirectory {
                path: self.root.clone(),
            });
        }

        access(
            &self.root,
            AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK,
        )
        .map_err(|source| SocketPathError::RootInaccessible {
            path: self.root.clone(),
            source,
        })
    }
}

impl Default for SocketPaths {
    fn default() -> Self {
        Self::new(default_root_dir(), ProcessRole::None)
    }
}

/// Get the default socket root directory.
///
/// Order of precedence:
/// 1. `$MONBUS_ROOT_DIR` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/monbus` (if XDG_RUNTIME_DIR is set)
/// 3. `/tmp/monbus-$USER` (fallback)
pub fn default_root_dir() -> PathBuf {
    if let Ok(path) = std::env::var(MONBUS_ROOT_DIR_ENV) {
        return PathBuf::from(path);
    }

    root_dir_without_env()
}

/// Get the root directory without checking the MONBUS_ROOT_DIR env var.
pub fn root_dir_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username))
}
