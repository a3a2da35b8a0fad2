//! Message bus IPC for monbus
//!
//! Provides:
//! - Length-prefixed framing (`u32` code, `u32` size, payload)
//! - A single-threaded, poll-based event loop with a one-shot timer
//! - `IpcService`: a named Unix socket service delivering messages in
//!   arrival order across clients
//! - `IpcSocket`: a blocking client socket for request/reply exchanges
//! - `AsyncSocket`: a non-blocking client socket with queued sends

mod async_socket;
mod client;
mod connection;
mod event_loop;
pub mod frame;
mod service;
mod socket;

pub use async_socket::*;
pub use client::ClientHandle;
pub use event_loop::*;
pub use frame::{FrameAssembler, FrameHeader, Message};
pub use service::*;
pub use socket::*;

use std::path::PathBuf;

use monbus_util::SocketPathError;
use thiserror::Error;

/// IPC errors
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Path(#[from] SocketPathError),

    #[error("Socket file is not writable: {}", path.display())]
    NotWritable { path: PathBuf },

    #[error("Service {service} is already running at {}", path.display())]
    AlreadyRunning { service: String, path: PathBuf },

    #[error("Cannot connect to service {service} at {}", path.display())]
    ConnectFailed {
        service: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Message of {size} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { size: u64, max: u32 },

    #[error("Cannot switch socket to non-blocking mode")]
    NonBlocking(#[source] std::io::Error),

    #[error("Service is closed")]
    ServiceClosed,
}

pub type IpcResult<T> = Result<T, IpcError>;
