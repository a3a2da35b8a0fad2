//! Blocking client socket for one-shot request/reply exchanges

use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use monbus_util::{IpcLimits, SocketPaths, FRAME_HEADER_SIZE};
use tracing::debug;

use crate::connection::Connection;
use crate::frame::{FrameAssembler, Message, OutgoingFrame};
use crate::{IpcError, IpcResult};

/// Granularity of connection retries
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Blocking connection to a service
pub struct IpcSocket {
    connection: Connection,
    rx: FrameAssembler,
}

impl IpcSocket {
    /// Connect to `service_name`, retrying until `timeout` elapses.
    ///
    /// A zero timeout fails at once if the service does not accept the
    /// connection right away.
    pub fn open(paths: &SocketPaths, service_name: &str, timeout: Duration) -> IpcResult<Self> {
        Self::open_with(paths, service_name, timeout, &IpcLimits::default())
    }

    pub fn open_with(
        paths: &SocketPaths,
        service_name: &str,
        timeout: Duration,
        limits: &IpcLimits,
    ) -> IpcResult<Self> {
        let path = paths.socket_path(service_name)?;
        let start = Instant::now();

        let stream = loop {
            match UnixStream::connect(&path) {
                Ok(stream) => break stream,
                Err(source) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(IpcError::ConnectFailed {
                            service: service_name.to_string(),
                            path,
                            source,
                        });
                    }
                    std::thread::sleep(CONNECT_RETRY_INTERVAL.min(timeout - elapsed));
                }
            }
        };

        debug!(service = service_name, path = %path.display(), "Connected to service");

        Ok(Self::from_stream(stream, limits))
    }

    /// Wrap an already connected blocking stream
    pub fn from_stream(stream: UnixStream, limits: &IpcLimits) -> Self {
        Self {
            connection: Connection::new(stream, limits),
            rx: FrameAssembler::with_limits(limits),
        }
    }

    /// Write one framed message, returning the number of bytes written
    pub fn write(&mut self, code: u32, payload: &[u8]) -> IpcResult<usize> {
        let total = FRAME_HEADER_SIZE + payload.len();
        let written = self.connection.write_message(code, payload)?;

        if written < total {
            let mut frame = OutgoingFrame::partially_sent(code, payload.to_vec(), written);
            while !frame.is_done() {
                let before = frame.remaining();
                self.connection.flush(&mut frame)?;
                if frame.remaining() == before {
                    // Only a send timeout stops a blocking socket
                    return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock).into());
                }
            }
        }

        Ok(total)
    }

    /// Read exactly one framed message
    pub fn read(&mut self) -> IpcResult<Message> {
        if !self.connection.read_frame(&mut self.rx)? {
            // Only a receive timeout stops a blocking socket
            return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock).into());
        }

        self.rx.take_message().ok_or(IpcError::ConnectionClosed)
    }

    /// Write a request and read its reply
    pub fn exchange(&mut self, code: u32, payload: &[u8]) -> IpcResult<Message> {
        self.write(code, payload)?;
        self.read()
    }

    pub fn close(self) {}

    pub(crate) fn into_connection(self) -> Connection {
        self.connection
    }
}
