//! Client-side connection driven by a private event loop
//!
//! An `AsyncSocket` is for processes that talk to another process's
//! service over a long-lived connection. Sends never block: what the
//! socket does not take right away is queued and pushed out by the loop
//! while `recv()` or `flush()` run.

use std::rc::Weak;
use std::time::{Duration, Instant};

use monbus_util::{IpcLimits, SocketPaths, Timeout};
use tracing::{debug, warn};

use crate::client::{Client, IoEvent};
use crate::event_loop::EventLoop;
use crate::frame::Message;
use crate::socket::IpcSocket;
use crate::{IpcError, IpcResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsyncState {
    None,
    Timeout,
    Error,
}

/// Non-blocking connection to a service with its own event loop
pub struct AsyncSocket {
    client: Client,
    event_loop: EventLoop,
    state: AsyncState,
    /// Error latched by the I/O handlers until reported
    error: Option<IpcError>,
}

impl AsyncSocket {
    /// Connect to `service_name`, retrying until `timeout` elapses
    pub fn open(paths: &SocketPaths, service_name: &str, timeout: Duration) -> IpcResult<Self> {
        Self::open_with(paths, service_name, timeout, &IpcLimits::default())
    }

    pub fn open_with(
        paths: &SocketPaths,
        service_name: &str,
        timeout: Duration,
        limits: &IpcLimits,
    ) -> IpcResult<Self> {
        let connection = IpcSocket::open_with(paths, service_name, timeout, limits)?.into_connection();
        connection.set_nonblocking()?;

        Ok(Self {
            client: Client::new(connection, limits, Weak::new()),
            event_loop: EventLoop::new(),
            state: AsyncState::None,
            error: None,
        })
    }

    /// One request, one reply: open, send, wait for the answer, close.
    ///
    /// `timeout` bounds the whole exchange, not each step.
    pub fn exchange(
        paths: &SocketPaths,
        service_name: &str,
        code: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> IpcResult<Message> {
        let deadline = Instant::now().checked_add(timeout);
        let remaining = || Timeout::from(deadline.map(|d| d.saturating_duration_since(Instant::now())));

        let mut socket = Self::open(paths, service_name, timeout)?;
        socket.send(code, payload)?;
        socket.flush(remaining())?;

        match socket.recv(remaining())? {
            Some(message) => Ok(message),
            None => Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into()),
        }
    }

    /// Queue a message; whatever cannot be written now goes out later
    pub fn send(&mut self, code: u32, payload: &[u8]) -> IpcResult<()> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.client.send(code, payload)
    }

    /// Receive the next message.
    ///
    /// Returns `Ok(None)` on timeout. A connection error observed by an
    /// earlier call is reported before anything else is attempted.
    pub fn recv(&mut self, timeout: Timeout) -> IpcResult<Option<Message>> {
        if let Some(message) = self.client.pop_message() {
            return Ok(Some(message));
        }

        if self.state != AsyncState::Error {
            self.state = AsyncState::None;
            self.event_loop.arm_timer(timeout);
            let result = self.run_until(|client| client.has_messages());
            self.event_loop.disarm_timer();
            result?;
        }

        if let Some(message) = self.client.pop_message() {
            return Ok(Some(message));
        }

        match self.state {
            AsyncState::Error => Err(self.take_error()),
            _ => {
                self.state = AsyncState::None;
                Ok(None)
            }
        }
    }

    /// Drive the loop until every queued byte is written or `timeout`
    /// elapses. Running out of time is not an error; `check_unsent()`
    /// tells whether data is left.
    pub fn flush(&mut self, timeout: Timeout) -> IpcResult<()> {
        if !self.client.has_unsent() {
            return Ok(());
        }

        if self.state != AsyncState::Error {
            self.state = AsyncState::None;
            self.event_loop.arm_timer(timeout);
            let result = self.run_until(|client| !client.has_unsent());
            self.event_loop.disarm_timer();
            result?;
        }

        match self.state {
            AsyncState::Error => Err(self.take_error()),
            _ => {
                self.state = AsyncState::None;
                Ok(())
            }
        }
    }

    /// Whether outbound data is still buffered
    pub fn check_unsent(&self) -> bool {
        self.client.has_unsent()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn close(self) {}

    fn run_until(&mut self, done: impl Fn(&Client) -> bool) -> IpcResult<()> {
        loop {
            let Some(source) = self.client.source() else {
                self.fail(IpcError::ConnectionClosed);
                return Ok(());
            };

            let ready = self.event_loop.wait(&[source])?[0];

            if ready.readable {
                if let IoEvent::Fatal(e) = self.client.on_readable() {
                    self.fail(e);
                    return Ok(());
                }
            }

            if ready.writable {
                if let IoEvent::Fatal(e) = self.client.on_writable() {
                    self.fail(e);
                    return Ok(());
                }
            }

            if done(&self.client) {
                return Ok(());
            }

            if self.event_loop.timer_expired() {
                self.state = AsyncState::Timeout;
                return Ok(());
            }
        }
    }

    /// Latch a connection error and drop the connection
    fn fail(&mut self, error: IpcError) {
        match &error {
            IpcError::ConnectionClosed => debug!("Service closed the connection"),
            e => warn!(error = %e, "IPC connection failed"),
        }

        self.client.disconnect();
        self.state = AsyncState::Error;
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn take_error(&mut self) -> IpcError {
        self.error.take().unwrap_or(IpcError::ConnectionClosed)
    }
}
