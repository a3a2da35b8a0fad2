//! One peer connection with its receive and transmit queues
//!
//! A `Client` decodes inbound frames into its receive queue and pushes
//! outbound messages through a single in-flight frame followed by a FIFO
//! transmit queue. It is driven by whoever owns the event loop: a service
//! for accepted connections, an `AsyncSocket` for outgoing ones.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::rc::{Rc, Weak};

use monbus_util::{ClientId, IpcLimits, FRAME_HEADER_SIZE};
use tracing::trace;

use crate::connection::Connection;
use crate::event_loop::{Interest, Source};
use crate::frame::{self, FrameAssembler, Message, OutgoingFrame};
use crate::service::ServiceCore;
use crate::{IpcError, IpcResult};

/// Position of a client relative to the service ready-queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    None,
    Queued,
}

/// Outcome of handling a readiness notification
#[derive(Debug)]
pub(crate) enum IoEvent {
    /// Connection is healthy; received messages (if any) are queued
    Continue,
    /// Outbound data is still pending
    NeedsWrite,
    /// Everything queued for sending went out
    Done,
    /// The connection is unusable and must be torn down
    Fatal(IpcError),
}

pub(crate) struct Client {
    id: ClientId,
    connection: Option<Connection>,
    service: Weak<RefCell<ServiceCore>>,
    pub(crate) state: ClientState,
    rx: FrameAssembler,
    rx_queue: VecDeque<Message>,
    tx: Option<OutgoingFrame>,
    tx_queue: VecDeque<Message>,
    read_watch: bool,
    write_watch: bool,
}

impl Client {
    pub fn new(
        connection: Connection,
        limits: &IpcLimits,
        service: Weak<RefCell<ServiceCore>>,
    ) -> Self {
        Self {
            id: ClientId::next(),
            connection: Some(connection),
            service,
            state: ClientState::None,
            rx: FrameAssembler::with_limits(limits),
            rx_queue: VecDeque::new(),
            tx: None,
            tx_queue: VecDeque::new(),
            read_watch: true,
            write_watch: false,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Decode every complete message the socket has to offer without
    /// blocking. Fails on socket errors and on peer disconnect.
    pub fn read(&mut self) -> IpcResult<()> {
        let connection = self.connection.as_mut().ok_or(IpcError::ConnectionClosed)?;

        while connection.read_frame(&mut self.rx)? {
            if let Some(message) = self.rx.take_message() {
                trace!(client_id = %self.id, %message, "Message received");
                self.rx_queue.push_back(message);
            }
        }

        Ok(())
    }

    /// Push pending outbound data until done or the socket would block.
    ///
    /// Succeeds when nothing could be written; `has_unsent()` tells
    /// whether the write watch is still needed.
    pub fn write(&mut self) -> IpcResult<()> {
        let connection = self.connection.as_mut().ok_or(IpcError::ConnectionClosed)?;

        loop {
            if self.tx.is_none() {
                match self.tx_queue.pop_front() {
                    Some(message) => self.tx = Some(OutgoingFrame::from_message(message)),
                    None => break,
                }
            }

            let Some(frame) = self.tx.as_mut() else {
                break;
            };
            connection.flush(frame)?;
            if !frame.is_done() {
                return Ok(());
            }
            self.tx = None;
        }

        self.write_watch = false;
        Ok(())
    }

    /// Send a message, keeping per-client order.
    ///
    /// With nothing in flight the message is written directly; whatever
    /// the socket did not take stays in flight and the write watch is set.
    /// Otherwise the message waits in the transmit queue.
    pub fn send(&mut self, code: u32, payload: &[u8]) -> IpcResult<()> {
        frame::frame_size(payload)?;
        let connection = self.connection.as_mut().ok_or(IpcError::ConnectionClosed)?;

        if self.tx.is_some() {
            self.tx_queue.push_back(Message::new(code, payload));
            return Ok(());
        }

        let written = connection.write_message(code, payload)?;
        if written < FRAME_HEADER_SIZE + payload.len() {
            trace!(client_id = %self.id, code, written, "Partial write, queueing remainder");
            self.tx = Some(OutgoingFrame::partially_sent(code, payload.to_vec(), written));
            self.write_watch = true;
        }

        Ok(())
    }

    pub fn has_unsent(&self) -> bool {
        self.tx.is_some() || !self.tx_queue.is_empty()
    }

    pub fn pop_message(&mut self) -> Option<Message> {
        self.rx_queue.pop_front()
    }

    pub fn has_messages(&self) -> bool {
        !self.rx_queue.is_empty()
    }

    pub fn on_readable(&mut self) -> IoEvent {
        match self.read() {
            Ok(()) => IoEvent::Continue,
            Err(e) => IoEvent::Fatal(e),
        }
    }

    pub fn on_writable(&mut self) -> IoEvent {
        match self.write() {
            Ok(()) if self.has_unsent() => IoEvent::NeedsWrite,
            Ok(()) => IoEvent::Done,
            Err(e) => IoEvent::Fatal(e),
        }
    }

    /// Descriptor and interest for the next wait, `None` once disconnected
    pub fn source(&self) -> Option<Source<'_>> {
        let connection = self.connection.as_ref()?;
        if !self.read_watch && !self.write_watch {
            return None;
        }

        let interest = Interest {
            read: self.read_watch,
            write: self.write_watch,
        };
        Some(Source::new(connection.as_fd(), interest))
    }

    /// Drop the watches and the socket. Unsent data is discarded; already
    /// received messages stay available.
    pub fn disconnect(&mut self) {
        self.read_watch = false;
        self.write_watch = false;
        self.connection = None;
        self.tx = None;
        self.tx_queue.clear();
    }

    /// Disconnect and discard received messages as well
    pub fn discard(&mut self) {
        self.disconnect();
        self.rx_queue.clear();
    }
}

/// Reference-counted handle to a client accepted by a service.
///
/// Cloning the handle adds a reference and dropping it (or calling
/// `release`) removes one. The client itself is freed only after the
/// service and every handle let go of it.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Rc<RefCell<Client>>,
}

impl ClientHandle {
    pub(crate) fn new(inner: Rc<RefCell<Client>>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> ClientId {
        self.inner.borrow().id()
    }

    /// Send a message to the peer, see `IpcService` for delivery rules
    pub fn send(&self, code: u32, payload: &[u8]) -> IpcResult<()> {
        self.inner.borrow_mut().send(code, payload)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().is_connected()
    }

    /// Whether outbound data is waiting for the socket to become writable
    pub fn has_unsent(&self) -> bool {
        self.inner.borrow().has_unsent()
    }

    /// Number of live references: the service's (while registered) plus
    /// every outstanding handle
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Close the connection and remove the client from its service.
    ///
    /// Queued messages in both directions are discarded. The handle stays
    /// valid (and disconnected) until released.
    pub fn close(&self) {
        let (id, service) = {
            let mut client = self.inner.borrow_mut();
            client.discard();
            (client.id(), client.service.clone())
        };

        if let Some(core) = service.upgrade() {
            core.borrow_mut().remove(id);
        }
    }

    /// Give up this reference
    pub fn release(self) {}

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> Weak<RefCell<Client>> {
        Rc::downgrade(&self.inner)
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let client = self.inner.borrow();
        f.debug_struct("ClientHandle")
            .field("id", &client.id)
            .field("connected", &client.is_connected())
            .finish()
    }
}
