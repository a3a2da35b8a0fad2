//! IPC service: listening socket, event loop and client registry
//!
//! The service accepts connections on its canonical socket path, decodes
//! inbound frames into per-client receive queues and hands messages out
//! through `recv()`, one message and one client handle at a time. Clients
//! with pending messages wait in a ready-queue, at most once each.

use std::cell::{Ref, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use monbus_util::{ClientId, IpcLimits, SocketPaths, Timeout, DEFAULT_SOCKET_MODE};
use nix::unistd::{access, AccessFlags};
use tracing::{debug, info, warn};

use crate::client::{Client, ClientHandle, ClientState, IoEvent};
use crate::connection::Connection;
use crate::event_loop::{EventLoop, Interest, Source};
use crate::frame::Message;
use crate::{IpcError, IpcResult};

/// Tunables for a service
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub limits: IpcLimits,
    /// Permission bits applied to the socket file after bind
    pub socket_mode: u32,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            limits: IpcLimits::default(),
            socket_mode: DEFAULT_SOCKET_MODE,
        }
    }
}

/// How `recv()` obtained its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// A client was already waiting; the event loop did not run
    Immediate,
    /// The event loop ran and produced a client
    Wait,
    /// Nothing arrived before the timeout
    Timeout,
}

/// A message handed out by `recv()` together with its sender
#[derive(Debug)]
pub struct Delivery {
    /// New reference to the sender; release it when done
    pub client: ClientHandle,
    /// Oldest queued message, `None` when the client only reports that its
    /// connection closed
    pub message: Option<Message>,
}

/// Result of `IpcService::recv`
#[derive(Debug)]
pub enum RecvOutcome {
    Immediate(Delivery),
    Wait(Delivery),
    Timeout,
}

impl RecvOutcome {
    pub fn status(&self) -> RecvStatus {
        match self {
            Self::Immediate(_) => RecvStatus::Immediate,
            Self::Wait(_) => RecvStatus::Wait,
            Self::Timeout => RecvStatus::Timeout,
        }
    }

    pub fn into_delivery(self) -> Option<Delivery> {
        match self {
            Self::Immediate(delivery) | Self::Wait(delivery) => Some(delivery),
            Self::Timeout => None,
        }
    }
}

/// Client registry shared with client handles (which hold it weakly)
#[derive(Default)]
pub(crate) struct ServiceCore {
    clients: HashMap<ClientId, Rc<RefCell<Client>>>,
    /// Clients with pending messages or a closed connection, oldest first
    ready: VecDeque<ClientId>,
}

impl ServiceCore {
    /// Queue `client` for `recv()` unless it is already queued
    fn push_ready(&mut self, client: &mut Client) {
        if client.state == ClientState::Queued {
            return;
        }
        client.state = ClientState::Queued;
        self.ready.push_back(client.id());
    }

    fn pop_ready(&mut self) -> Option<Rc<RefCell<Client>>> {
        while let Some(id) = self.ready.pop_front() {
            if let Some(client) = self.clients.get(&id) {
                client.borrow_mut().state = ClientState::None;
                return Some(client.clone());
            }
        }
        None
    }

    pub(crate) fn remove(&mut self, id: ClientId) -> Option<Rc<RefCell<Client>>> {
        self.ready.retain(|queued| *queued != id);
        self.clients.remove(&id)
    }
}

/// IPC service listening on a unix socket
pub struct IpcService {
    name: String,
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    event_loop: EventLoop,
    core: Rc<RefCell<ServiceCore>>,
    limits: IpcLimits,
}

impl IpcService {
    /// Start `service_name` with default options
    pub fn start(paths: &SocketPaths, service_name: &str) -> IpcResult<Self> {
        Self::start_with(paths, service_name, &ServiceOptions::default())
    }

    /// Bind and listen on the canonical socket path of `service_name`.
    ///
    /// A leftover socket file is removed, unless it is not writable or a
    /// live service still answers on it.
    pub fn start_with(
        paths: &SocketPaths,
        service_name: &str,
        options: &ServiceOptions,
    ) -> IpcResult<Self> {
        paths.check_root_dir()?;
        let socket_path = paths.socket_path(service_name)?;

        if socket_path.symlink_metadata().is_ok() {
            if access(&socket_path, AccessFlags::W_OK).is_err() {
                return Err(IpcError::NotWritable { path: socket_path });
            }

            if UnixStream::connect(&socket_path).is_ok() {
                return Err(IpcError::AlreadyRunning {
                    service: service_name.to_string(),
                    path: socket_path,
                });
            }

            debug!(path = %socket_path.display(), "Removing stale socket");
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(
            &socket_path,
            std::fs::Permissions::from_mode(options.socket_mode),
        )?;
        listener.set_nonblocking(true).map_err(|e| {
            tracing::error!(error = %e, "Cannot switch listening socket to non-blocking mode");
            IpcError::NonBlocking(e)
        })?;

        info!(
            service = service_name,
            path = %socket_path.display(),
            "IPC service listening"
        );

        Ok(Self {
            name: service_name.to_string(),
            socket_path,
            listener: Some(listener),
            event_loop: EventLoop::new(),
            core: Rc::new(RefCell::new(ServiceCore::default())),
            limits: options.limits,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.core.borrow().clients.len()
    }

    /// New handle to a registered client
    pub fn client_by_id(&self, id: ClientId) -> Option<ClientHandle> {
        self.core
            .borrow()
            .clients
            .get(&id)
            .map(|client| ClientHandle::new(client.clone()))
    }

    /// Receive the next message from any client.
    ///
    /// Serves the ready-queue without touching the event loop when it is
    /// not empty; otherwise runs the loop until a client becomes ready or
    /// `timeout` elapses. A disconnected client is delivered once its
    /// received messages are drained, with `message: None` if none were
    /// left, and is then dropped from the registry.
    pub fn recv(&mut self, timeout: Timeout) -> IpcResult<RecvOutcome> {
        if self.listener.is_none() {
            return Err(IpcError::ServiceClosed);
        }

        let waited = self.core.borrow().ready.is_empty();
        if waited {
            self.event_loop.arm_timer(timeout);
            let result = self.run_until_ready();
            self.event_loop.disarm_timer();
            result?;
        }

        let mut core = self.core.borrow_mut();
        let Some(client) = core.pop_ready() else {
            return Ok(RecvOutcome::Timeout);
        };

        let message = {
            let mut inner = client.borrow_mut();
            let message = inner.pop_message();
            if inner.has_messages() {
                core.push_ready(&mut inner);
            } else if !inner.is_connected() {
                debug!(client_id = %inner.id(), "Dropping disconnected client");
                core.remove(inner.id());
            }
            message
        };

        let delivery = Delivery {
            client: ClientHandle::new(client),
            message,
        };

        Ok(if waited {
            RecvOutcome::Wait(delivery)
        } else {
            RecvOutcome::Immediate(delivery)
        })
    }

    fn run_until_ready(&mut self) -> IpcResult<()> {
        loop {
            self.poll_once()?;

            if !self.core.borrow().ready.is_empty() || self.event_loop.timer_expired() {
                return Ok(());
            }
        }
    }

    /// One wait on the listener and every connected client, then dispatch
    fn poll_once(&mut self) -> IpcResult<()> {
        let listener = self.listener.as_ref().ok_or(IpcError::ServiceClosed)?;

        let clients: Vec<Rc<RefCell<Client>>> =
            self.core.borrow().clients.values().cloned().collect();

        let (accept_ready, ready_clients) = {
            let guards: Vec<Ref<'_, Client>> = clients.iter().map(|c| c.borrow()).collect();

            let mut sources = vec![Source::new(listener.as_fd(), Interest::READ)];
            let mut owners = Vec::with_capacity(guards.len());
            for (index, guard) in guards.iter().enumerate() {
                if let Some(source) = guard.source() {
                    sources.push(source);
                    owners.push(index);
                }
            }

            let readiness = self.event_loop.wait(&sources)?;
            let ready_clients: Vec<_> = owners
                .into_iter()
                .zip(readiness[1..].iter().copied())
                .filter(|(_, ready)| !ready.is_empty())
                .collect();

            (readiness[0].readable, ready_clients)
        };

        if accept_ready {
            self.accept_all()?;
        }

        for (index, ready) in ready_clients {
            self.dispatch(&clients[index], ready.readable, ready.writable);
        }

        Ok(())
    }

    fn dispatch(&self, client: &Rc<RefCell<Client>>, readable: bool, writable: bool) {
        let mut inner = client.borrow_mut();
        let mut core = self.core.borrow_mut();

        if readable {
            match inner.on_readable() {
                IoEvent::Fatal(e) => {
                    log_disconnect(inner.id(), &e);
                    inner.disconnect();
                    core.push_ready(&mut inner);
                    return;
                }
                _ => {
                    if inner.has_messages() {
                        core.push_ready(&mut inner);
                    }
                }
            }
        }

        if writable && inner.is_connected() {
            if let IoEvent::Fatal(e) = inner.on_writable() {
                log_disconnect(inner.id(), &e);
                inner.disconnect();
                core.push_ready(&mut inner);
            }
        }
    }

    fn accept_all(&self) -> IpcResult<()> {
        let listener = self.listener.as_ref().ok_or(IpcError::ServiceClosed)?;

        loop {
            let stream = match listener.accept() {
                Ok((stream, _)) => stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    return Ok(());
                }
            };

            let connection = Connection::new(stream, &self.limits);
            connection.set_nonblocking()?;
            let uid = get_peer_uid(connection.stream());

            let client = Client::new(connection, &self.limits, Rc::downgrade(&self.core));
            debug!(client_id = %client.id(), uid = ?uid, "Client connected");

            self.core
                .borrow_mut()
                .clients
                .insert(client.id(), Rc::new(RefCell::new(client)));
        }
    }

    /// Stop the service.
    ///
    /// Every client is disconnected and its queues discarded, regardless
    /// of outstanding handles, and the socket file is removed.
    pub fn close(&mut self) {
        if self.listener.take().is_none() {
            return;
        }

        let mut core = self.core.borrow_mut();
        for client in core.clients.values() {
            client.borrow_mut().discard();
        }
        core.clients.clear();
        core.ready.clear();
        drop(core);

        self.event_loop.disarm_timer();

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), error = %e, "Failed to remove socket");
            }
        }

        info!(service = %self.name, "IPC service closed");
    }
}

impl Drop for IpcService {
    fn drop(&mut self) {
        self.close();
    }
}

fn log_disconnect(id: ClientId, error: &IpcError) {
    match error {
        IpcError::ConnectionClosed => debug!(client_id = %id, "Client disconnected"),
        e => warn!(client_id = %id, error = %e, "Client connection failed"),
    }
}

/// Get peer UID from Unix socket
fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
    let fd = stream.as_fd();

    match nix::sys::socket::getsockopt(&fd, nix::sys::socket::sockopt::PeerCredentials) {
        Ok(cred) => Some(cred.uid()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame, IpcSocket};
    use monbus_util::ProcessRole;
    use std::io::Write;
    use std::time::{Duration, Instant};
    use tempfile::{tempdir, TempDir};

    fn start(name: &str) -> (TempDir, SocketPaths, IpcService) {
        let dir = tempdir().unwrap();
        let paths = SocketPaths::new(dir.path(), ProcessRole::Server);
        let service = IpcService::start(&paths, name).unwrap();
        (dir, paths, service)
    }

    fn connect(paths: &SocketPaths, name: &str) -> IpcSocket {
        IpcSocket::open(paths, name, Duration::from_secs(1)).unwrap()
    }

    fn recv_delivery(service: &mut IpcService) -> Delivery {
        service
            .recv(Timeout::from_secs(5))
            .unwrap()
            .into_delivery()
            .expect("expected a delivery")
    }

    #[test]
    fn test_service_start() {
        let (_dir, paths, service) = start("test");

        assert!(service.socket_path().exists());
        assert_eq!(
            service.socket_path(),
            paths.socket_path("test").unwrap().as_path()
        );

        let mode = std::fs::metadata(service.socket_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, DEFAULT_SOCKET_MODE);
    }

    #[test]
    fn unwritable_socket_file_is_refused() {
        // Root bypasses file permissions
        if nix::unistd::geteuid().is_root() {
            return;
        }

        let dir = tempdir().unwrap();
        let paths = SocketPaths::new(dir.path(), ProcessRole::Server);
        let path = paths.socket_path("locked").unwrap();
        std::fs::write(&path, b"").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o444)).unwrap();

        let result = IpcService::start(&paths, "locked");
        assert!(matches!(result, Err(IpcError::NotWritable { .. })));
        assert!(path.exists());
    }

    #[test]
    fn huge_timeout_waits_without_deadline() {
        let (_dir, paths, mut service) = start("patient");
        let mut peer = connect(&paths, "patient");
        peer.write(1, b"x").unwrap();

        let outcome = service.recv(Timeout::from_secs(u64::MAX)).unwrap();
        let delivery = outcome.into_delivery().unwrap();
        assert_eq!(delivery.message, Some(Message::new(1, "x")));
        assert!(!service.event_loop().is_timer_armed());
    }

    #[test]
    fn immediate_recv_on_idle_service_times_out_without_blocking() {
        let (_dir, _paths, mut service) = start("idle");

        let outcome = service.recv(Timeout::Immediate).unwrap();
        assert_eq!(outcome.status(), RecvStatus::Timeout);
        assert_eq!(service.event_loop().blocking_waits(), 0);
        assert!(!service.event_loop().is_timer_armed());
    }

    #[test]
    fn bounded_recv_waits_full_timeout() {
        let (_dir, _paths, mut service) = start("bounded");
        let timeout = Duration::from_millis(100);

        let start = Instant::now();
        let outcome = service.recv(Timeout::After(timeout)).unwrap();
        assert!(matches!(outcome, RecvOutcome::Timeout));
        assert!(start.elapsed() >= timeout);
        assert!(!service.event_loop().is_timer_armed());
    }

    #[test]
    fn request_and_reply() {
        let (_dir, paths, mut service) = start("echo");
        let mut peer = connect(&paths, "echo");

        peer.write(1, b"ping").unwrap();

        let outcome = service.recv(Timeout::from_secs(5)).unwrap();
        assert_eq!(outcome.status(), RecvStatus::Wait);
        let delivery = outcome.into_delivery().unwrap();
        assert_eq!(delivery.message, Some(Message::new(1, "ping")));

        delivery.client.send(2, b"pong").unwrap();
        delivery.client.release();

        assert_eq!(peer.read().unwrap(), Message::new(2, "pong"));
    }

    #[test]
    fn messages_arrive_in_send_order_and_client_is_queued_once() {
        let (_dir, paths, mut service) = start("fifo");
        let mut peer = connect(&paths, "fifo");

        for code in 0..20u32 {
            peer.write(code, &code.to_ne_bytes()).unwrap();
        }

        let first = recv_delivery(&mut service);
        assert_eq!(first.message.as_ref().map(Message::code), Some(0));
        assert_eq!(service.core.borrow().ready.len(), 1);

        let mut codes = vec![0];
        loop {
            match service.recv(Timeout::Immediate).unwrap() {
                RecvOutcome::Immediate(delivery) => {
                    assert_eq!(delivery.client.id(), first.client.id());
                    assert!(service.core.borrow().ready.len() <= 1);
                    codes.push(delivery.message.unwrap().code());
                }
                RecvOutcome::Wait(_) => panic!("ready-queue should serve the rest"),
                RecvOutcome::Timeout => break,
            }
        }

        assert_eq!(codes, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn peer_disconnect_is_delivered_and_client_removed() {
        let (_dir, paths, mut service) = start("hangup");
        let peer = connect(&paths, "hangup");

        // Accept the connection
        service.recv(Timeout::from_millis(50)).unwrap();
        assert_eq!(service.client_count(), 1);

        peer.close();

        let delivery = recv_delivery(&mut service);
        assert!(delivery.message.is_none());
        assert!(!delivery.client.is_connected());
        assert!(matches!(
            delivery.client.send(1, b"late"),
            Err(IpcError::ConnectionClosed)
        ));
        assert_eq!(service.client_count(), 0);
    }

    #[test]
    fn handle_outlives_socket_error() {
        let (_dir, paths, mut service) = start("refs");
        let mut peer = connect(&paths, "refs");

        peer.write(1, b"one").unwrap();
        peer.write(2, b"two").unwrap();

        let first = recv_delivery(&mut service);
        let weak = first.client.downgrade();
        assert_eq!(first.client.refcount(), 2);

        let second = recv_delivery(&mut service);
        assert_eq!(second.message, Some(Message::new(2, "two")));

        // Connection dies while handles are held
        peer.close();
        let hangup = recv_delivery(&mut service);
        assert!(hangup.message.is_none());
        assert_eq!(service.client_count(), 0);

        drop(second);
        drop(hangup);
        assert!(weak.upgrade().is_some());
        assert_eq!(first.client.refcount(), 1);

        first.client.release();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn client_close_removes_it_from_service() {
        let (_dir, paths, mut service) = start("closer");
        let mut peer = connect(&paths, "closer");

        peer.write(1, b"a").unwrap();
        peer.write(2, b"b").unwrap();

        let delivery = recv_delivery(&mut service);
        let id = delivery.client.id();
        assert!(service.client_by_id(id).is_some());

        delivery.client.close();
        assert!(service.client_by_id(id).is_none());
        assert!(service.core.borrow().ready.is_empty());
        assert!(matches!(
            service.recv(Timeout::Immediate).unwrap(),
            RecvOutcome::Timeout
        ));
        assert!(matches!(peer.read(), Err(IpcError::ConnectionClosed)));
    }

    #[test]
    fn second_instance_is_refused() {
        let (_dir, paths, _service) = start("unique");

        let result = IpcService::start(&paths, "unique");
        assert!(matches!(result, Err(IpcError::AlreadyRunning { .. })));
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempdir().unwrap();
        let paths = SocketPaths::new(dir.path(), ProcessRole::Proxy);
        let path = paths.socket_path("stale").unwrap();

        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let service = IpcService::start(&paths, "stale").unwrap();
        assert_eq!(service.socket_path(), path.as_path());
    }

    #[test]
    fn close_unlinks_socket_and_disconnects_handles() {
        let (_dir, paths, mut service) = start("shutdown");
        let mut peer = connect(&paths, "shutdown");
        peer.write(1, b"hello").unwrap();

        let delivery = recv_delivery(&mut service);
        let path = service.socket_path().to_path_buf();

        service.close();
        assert!(!path.exists());
        assert!(!delivery.client.is_connected());
        assert_eq!(delivery.client.refcount(), 1);
        assert!(matches!(
            service.recv(Timeout::Immediate),
            Err(IpcError::ServiceClosed)
        ));
    }

    #[test]
    fn garbage_size_field_drops_client_when_limited() {
        let dir = tempdir().unwrap();
        let paths = SocketPaths::new(dir.path(), ProcessRole::None);
        let options = ServiceOptions {
            limits: IpcLimits {
                max_message_size: Some(1024),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut service = IpcService::start_with(&paths, "limited", &options).unwrap();

        let mut raw = UnixStream::connect(paths.socket_path("limited").unwrap()).unwrap();
        raw.write_all(&frame::FrameHeader::new(1, u32::MAX).to_bytes())
            .unwrap();

        let delivery = recv_delivery(&mut service);
        assert!(delivery.message.is_none());
        assert!(!delivery.client.is_connected());
    }
}
