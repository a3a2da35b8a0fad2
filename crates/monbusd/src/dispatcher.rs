//! Request handling for the demo daemon

use monbus_ipc::{Delivery, IpcResult, IpcService};
use monbus_util::Timeout;
use tracing::{debug, info, warn};

use crate::protocol::{Request, Stats, ACK, ECHO_REPLY, ERROR, STATS_REPLY};

/// Whether the service loop keeps running after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Answers requests handed out by `IpcService::recv`
#[derive(Debug, Default)]
pub struct Dispatcher {
    messages_handled: u64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages handled so far, including the one being answered
    pub fn messages_handled(&self) -> u64 {
        self.messages_handled
    }

    /// Handle one delivery and release its client handle.
    ///
    /// Failing to send a reply only affects that client, so it is logged
    /// rather than returned.
    pub fn handle(&mut self, service: &IpcService, delivery: Delivery) -> Flow {
        let Delivery { client, message } = delivery;
        let client_id = client.id();

        let Some(message) = message else {
            debug!(client_id = %client_id, "Client gone");
            return Flow::Continue;
        };

        self.messages_handled += 1;
        debug!(client_id = %client_id, %message, "Request");

        let (code, payload, flow) = match Request::from_code(message.code()) {
            Request::Echo => (ECHO_REPLY, message.into_payload(), Flow::Continue),
            Request::Stats => {
                let stats = Stats {
                    clients: service.client_count(),
                    messages: self.messages_handled,
                };
                (STATS_REPLY, stats.to_text().into_bytes(), Flow::Continue)
            }
            Request::Shutdown => {
                info!(client_id = %client_id, "Shutdown requested");
                (ACK, Vec::new(), Flow::Shutdown)
            }
            Request::Unknown(code) => {
                warn!(client_id = %client_id, code, "Unknown request code");
                let text = format!("unknown request code {}", code);
                (ERROR, text.into_bytes(), Flow::Continue)
            }
        };

        if let Err(e) = client.send(code, &payload) {
            warn!(client_id = %client_id, error = %e, "Failed to send reply");
        }

        client.release();
        flow
    }
}

/// Serve requests until a client asks for shutdown.
///
/// `tick` bounds each wait so the loop wakes up periodically even when
/// idle. Only service-level failures end the loop with an error.
pub fn serve(service: &mut IpcService, dispatcher: &mut Dispatcher, tick: Timeout) -> IpcResult<()> {
    loop {
        let Some(delivery) = service.recv(tick)?.into_delivery() else {
            continue;
        };

        if dispatcher.handle(service, delivery) == Flow::Shutdown {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ECHO, SHUTDOWN, STATS};
    use monbus_ipc::{IpcSocket, Message};
    use monbus_util::{ProcessRole, SocketPaths};
    use std::time::Duration;
    use tempfile::tempdir;

    fn next(service: &mut IpcService) -> Delivery {
        service
            .recv(Timeout::from_secs(5))
            .unwrap()
            .into_delivery()
            .unwrap()
    }

    #[test]
    fn answers_each_request_kind() {
        let dir = tempdir().unwrap();
        let paths = SocketPaths::new(dir.path(), ProcessRole::Server);
        let mut service = IpcService::start(&paths, "dispatch").unwrap();
        let mut socket = IpcSocket::open(&paths, "dispatch", Duration::from_secs(1)).unwrap();
        let mut dispatcher = Dispatcher::new();

        socket.write(ECHO, b"hello").unwrap();
        let delivery = next(&mut service);
        assert_eq!(dispatcher.handle(&service, delivery), Flow::Continue);
        assert_eq!(socket.read().unwrap(), Message::new(ECHO_REPLY, "hello"));

        socket.write(STATS, b"").unwrap();
        let delivery = next(&mut service);
        dispatcher.handle(&service, delivery);
        assert_eq!(
            socket.read().unwrap(),
            Message::new(STATS_REPLY, "clients=1 messages=2")
        );

        socket.write(99, b"?").unwrap();
        let delivery = next(&mut service);
        assert_eq!(dispatcher.handle(&service, delivery), Flow::Continue);
        assert_eq!(socket.read().unwrap().code(), ERROR);

        socket.write(SHUTDOWN, b"").unwrap();
        let delivery = next(&mut service);
        assert_eq!(dispatcher.handle(&service, delivery), Flow::Shutdown);
        assert_eq!(socket.read().unwrap(), Message::empty(ACK));
        assert_eq!(dispatcher.messages_handled(), 4);
    }

    #[test]
    fn disconnect_is_not_counted() {
        let dir = tempdir().unwrap();
        let paths = SocketPaths::new(dir.path(), ProcessRole::Server);
        let mut service = IpcService::start(&paths, "leaver").unwrap();
        let socket = IpcSocket::open(&paths, "leaver", Duration::from_secs(1)).unwrap();
        socket.close();

        let delivery = next(&mut service);
        assert!(delivery.message.is_none());

        let mut dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.handle(&service, delivery), Flow::Continue);
        assert_eq!(dispatcher.messages_handled(), 0);
        assert_eq!(service.client_count(), 0);
    }
}
