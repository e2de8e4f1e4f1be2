//! Callback roles of the connection state machines

use std::net::SocketAddr;

use svcbus_core::{Channel, Cookie, DispatcherHandle, Event, Priority, RemoteMessage};
use tracing::debug;

use crate::service::events::{ClientEvent, IoEvent, ServerEvent};

// ----------------------------------------------------------------------------
// I/O Thread Bridge
// ----------------------------------------------------------------------------

/// Called by the send and receive threads. Implementations only forward to
/// the owning state machine; they run on the I/O thread.
pub trait RemoteMessageHandler: Send + Sync + 'static {
    fn failed_send_message(&self, message: RemoteMessage);

    fn failed_receive_message(&self);

    fn process_received_message(&self, message: RemoteMessage);
}

/// Bridge of one client connection attempt
#[derive(Debug, Clone)]
pub struct ClientBridge {
    owner: DispatcherHandle,
    session: u64,
}

impl ClientBridge {
    pub fn new(owner: DispatcherHandle, session: u64) -> Self {
        Self { owner, session }
    }

    fn report(&self, event: IoEvent, priority: Priority) {
        let event = ClientEvent::Io {
            session: self.session,
            event,
        };
        if !self.owner.post(Event::new(event).with_priority(priority)) {
            debug!(owner = %self.owner.name(), "Client owner gone, dropping I/O report");
        }
    }
}

impl RemoteMessageHandler for ClientBridge {
    fn failed_send_message(&self, message: RemoteMessage) {
        self.report(IoEvent::SendFailed(message), Priority::High);
    }

    fn failed_receive_message(&self) {
        self.report(IoEvent::ReceiveFailed, Priority::High);
    }

    fn process_received_message(&self, message: RemoteMessage) {
        self.report(IoEvent::Received(message), Priority::Normal);
    }
}

/// Bridge of one server-side peer
#[derive(Debug, Clone)]
pub struct ServerBridge {
    owner: DispatcherHandle,
    cookie: Cookie,
}

impl ServerBridge {
    pub fn new(owner: DispatcherHandle, cookie: Cookie) -> Self {
        Self { owner, cookie }
    }

    fn report(&self, event: IoEvent, priority: Priority) {
        let event = ServerEvent::Io {
            cookie: self.cookie,
            event,
        };
        if !self.owner.post(Event::new(event).with_priority(priority)) {
            debug!(owner = %self.owner.name(), cookie = %self.cookie, "Server owner gone, dropping I/O report");
        }
    }
}

impl RemoteMessageHandler for ServerBridge {
    fn failed_send_message(&self, message: RemoteMessage) {
        self.report(IoEvent::SendFailed(message), Priority::High);
    }

    fn failed_receive_message(&self) {
        self.report(IoEvent::ReceiveFailed, Priority::High);
    }

    fn process_received_message(&self, message: RemoteMessage) {
        self.report(IoEvent::Received(message), Priority::Normal);
    }
}

// ----------------------------------------------------------------------------
// Client Role
// ----------------------------------------------------------------------------

/// Notifications of a client connection, delivered on its owner thread
pub trait ConnectionListener: Send + Sync + 'static {
    fn connection_started(&self, _channel: &Channel) {}

    fn connection_stopped(&self, _channel: &Channel) {}

    fn connection_lost(&self, _channel: &Channel) {}

    /// Message from the peer. Return false when nothing handled it; the
    /// sender then receives a failure response.
    fn message_received(&self, _message: &RemoteMessage) -> bool {
        false
    }

    /// Synthesized `NotProcessed` answer to a request that could not be sent
    fn request_failed(&self, _response: &RemoteMessage) {}
}

/// Listener that handles nothing
#[derive(Debug, Default)]
pub struct NoOpConnectionListener;

impl ConnectionListener for NoOpConnectionListener {}

// ----------------------------------------------------------------------------
// Server Role
// ----------------------------------------------------------------------------

/// Admission decision for inbound sockets, taken before any message is read
pub trait ConnectionAcceptor: Send + Sync + 'static {
    fn accept_connection(&self, address: &SocketAddr) -> bool;
}

/// Messages a server listener wants delivered to peers
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Vec<RemoteMessage>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` for the peer named by its target cookie
    pub fn send(&mut self, message: RemoteMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, RemoteMessage> {
        self.messages.drain(..)
    }
}

/// Notifications of a server connection, delivered on its owner thread
pub trait ServerListener: Send + Sync + 'static {
    fn server_started(&self, _address: &SocketAddr) {}

    fn server_stopped(&self) {}

    fn peer_connected(&self, _cookie: Cookie, _outbox: &mut Outbox) {}

    fn peer_disconnected(&self, _cookie: Cookie, _outbox: &mut Outbox) {}

    /// Message addressed to the server itself. Return false when nothing
    /// handled it; the sender then receives a failure response.
    fn message_received(&self, _message: &RemoteMessage, _outbox: &mut Outbox) -> bool {
        false
    }
}
