//! Events consumed by the connection state machines and their I/O threads

use svcbus_core::message::ConnectNotify;
use svcbus_core::{Cookie, Priority, RemoteMessage, TimerTick};

// ----------------------------------------------------------------------------
// Service Commands
// ----------------------------------------------------------------------------

/// Lifecycle commands of a service connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCommand {
    Start,
    Stop,
    /// Stop followed by start
    Restart,
    /// Process teardown: stop without reconnecting, then end the owner thread
    Exit,
    /// The peer assigned this endpoint its cookie
    ConnectionStarted(ConnectNotify),
    /// The I/O threads of a stopped connection are drained
    ConnectionStopped,
    /// The socket died or the peer dropped the session
    ConnectionLost,
}

impl ServiceCommand {
    pub fn priority(&self) -> Priority {
        match self {
            ServiceCommand::Exit => Priority::Critical,
            ServiceCommand::ConnectionLost => Priority::High,
            _ => Priority::Normal,
        }
    }
}

// ----------------------------------------------------------------------------
// I/O Reports
// ----------------------------------------------------------------------------

/// What an I/O thread reports back to the owning state machine
#[derive(Debug)]
pub enum IoEvent {
    Received(RemoteMessage),
    SendFailed(RemoteMessage),
    ReceiveFailed,
}

/// Events of the client state machine
#[derive(Debug)]
pub enum ClientEvent {
    Command(ServiceCommand),
    /// Report from the I/O threads of connection attempt `session`
    Io { session: u64, event: IoEvent },
    /// Application message to send to the peer
    Send(RemoteMessage),
    Reconnect(TimerTick),
}

/// Events of the server state machine
#[derive(Debug)]
pub enum ServerEvent {
    Command(ServiceCommand),
    /// Report from the I/O threads of peer `cookie`
    Io { cookie: Cookie, event: IoEvent },
    /// Message from the local side to the peer named by its target cookie
    Send(RemoteMessage),
    Restart(TimerTick),
}

// ----------------------------------------------------------------------------
// I/O Thread Commands
// ----------------------------------------------------------------------------

/// Consumed by the send thread
#[derive(Debug)]
pub enum SendMessageEvent {
    /// Write one message to the socket
    Forward(RemoteMessage),
    /// Close the socket and end the thread
    Exit,
}

/// Consumed by the receive thread
#[derive(Debug)]
pub enum ReceiveCommand {
    Exit,
}
