//! Service connection state machines
//!
//! Both roles run on a dedicated owner thread and drive their transitions only
//! from events delivered through that thread. The host surface and the I/O
//! threads talk to the owner by posting events.

pub mod client;
pub mod events;
pub mod handler;
pub mod server;
pub mod state;

pub use client::{ClientShared, ServiceClientConnection};
pub use events::{ClientEvent, IoEvent, ReceiveCommand, SendMessageEvent, ServerEvent, ServiceCommand};
pub use handler::{
    ClientBridge, ConnectionAcceptor, ConnectionListener, NoOpConnectionListener, Outbox,
    RemoteMessageHandler, ServerBridge, ServerListener,
};
pub use server::{ServerOptions, ServerShared, ServiceServerConnection};
pub use state::{ConnectionState, Shared};
