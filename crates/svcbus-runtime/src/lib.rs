//! svcbus runtime
//!
//! The connection layer of the svcbus middleware, built on the dispatch
//! engine in `svcbus-core`:
//! - `ServiceClientConnection`: client state machine with fixed-interval reconnect
//! - `ServiceServerConnection`: router side with admission and cookie assignment
//! - `SendThread` / `ReceiveThread`: one dispatcher thread per socket direction
//! - `ServiceHost`: the process-level connect / disconnect surface
//! - `RouterServiceRegistry`: provider and consumer bookkeeping for the router

pub mod connection;
pub mod host;
pub mod io;
pub mod router;
pub mod service;

pub use connection::{AdmissionPolicy, ClientConnection, CookieAllocator, ServerConnection};
pub use host::{ServiceHost, HOST_THREAD};
pub use io::{ByteCounter, IoOptions, ReceiveThread, SendThread};
pub use router::RouterServiceRegistry;
pub use service::{
    ConnectionAcceptor, ConnectionListener, ConnectionState, NoOpConnectionListener, Outbox,
    RemoteMessageHandler, ServerListener, ServerOptions, ServiceClientConnection,
    ServiceServerConnection,
};

// Re-export core types for convenience
pub use svcbus_core::{
    AppContext, Channel, Cookie, ItemId, MessageResult, RemoteMessage, SvcbusConfig,
    SvcbusError, SvcbusResult, WaitTimeout,
};
