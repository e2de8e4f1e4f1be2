//! svcbus core
//!
//! The event-dispatch engine of the svcbus service middleware: typed events,
//! per-thread dispatchers with priority queues, dispatcher and component
//! threads, timers, and the remote message envelope with its stream codec.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod component;
pub mod config;
pub mod context;
pub mod errors;
pub mod event;
pub mod logging;
pub mod message;
pub mod thread;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use component::{Component, ComponentEntry, ComponentModel};
pub use config::{
    AdmissionConfig, AdmissionDefault, ConnectionConfig, DispatcherConfig, RouterConfig,
    SvcbusConfig, HEADER_SIZE,
};
pub use context::AppContext;
pub use errors::{
    ComponentError, DispatchError, MessageError, Result, SvcbusError, SvcbusResult,
    TransportError,
};
pub use event::{
    consumer_fn, ConsumerId, DispatchRegistry, Dispatcher, DispatcherHandle, Event,
    EventConsumer, EventTarget, EventType, Priority, ProxyBinding,
};
pub use logging::{LogScope, LogSink, NoOpSink, Severity, SharedLogSink, TracingSink};
pub use message::{Channel, MessageResult, RemoteMessage, RemoteMessageCodec, SystemMessageId};
pub use thread::{
    ComponentThread, DispatcherThread, IdleBody, ThreadBody, ThreadState, Timer, TimerRepeat,
    TimerTick,
};
pub use types::{Cookie, ItemId, WaitTimeout};
