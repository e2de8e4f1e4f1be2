//! Dedicated socket I/O threads

pub mod receive_thread;
pub mod send_thread;
pub mod stats;

use std::sync::Arc;

use svcbus_core::{RemoteMessageCodec, WaitTimeout};

pub use receive_thread::ReceiveThread;
pub use send_thread::SendThread;
pub use stats::ByteCounter;

/// Settings shared by the send and receive threads of one connection
#[derive(Debug, Clone)]
pub struct IoOptions {
    pub codec: RemoteMessageCodec,
    /// Bound on the wait for a new I/O thread to accept events
    pub ready: WaitTimeout,
    /// Byte counter the thread accumulates into
    pub counter: Arc<ByteCounter>,
}

impl IoOptions {
    pub fn new(max_message_size: usize, ready: WaitTimeout, counter: Arc<ByteCounter>) -> Self {
        Self {
            codec: RemoteMessageCodec::new(max_message_size),
            ready,
            counter,
        }
    }
}
