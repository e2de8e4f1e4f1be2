//! Send thread
//!
//! A dispatcher thread that owns the write half of one connection. It is the
//! only consumer of `SendMessageEvent`: every forward is one framed socket
//! write, so writes to a socket never interleave.

use async_trait::async_trait;
use futures::SinkExt;
use std::convert::Infallible;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;
use tracing::{debug, warn};

use svcbus_core::errors::TransportError;
use svcbus_core::{
    DispatchRegistry, Dispatcher, DispatcherHandle, DispatcherThread, Event, RemoteMessage,
    RemoteMessageCodec, SvcbusResult, ThreadBody, ThreadState, WaitTimeout,
};

use crate::io::stats::ByteCounter;
use crate::io::IoOptions;
use crate::service::events::SendMessageEvent;
use crate::service::handler::RemoteMessageHandler;

// ----------------------------------------------------------------------------
// Send Body
// ----------------------------------------------------------------------------

struct SendBody {
    stream: Option<std::net::TcpStream>,
    writer: Option<FramedWrite<TcpStream, RemoteMessageCodec>>,
    codec: RemoteMessageCodec,
    counter: Arc<ByteCounter>,
    handler: Arc<dyn RemoteMessageHandler>,
}

impl SendBody {
    async fn forward(&mut self, message: RemoteMessage, thread: &str) {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => {
                debug!(thread, message_id = message.message_id(), "Socket closed, send failed");
                self.handler.failed_send_message(message);
                return;
            }
        };

        let size = message.header().buffer_size as usize;
        match writer.send(message.clone()).await {
            Ok(()) => self.counter.add(size),
            Err(e) => {
                warn!(thread, message_id = message.message_id(), error = %e, "Socket write failed");
                self.handler.failed_send_message(message);
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.close().await {
                debug!(error = %e, "Socket shutdown reported an error");
            }
        }
    }
}

#[async_trait]
impl ThreadBody for SendBody {
    type Command = SendMessageEvent;
    type Io = Infallible;

    async fn on_start(&mut self, _dispatcher: &mut Dispatcher) -> SvcbusResult<()> {
        let stream = self.stream.take().ok_or(TransportError::NotConnected)?;
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream)?;
        self.writer = Some(FramedWrite::new(stream, self.codec.clone()));
        Ok(())
    }

    async fn handle_command(&mut self, command: SendMessageEvent, dispatcher: &mut Dispatcher) {
        match command {
            SendMessageEvent::Forward(message) => self.forward(message, dispatcher.name()).await,
            SendMessageEvent::Exit => {
                self.close().await;
                dispatcher.trigger_exit();
            }
        }
    }

    async fn on_exit(&mut self, _dispatcher: &mut Dispatcher) {
        self.close().await;
    }
}

// ----------------------------------------------------------------------------
// Send Thread
// ----------------------------------------------------------------------------

pub struct SendThread {
    thread: DispatcherThread,
    counter: Arc<ByteCounter>,
}

impl SendThread {
    /// Start the thread on `stream` and wait until it accepts events
    pub fn start(
        name: &str,
        registry: &Arc<DispatchRegistry>,
        stream: std::net::TcpStream,
        handler: Arc<dyn RemoteMessageHandler>,
        options: IoOptions,
    ) -> SvcbusResult<Self> {
        let IoOptions {
            codec,
            ready,
            counter,
        } = options;
        let thread = DispatcherThread::new(name, registry);
        thread.start(SendBody {
            stream: Some(stream),
            writer: None,
            codec,
            counter: counter.clone(),
            handler,
        })?;

        if !thread.wait_ready(ready) {
            thread.shutdown(ready);
            return Err(TransportError::ThreadNotReady {
                name: name.to_string(),
            }
            .into());
        }
        Ok(Self { thread, counter })
    }

    pub fn name(&self) -> &str {
        self.thread.name()
    }

    pub fn state(&self) -> ThreadState {
        self.thread.state()
    }

    pub fn dispatcher(&self) -> DispatcherHandle {
        self.thread.dispatcher()
    }

    /// Queue one message for writing
    pub fn forward(&self, message: RemoteMessage) -> bool {
        self.thread
            .dispatcher()
            .post(Event::new(SendMessageEvent::Forward(message)))
    }

    /// Queue the exit command behind every forward already queued
    pub fn exit(&self) {
        if !self.thread.dispatcher().post(Event::new(SendMessageEvent::Exit)) {
            self.thread.trigger_exit();
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.counter.extract_and_reset()
    }

    pub fn counter(&self) -> Arc<ByteCounter> {
        self.counter.clone()
    }

    pub fn wait_completion(&self, timeout: WaitTimeout) -> bool {
        self.thread.wait_completion(timeout)
    }

    /// Exit after draining queued writes and wait for the thread
    pub fn shutdown(&self, timeout: WaitTimeout) -> bool {
        self.exit();
        self.thread.wait_completion(timeout)
    }
}

impl std::fmt::Debug for SendThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendThread")
            .field("name", &self.thread.name())
            .field("state", &self.thread.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Mutex;
    use std::time::Duration;
    use svcbus_core::{Cookie, HEADER_SIZE};

    const WAIT: WaitTimeout = WaitTimeout::After(Duration::from_secs(5));

    fn options() -> IoOptions {
        IoOptions::new(64 * 1024, WAIT, Arc::new(ByteCounter::new()))
    }

    #[derive(Default)]
    struct Recorder {
        failed: Mutex<Vec<u32>>,
    }

    impl RemoteMessageHandler for Recorder {
        fn failed_send_message(&self, message: RemoteMessage) {
            self.failed.lock().unwrap().push(message.message_id());
        }

        fn failed_receive_message(&self) {}

        fn process_received_message(&self, _message: RemoteMessage) {}
    }

    fn socket_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_forward_writes_frames_in_order() {
        let (client, mut server) = socket_pair();
        let registry = DispatchRegistry::new();
        let recorder = Arc::new(Recorder::default());
        let thread = SendThread::start(
            "send-test",
            &registry,
            client,
            recorder.clone(),
            options(),
        )
        .unwrap();

        for id in [1u32, 2, 3] {
            assert!(thread.forward(RemoteMessage::request(id, Cookie::ROUTER, &b"abc"[..])));
        }
        assert!(thread.shutdown(WAIT));

        let mut bytes = Vec::new();
        server.read_to_end(&mut bytes).unwrap();
        let frame = HEADER_SIZE + 3;
        assert_eq!(bytes.len(), 3 * frame);

        let ids: Vec<u32> = bytes
            .chunks(frame)
            .map(|chunk| RemoteMessage::from_bytes(chunk).unwrap().message_id())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(thread.bytes_sent(), (3 * frame) as u64);
        assert_eq!(thread.bytes_sent(), 0);
        assert!(recorder.failed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_message_reports_failed_send() {
        let (client, _server) = socket_pair();
        let registry = DispatchRegistry::new();
        let recorder = Arc::new(Recorder::default());
        let thread = SendThread::start(
            "send-invalid",
            &registry,
            client,
            recorder.clone(),
            options(),
        )
        .unwrap();

        let mut message = RemoteMessage::request(9, Cookie::ROUTER, &b"x"[..]);
        message.mark_ignored();
        assert!(thread.forward(message));
        assert!(thread.shutdown(WAIT));

        assert_eq!(recorder.failed.lock().unwrap().len(), 1);
        assert_eq!(thread.bytes_sent(), 0);
    }
}
