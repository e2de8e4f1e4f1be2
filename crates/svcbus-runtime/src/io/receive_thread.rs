//! Receive thread
//!
//! A dispatcher thread that owns the read half of one connection. The framed
//! socket is its I/O readiness source, so the loop checks it ahead of every
//! queued event. End of stream and framing errors mean the connection is dead.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use svcbus_core::errors::{MessageError, TransportError};
use svcbus_core::{
    DispatchRegistry, Dispatcher, DispatcherHandle, DispatcherThread, Event, Priority,
    RemoteMessage, RemoteMessageCodec, SvcbusResult, ThreadBody, ThreadState, WaitTimeout,
};

use crate::io::stats::ByteCounter;
use crate::io::IoOptions;
use crate::service::events::ReceiveCommand;
use crate::service::handler::RemoteMessageHandler;

// ----------------------------------------------------------------------------
// Receive Body
// ----------------------------------------------------------------------------

struct ReceiveBody {
    stream: Option<std::net::TcpStream>,
    reader: Option<FramedRead<TcpStream, RemoteMessageCodec>>,
    codec: RemoteMessageCodec,
    counter: Arc<ByteCounter>,
    handler: Arc<dyn RemoteMessageHandler>,
}

impl ReceiveBody {
    fn connection_dead(&mut self) {
        self.reader = None;
        self.handler.failed_receive_message();
    }
}

#[async_trait]
impl ThreadBody for ReceiveBody {
    type Command = ReceiveCommand;
    type Io = Option<Result<RemoteMessage, MessageError>>;

    async fn on_start(&mut self, _dispatcher: &mut Dispatcher) -> SvcbusResult<()> {
        let stream = self.stream.take().ok_or(TransportError::NotConnected)?;
        stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(stream)?;
        self.reader = Some(FramedRead::new(stream, self.codec.clone()));
        Ok(())
    }

    async fn handle_command(&mut self, command: ReceiveCommand, dispatcher: &mut Dispatcher) {
        match command {
            ReceiveCommand::Exit => {
                self.reader = None;
                dispatcher.trigger_exit();
            }
        }
    }

    async fn wait_io(&mut self) -> Self::Io {
        match self.reader.as_mut() {
            Some(reader) => reader.next().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_io(&mut self, io: Self::Io, dispatcher: &mut Dispatcher) {
        match io {
            Some(Ok(message)) if message.is_valid() => {
                self.counter.add(message.header().buffer_size as usize);
                self.handler.process_received_message(message);
            }
            Some(Ok(_)) => {
                warn!(thread = %dispatcher.name(), "Dropping frame that failed validation");
            }
            Some(Err(e)) => {
                warn!(thread = %dispatcher.name(), error = %e, "Framing error, connection is dead");
                self.connection_dead();
            }
            None => {
                debug!(thread = %dispatcher.name(), "Peer closed the connection");
                self.connection_dead();
            }
        }
    }

    async fn on_exit(&mut self, _dispatcher: &mut Dispatcher) {
        self.reader = None;
    }
}

// ----------------------------------------------------------------------------
// Receive Thread
// ----------------------------------------------------------------------------

pub struct ReceiveThread {
    thread: DispatcherThread,
    counter: Arc<ByteCounter>,
}

impl ReceiveThread {
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
        thread.start(ReceiveBody {
            stream: Some(stream),
            reader: None,
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

    pub fn exit(&self) {
        let exit = Event::new(ReceiveCommand::Exit).with_priority(Priority::Critical);
        if !self.thread.dispatcher().post(exit) {
            self.thread.trigger_exit();
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.counter.extract_and_reset()
    }

    pub fn counter(&self) -> Arc<ByteCounter> {
        self.counter.clone()
    }

    pub fn wait_completion(&self, timeout: WaitTimeout) -> bool {
        self.thread.wait_completion(timeout)
    }

    pub fn shutdown(&self, timeout: WaitTimeout) -> bool {
        self.exit();
        self.thread.wait_completion(timeout)
    }
}

impl std::fmt::Debug for ReceiveThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveThread")
            .field("name", &self.thread.name())
            .field("state", &self.thread.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use svcbus_core::{Cookie, HEADER_SIZE};

    const WAIT: WaitTimeout = WaitTimeout::After(Duration::from_secs(5));

    fn options() -> IoOptions {
        IoOptions::new(64 * 1024, WAIT, Arc::new(ByteCounter::new()))
    }

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<RemoteMessage>>,
        dead: AtomicUsize,
    }

    impl RemoteMessageHandler for Recorder {
        fn failed_send_message(&self, _message: RemoteMessage) {}

        fn failed_receive_message(&self) {
            self.dead.fetch_add(1, Ordering::SeqCst);
        }

        fn process_received_message(&self, message: RemoteMessage) {
            self.received.lock().unwrap().push(message);
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn socket_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn start(stream: std::net::TcpStream, recorder: &Arc<Recorder>) -> ReceiveThread {
        let registry = DispatchRegistry::new();
        ReceiveThread::start(
            "receive-test",
            &registry,
            stream,
            recorder.clone(),
            options(),
        )
        .unwrap()
    }

    #[test]
    fn test_frames_are_delivered_and_counted() {
        let (client, mut server) = socket_pair();
        let recorder = Arc::new(Recorder::default());
        let thread = start(client, &recorder);

        let mut message = RemoteMessage::request(42, Cookie::ROUTER, &b"payload"[..]);
        message.set_source_cookie(Cookie::new(7));
        let bytes = message.to_bytes().unwrap();
        // Split writes exercise partial frame handling
        server.write_all(&bytes[..20]).unwrap();
        server.flush().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        server.write_all(&bytes[20..]).unwrap();

        assert!(wait_for(|| recorder.received.lock().unwrap().len() == 1));
        let received = recorder.received.lock().unwrap()[0].clone();
        assert_eq!(received.message_id(), 42);
        assert_eq!(received.source_cookie(), Cookie::new(7));
        assert!(received.is_checksum_valid());
        assert_eq!(thread.bytes_received(), (HEADER_SIZE + 7) as u64);

        assert!(thread.shutdown(WAIT));
        assert_eq!(recorder.dead.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_corrupted_frame_is_dropped_and_stream_continues() {
        let (client, mut server) = socket_pair();
        let recorder = Arc::new(Recorder::default());
        let thread = start(client, &recorder);

        let mut corrupted = RemoteMessage::request(1, Cookie::ROUTER, &b"bad"[..])
            .to_bytes()
            .unwrap()
            .to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        server.write_all(&corrupted).unwrap();
        let good = RemoteMessage::request(2, Cookie::ROUTER, &b"good"[..]).to_bytes().unwrap();
        server.write_all(&good).unwrap();

        assert!(wait_for(|| recorder.received.lock().unwrap().len() == 1));
        assert_eq!(recorder.received.lock().unwrap()[0].message_id(), 2);
        assert!(thread.shutdown(WAIT));
    }

    #[test]
    fn test_peer_close_reports_dead_connection() {
        let (client, server) = socket_pair();
        let recorder = Arc::new(Recorder::default());
        let thread = start(client, &recorder);

        drop(server);
        assert!(wait_for(|| recorder.dead.load(Ordering::SeqCst) == 1));
        assert_eq!(thread.state(), ThreadState::Running);
        assert!(thread.shutdown(WAIT));
        assert_eq!(recorder.dead.load(Ordering::SeqCst), 1);
    }
}
