//! Client service connection
//!
//! The client state machine runs on its own dispatcher thread. Every
//! transition is driven by a `ClientEvent` delivered through that thread:
//! lifecycle commands from the host surface, reports from the I/O threads and
//! expiries of the reconnect timer.
//!
//! ```text
//! Stopped --Start--> Starting --ConnectNotify(cookie)--> Started
//! Started --Stop--> Stopping --ConnectionStopped--> Stopped
//! any --ConnectionLost--> Stopped, reconnect timer armed
//! ```

use async_trait::async_trait;
use std::convert::Infallible;
use std::sync::Arc;

use tracing::{debug, info, warn};

use svcbus_core::message::{ConnectNotify, ConnectRequest, ControlMessage, DisconnectRequest};
use svcbus_core::{
    Channel, ConnectionConfig, Cookie, DispatchRegistry, Dispatcher, DispatcherHandle,
    DispatcherThread, Event, ItemId, LogScope, MessageResult, RemoteMessage, SvcbusError,
    SvcbusResult, SystemMessageId, ThreadBody, Timer, TimerRepeat, TimerTick, WaitTimeout,
};

use crate::connection::ClientConnection;
use crate::io::{ByteCounter, IoOptions, ReceiveThread, SendThread};
use crate::service::events::{ClientEvent, IoEvent, ServiceCommand};
use crate::service::handler::{ClientBridge, ConnectionListener, RemoteMessageHandler};
use crate::service::state::{ConnectionState, Shared};

// ----------------------------------------------------------------------------
// Shared Connection Object
// ----------------------------------------------------------------------------

/// Fields read by the host surface while the state machine runs
#[derive(Debug, Clone)]
pub struct ClientShared {
    pub state: ConnectionState,
    pub channel: Channel,
    pub address: String,
    /// Connection attempts made so far
    pub attempts: u64,
}

/// Socket plus the two I/O threads of one connection attempt
struct IoLink {
    session: u64,
    connection: ClientConnection,
    send: SendThread,
    receive: ReceiveThread,
}

// ----------------------------------------------------------------------------
// Client State Machine
// ----------------------------------------------------------------------------

struct ClientBody {
    config: ConnectionConfig,
    source: ItemId,
    shared: Arc<Shared<ClientShared>>,
    listener: Arc<dyn ConnectionListener>,
    scope: LogScope,
    io_registry: Arc<DispatchRegistry>,
    sent: Arc<ByteCounter>,
    received: Arc<ByteCounter>,
    link: Option<IoLink>,
    reconnect: Option<Timer>,
    session: u64,
    sequence: u64,
    exiting: bool,
}

impl ClientBody {
    fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    fn cookie(&self) -> Cookie {
        self.shared.lock().channel.cookie()
    }

    fn transition(&self, to: ConnectionState, cause: &str) {
        let from = self.shared.update(|shared| std::mem::replace(&mut shared.state, to));
        if from != to {
            self.scope.transition(from, to, cause);
        }
    }

    fn io_timeout(&self) -> WaitTimeout {
        WaitTimeout::After(self.config.thread_ready_timeout())
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn on_command(&mut self, command: ServiceCommand, dispatcher: &mut Dispatcher) {
        match command {
            ServiceCommand::Start => self.on_service_start(dispatcher).await,
            ServiceCommand::Stop => self.on_service_stop(dispatcher),
            ServiceCommand::Restart => self.on_service_restart(dispatcher),
            ServiceCommand::Exit => self.on_service_exit(dispatcher),
            ServiceCommand::ConnectionStarted(notify) => {
                self.on_connection_started(notify, dispatcher)
            }
            ServiceCommand::ConnectionStopped => self.on_connection_stopped(),
            ServiceCommand::ConnectionLost => self.on_connection_lost(),
        }
    }

    async fn on_service_start(&mut self, dispatcher: &mut Dispatcher) {
        if self.state().is_connect_like() {
            debug!(state = %self.state(), "Start ignored, already connecting");
            return;
        }

        self.transition(ConnectionState::Starting, "service start");
        if let Err(e) = self.start_connection(dispatcher).await {
            warn!(error = %e, "Connection attempt failed");
            self.cancel_connection();
            self.transition(ConnectionState::Stopped, "connect failed");
            self.arm_reconnect();
        }
    }

    fn on_service_stop(&mut self, dispatcher: &mut Dispatcher) {
        self.stop_reconnect();
        if self.state().is_disconnect_like() && self.link.is_none() {
            debug!("Stop ignored, not connected");
            return;
        }

        self.transition(ConnectionState::Stopping, "service stop");
        self.stop_connection();
        dispatcher.post_event(Event::new(ClientEvent::Command(
            ServiceCommand::ConnectionStopped,
        )));
    }

    fn on_service_restart(&mut self, dispatcher: &mut Dispatcher) {
        self.on_service_stop(dispatcher);
        dispatcher.post_event(Event::new(ClientEvent::Command(ServiceCommand::Start)));
    }

    fn on_service_exit(&mut self, dispatcher: &mut Dispatcher) {
        self.exiting = true;
        self.stop_reconnect();

        if self.link.is_some() || self.state() != ConnectionState::Stopped {
            self.transition(ConnectionState::Stopping, "service exit");
            self.stop_connection();
            self.finish_stop("service exit");
        }
        dispatcher.trigger_exit();
    }

    fn on_connection_started(&mut self, notify: ConnectNotify, dispatcher: &mut Dispatcher) {
        if self.state() != ConnectionState::Starting {
            warn!(state = %self.state(), "Unexpected connect notification, ignoring");
            return;
        }
        if !notify.accepted || notify.cookie.is_sentinel() {
            warn!(cookie = %notify.cookie, accepted = notify.accepted, "Connection refused by peer");
            self.on_connection_lost();
            return;
        }

        let channel = Channel::new(notify.cookie, self.source, notify.source);
        self.shared.update(|shared| shared.channel = channel);
        self.transition(ConnectionState::Started, "cookie assigned");
        info!(thread = %dispatcher.name(), %channel, "Service connection started");
        self.listener.connection_started(&channel);
    }

    fn on_connection_stopped(&mut self) {
        if self.state() != ConnectionState::Stopping {
            return;
        }
        self.finish_stop("connection stopped");
    }

    fn on_connection_lost(&mut self) {
        if self.link.is_none() && self.state() == ConnectionState::Stopped {
            return;
        }

        let channel = self.shared.lock().channel;
        self.cancel_connection();
        self.shared.update(|shared| shared.channel.reset());
        self.transition(ConnectionState::Stopped, "connection lost");
        self.listener.connection_lost(&channel);

        if !self.exiting {
            self.arm_reconnect();
        }
    }

    fn finish_stop(&mut self, cause: &str) {
        let channel = self.shared.lock().channel;
        self.shared.update(|shared| shared.channel.reset());
        self.transition(ConnectionState::Stopped, cause);
        self.listener.connection_stopped(&channel);
    }

    // ------------------------------------------------------------------------
    // Connection Setup and Teardown
    // ------------------------------------------------------------------------

    /// Socket, I/O threads, then the connect request
    async fn start_connection(&mut self, dispatcher: &mut Dispatcher) -> SvcbusResult<()> {
        self.stop_reconnect();

        let address = self.shared.update(|shared| {
            shared.attempts += 1;
            shared.address.clone()
        });
        let connection = ClientConnection::connect(&address, self.config.connect_timeout()).await?;
        let (read, write) = connection.split()?;

        self.session += 1;
        let session = self.session;
        let bridge: Arc<dyn RemoteMessageHandler> =
            Arc::new(ClientBridge::new(dispatcher.handle(), session));
        let base = dispatcher.name();

        let receive = ReceiveThread::start(
            &format!("{}-recv", base),
            &self.io_registry,
            read,
            bridge.clone(),
            IoOptions::new(self.config.max_message_size, self.io_timeout(), self.received.clone()),
        )?;
        let send = SendThread::start(
            &format!("{}-send", base),
            &self.io_registry,
            write,
            bridge,
            IoOptions::new(self.config.max_message_size, self.io_timeout(), self.sent.clone()),
        )?;

        let request = ControlMessage::Connect(ConnectRequest {
            source: self.source,
            cookie: Cookie::UNKNOWN,
        })
        .into_message(Cookie::ROUTER, Cookie::UNKNOWN)?;
        if !send.forward(request) {
            return Err(SvcbusError::send_failed("connect request was not queued"));
        }

        debug!(%address, session, "Socket connected, waiting for cookie");
        self.link = Some(IoLink {
            session,
            connection,
            send,
            receive,
        });
        Ok(())
    }

    /// Graceful: disconnect request, drain the send thread, then close
    fn stop_connection(&mut self) {
        let link = match self.link.take() {
            Some(link) => link,
            None => return,
        };

        let cookie = self.cookie();
        if cookie.is_remote() {
            let request = ControlMessage::Disconnect(DisconnectRequest {
                source: self.source,
                cookie,
            })
            .into_message(Cookie::ROUTER, cookie);
            match request {
                Ok(request) => {
                    link.send.forward(request);
                }
                Err(e) => warn!(error = %e, "Failed to build disconnect request"),
            }
        }

        let timeout = self.io_timeout();
        if !link.send.shutdown(timeout) {
            warn!(thread = %link.send.name(), "Send thread did not drain in time");
        }
        link.connection.close();
        if !link.receive.shutdown(timeout) {
            warn!(thread = %link.receive.name(), "Receive thread did not stop in time");
        }
    }

    /// Abrupt: close the socket, then stop both threads
    fn cancel_connection(&mut self) {
        if let Some(link) = self.link.take() {
            link.connection.close();
            link.send.exit();
            link.receive.exit();

            let timeout = self.io_timeout();
            if !link.send.wait_completion(timeout) || !link.receive.wait_completion(timeout) {
                warn!(session = link.session, "I/O threads did not stop in time");
            }
        }
    }

    fn arm_reconnect(&mut self) {
        let interval = self.config.reconnect_interval();
        if let Some(timer) = self.reconnect.as_mut() {
            if timer.start(interval, TimerRepeat::Once, ClientEvent::Reconnect) {
                debug!(?interval, "Reconnect timer armed");
            }
        }
    }

    fn stop_reconnect(&mut self) {
        if let Some(timer) = self.reconnect.as_mut() {
            timer.stop();
        }
    }

    async fn on_reconnect(&mut self, tick: TimerTick, dispatcher: &mut Dispatcher) {
        let current = self.reconnect.as_ref().map_or(false, |t| t.is_current(&tick));
        if !current || self.exiting || self.state() != ConnectionState::Stopped {
            debug!(generation = tick.generation, "Stale reconnect tick");
            return;
        }
        info!("Reconnecting");
        self.on_service_start(dispatcher).await;
    }

    // ------------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------------

    fn on_io(&mut self, session: u64, event: IoEvent, dispatcher: &mut Dispatcher) {
        if self.link.as_ref().map(|link| link.session) != Some(session) {
            match event {
                // Forwards still queued when the session died drain here
                IoEvent::SendFailed(message) => self.on_stale_send_failed(session, message),
                _ => debug!(session, "I/O report from a previous connection, ignoring"),
            }
            return;
        }

        match event {
            IoEvent::Received(message) => self.process_received_message(message, dispatcher),
            IoEvent::SendFailed(message) => self.on_send_failed(message),
            IoEvent::ReceiveFailed => self.on_connection_lost(),
        }
    }

    fn process_received_message(&mut self, message: RemoteMessage, dispatcher: &mut Dispatcher) {
        match ControlMessage::decode(&message) {
            Ok(Some(ControlMessage::ConnectNotify(notify))) => {
                self.on_connection_started(notify, dispatcher)
            }
            Ok(Some(ControlMessage::Disconnect(_))) => {
                info!("Peer closed the session");
                self.on_connection_lost();
            }
            Ok(_) => self.deliver(message),
            Err(e) => warn!(message_id = message.message_id(), error = %e, "Malformed control message"),
        }
    }

    fn deliver(&mut self, message: RemoteMessage) {
        if self.state() != ConnectionState::Started {
            warn!(message_id = message.message_id(), "Message before the session started, dropping");
            return;
        }
        if self.listener.message_received(&message) {
            return;
        }
        if !message.result().is_success() || message.system_id().is_some() {
            debug!(message_id = message.message_id(), "Unhandled notification dropped");
            return;
        }

        debug!(message_id = message.message_id(), "Unprocessed message, answering with failure");
        self.send_to_peer(message.failure_response(MessageResult::NotProcessed));
    }

    /// Stamp the session cookie and sequence number and queue for sending
    fn send_to_peer(&mut self, mut message: RemoteMessage) -> bool {
        let cookie = self.cookie();
        let link = match self.link.as_ref() {
            Some(link) => link,
            None => return false,
        };

        self.sequence += 1;
        message.set_source_cookie(cookie);
        if message.sequence_nr() == 0 {
            message.set_sequence_nr(self.sequence);
        }
        link.send.forward(message)
    }

    fn on_send(&mut self, message: RemoteMessage) {
        if self.state() != ConnectionState::Started {
            self.request_failed(&message);
            return;
        }
        let failure = message.failure_response(MessageResult::NotProcessed);
        if !self.send_to_peer(message) {
            self.listener.request_failed(&failure);
        }
    }

    fn on_send_failed(&mut self, message: RemoteMessage) {
        match message.system_id() {
            Some(SystemMessageId::RouterConnect) => {
                warn!("Connect request could not be sent");
                self.on_connection_lost();
            }
            Some(id) => debug!(?id, "Control message could not be sent"),
            None if message.result().is_success() => self.request_failed(&message),
            None => debug!(message_id = message.message_id(), "Failure response could not be sent"),
        }
    }

    fn on_stale_send_failed(&mut self, session: u64, message: RemoteMessage) {
        if message.system_id().is_some() || !message.result().is_success() {
            debug!(session, message_id = message.message_id(), "Unsent control traffic of a closed session");
            return;
        }
        self.request_failed(&message);
    }

    fn request_failed(&self, message: &RemoteMessage) {
        let mut response = message.failure_response(MessageResult::NotProcessed);
        if response.target_cookie() == Cookie::UNKNOWN {
            response.set_target_cookie(self.cookie());
        }
        debug!(message_id = message.message_id(), "Request failed locally");
        self.listener.request_failed(&response);
    }
}

#[async_trait]
impl ThreadBody for ClientBody {
    type Command = ClientEvent;
    type Io = Infallible;

    async fn on_start(&mut self, dispatcher: &mut Dispatcher) -> SvcbusResult<()> {
        self.reconnect = Some(Timer::new("reconnect", dispatcher.handle()));
        Ok(())
    }

    async fn handle_command(&mut self, event: ClientEvent, dispatcher: &mut Dispatcher) {
        match event {
            ClientEvent::Command(command) => self.on_command(command, dispatcher).await,
            ClientEvent::Io { session, event } => self.on_io(session, event, dispatcher),
            ClientEvent::Send(message) => self.on_send(message),
            ClientEvent::Reconnect(tick) => self.on_reconnect(tick, dispatcher).await,
        }
    }

    async fn on_exit(&mut self, _dispatcher: &mut Dispatcher) {
        self.exiting = true;
        self.stop_reconnect();
        self.reconnect = None;
        if self.link.is_some() {
            self.cancel_connection();
        }
        self.shared.update(|shared| shared.channel.reset());
        self.transition(ConnectionState::Stopped, "owner thread exit");
    }
}

// ----------------------------------------------------------------------------
// Service Client Connection
// ----------------------------------------------------------------------------

/// Client role of a service connection: owner thread plus the shared state
pub struct ServiceClientConnection {
    thread: DispatcherThread,
    shared: Arc<Shared<ClientShared>>,
    sent: Arc<ByteCounter>,
    received: Arc<ByteCounter>,
    shutdown_timeout: WaitTimeout,
}

impl ServiceClientConnection {
    /// Start the owner thread. The connection itself stays stopped until
    /// `start_service`.
    pub fn spawn(
        name: &str,
        config: &ConnectionConfig,
        source: ItemId,
        listener: Arc<dyn ConnectionListener>,
        scope: LogScope,
        registry: &Arc<DispatchRegistry>,
    ) -> SvcbusResult<Self> {
        let shared = Arc::new(Shared::new(ClientShared {
            state: ConnectionState::Stopped,
            channel: Channel::unknown(),
            address: config.address(),
            attempts: 0,
        }));
        let sent = Arc::new(ByteCounter::new());
        let received = Arc::new(ByteCounter::new());

        let body = ClientBody {
            config: config.clone(),
            source,
            shared: shared.clone(),
            listener,
            scope,
            io_registry: DispatchRegistry::new(),
            sent: sent.clone(),
            received: received.clone(),
            link: None,
            reconnect: None,
            session: 0,
            sequence: 0,
            exiting: false,
        };

        let ready = WaitTimeout::After(config.thread_ready_timeout());
        let thread = DispatcherThread::new(name, registry);
        thread.start(body)?;
        if !thread.wait_ready(ready) {
            thread.shutdown(ready);
            return Err(SvcbusError::not_running(name));
        }

        Ok(Self {
            thread,
            shared,
            sent,
            received,
            shutdown_timeout: ready,
        })
    }

    pub fn name(&self) -> &str {
        self.thread.name()
    }

    pub fn dispatcher(&self) -> DispatcherHandle {
        self.thread.dispatcher()
    }

    fn command(&self, command: ServiceCommand) -> bool {
        let priority = command.priority();
        self.thread
            .dispatcher()
            .post(Event::new(ClientEvent::Command(command)).with_priority(priority))
    }

    pub fn start_service(&self) -> bool {
        self.command(ServiceCommand::Start)
    }

    pub fn stop_service(&self) -> bool {
        self.command(ServiceCommand::Stop)
    }

    pub fn restart_service(&self) -> bool {
        self.command(ServiceCommand::Restart)
    }

    /// Stop for good and end the owner thread
    pub fn exit_service(&self) -> bool {
        self.command(ServiceCommand::Exit);
        self.thread.wait_completion(self.shutdown_timeout)
    }

    /// Queue an application message for the peer. A message that cannot be
    /// sent comes back as a `NotProcessed` response through the listener.
    pub fn send_message(&self, message: RemoteMessage) -> bool {
        self.thread.dispatcher().post(Event::new(ClientEvent::Send(message)))
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_started(&self) -> bool {
        self.state() == ConnectionState::Started
    }

    pub fn channel(&self) -> Channel {
        self.shared.lock().channel
    }

    pub fn address(&self) -> String {
        self.shared.lock().address.clone()
    }

    /// Address used by the next connection attempt
    pub fn set_address<A: Into<String>>(&self, address: A) {
        let address = address.into();
        self.shared.update(|shared| shared.address = address);
    }

    pub fn attempts(&self) -> u64 {
        self.shared.lock().attempts
    }

    pub fn wait_state(&self, state: ConnectionState, timeout: WaitTimeout) -> bool {
        self.shared.wait_until(timeout, |shared| shared.state == state)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.extract_and_reset()
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.extract_and_reset()
    }
}

impl Drop for ServiceClientConnection {
    fn drop(&mut self) {
        if self.thread.is_running() && !self.exit_service() {
            warn!(thread = %self.thread.name(), "Client connection did not exit in time");
        }
    }
}

impl std::fmt::Debug for ServiceClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("ServiceClientConnection")
            .field("name", &self.thread.name())
            .field("state", &shared.state)
            .field("channel", &shared.channel)
            .field("address", &shared.address)
            .finish()
    }
}
