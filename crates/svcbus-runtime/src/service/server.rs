//! Server service connection
//!
//! The server role listens for peers, admits or refuses each inbound socket,
//! assigns every admitted peer a cookie and routes envelopes between peers.
//! The accept loop is the owner thread's I/O readiness source, so accepting
//! and routing share one dispatcher and never race each other.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use svcbus_core::message::{ConnectNotify, ControlMessage, DisconnectRequest, PeerNotice};
use svcbus_core::{
    Cookie, DispatchRegistry, Dispatcher, DispatcherHandle, DispatcherThread, Event, ItemId,
    LogScope, MessageResult, RemoteMessage, RouterConfig, SvcbusError, SvcbusResult, ThreadBody,
    Timer, TimerRepeat, TimerTick, WaitTimeout,
};

use crate::connection::{split_accepted, AdmissionPolicy, CookieAllocator, ServerConnection};
use crate::io::{ByteCounter, IoOptions, ReceiveThread, SendThread};
use crate::service::events::{IoEvent, ServerEvent, ServiceCommand};
use crate::service::handler::{
    ConnectionAcceptor, Outbox, RemoteMessageHandler, ServerBridge, ServerListener,
};
use crate::service::state::{ConnectionState, Shared};

// ----------------------------------------------------------------------------
// Shared Connection Object
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerShared {
    pub state: ConnectionState,
    pub local_addr: Option<SocketAddr>,
    /// Cookies of every peer with live I/O threads
    pub cookies: CookieAllocator,
    /// Peers that completed the connect handshake
    pub connected: usize,
}

/// One admitted peer
struct PeerLink {
    remote: SocketAddr,
    source: ItemId,
    connected: bool,
    socket: std::net::TcpStream,
    send: SendThread,
    receive: ReceiveThread,
}

impl PeerLink {
    fn close(&self) {
        if let Err(e) = self.socket.shutdown(std::net::Shutdown::Both) {
            debug!(remote = %self.remote, error = %e, "Peer socket already closed");
        }
    }
}

// ----------------------------------------------------------------------------
// Server State Machine
// ----------------------------------------------------------------------------

struct ServerBody {
    config: RouterConfig,
    router_id: ItemId,
    ready: WaitTimeout,
    shared: Arc<Shared<ServerShared>>,
    listener: Arc<dyn ServerListener>,
    acceptor: Arc<dyn ConnectionAcceptor>,
    scope: LogScope,
    io_registry: Arc<DispatchRegistry>,
    sent: Arc<ByteCounter>,
    received: Arc<ByteCounter>,
    server: Option<ServerConnection>,
    peers: HashMap<Cookie, PeerLink>,
    restart: Option<Timer>,
    exiting: bool,
}

impl ServerBody {
    fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    fn transition(&self, to: ConnectionState, cause: &str) {
        let from = self.shared.update(|shared| std::mem::replace(&mut shared.state, to));
        if from != to {
            self.scope.transition(from, to, cause);
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn on_command(&mut self, command: ServiceCommand, dispatcher: &mut Dispatcher) {
        match command {
            ServiceCommand::Start => self.on_service_start().await,
            ServiceCommand::Stop => self.on_service_stop(dispatcher),
            ServiceCommand::Restart => {
                self.on_service_stop(dispatcher);
                dispatcher.post_event(Event::new(ServerEvent::Command(ServiceCommand::Start)));
            }
            ServiceCommand::Exit => {
                self.exiting = true;
                self.stop_restart();
                if self.state() != ConnectionState::Stopped || self.server.is_some() {
                    self.transition(ConnectionState::Stopping, "service exit");
                    self.stop_listening();
                    self.finish_stop("service exit");
                }
                dispatcher.trigger_exit();
            }
            ServiceCommand::ConnectionStopped => {
                if self.state() == ConnectionState::Stopping {
                    self.finish_stop("connection stopped");
                }
            }
            ServiceCommand::ConnectionLost => self.on_server_lost(),
            ServiceCommand::ConnectionStarted(_) => {
                debug!("Connect notification has no meaning on the server role")
            }
        }
    }

    async fn on_service_start(&mut self) {
        if self.state().is_connect_like() {
            debug!(state = %self.state(), "Start ignored, already listening");
            return;
        }
        self.stop_restart();
        self.transition(ConnectionState::Starting, "service start");

        let address = self.config.listen_address();
        match ServerConnection::bind(&address).await {
            Ok(server) => {
                let local = server.local_addr();
                self.server = Some(server);
                self.shared.update(|shared| shared.local_addr = Some(local));
                self.transition(ConnectionState::Started, "listening");
                self.listener.server_started(&local);
            }
            Err(e) => {
                warn!(%address, error = %e, "Failed to listen");
                self.transition(ConnectionState::Stopped, "bind failed");
                self.arm_restart();
            }
        }
    }

    fn on_service_stop(&mut self, dispatcher: &mut Dispatcher) {
        self.stop_restart();
        if self.state().is_disconnect_like() && self.server.is_none() {
            debug!("Stop ignored, not listening");
            return;
        }

        self.transition(ConnectionState::Stopping, "service stop");
        self.stop_listening();
        dispatcher.post_event(Event::new(ServerEvent::Command(
            ServiceCommand::ConnectionStopped,
        )));
    }

    fn finish_stop(&mut self, cause: &str) {
        self.shared.update(|shared| shared.local_addr = None);
        self.transition(ConnectionState::Stopped, cause);
        self.listener.server_stopped();
    }

    /// The listening socket failed: drop every peer and try again later
    fn on_server_lost(&mut self) {
        if self.server.is_none() && self.state() == ConnectionState::Stopped {
            return;
        }
        self.server = None;
        let cookies: Vec<Cookie> = self.peers.keys().copied().collect();
        for cookie in cookies {
            self.cancel_peer(cookie);
        }
        self.finish_stop("listener lost");
        if !self.exiting {
            self.arm_restart();
        }
    }

    /// Close the listener and say goodbye to every peer
    fn stop_listening(&mut self) {
        self.server = None;

        let peers: Vec<(Cookie, PeerLink)> = self.peers.drain().collect();
        for (cookie, peer) in &peers {
            if peer.connected {
                let request = ControlMessage::Disconnect(DisconnectRequest {
                    source: self.router_id,
                    cookie: *cookie,
                })
                .into_message(*cookie, Cookie::ROUTER);
                if let Ok(request) = request {
                    peer.send.forward(request);
                }
            }
            peer.send.exit();
        }

        // One drain deadline for all peers, then closing the socket unblocks
        // any writer stuck on a peer that stopped reading
        let deadline = self.ready.as_duration().map(|ready| Instant::now() + ready);
        for (cookie, peer) in &peers {
            let remaining = deadline.map_or(WaitTimeout::Infinite, |deadline| {
                WaitTimeout::from(deadline.saturating_duration_since(Instant::now()))
            });
            if !peer.send.wait_completion(remaining) {
                warn!(%cookie, "Send thread did not drain in time");
            }
            peer.close();
        }

        for (cookie, peer) in peers {
            if !peer.send.wait_completion(self.ready) || !peer.receive.shutdown(self.ready) {
                warn!(%cookie, "Peer I/O threads did not stop in time");
            }
        }

        self.shared.update(|shared| {
            shared.cookies.clear();
            shared.connected = 0;
        });
    }

    fn arm_restart(&mut self) {
        let interval = self.config.restart_interval();
        if let Some(timer) = self.restart.as_mut() {
            if timer.start(interval, TimerRepeat::Once, ServerEvent::Restart) {
                debug!(?interval, "Listener restart armed");
            }
        }
    }

    fn stop_restart(&mut self) {
        if let Some(timer) = self.restart.as_mut() {
            timer.stop();
        }
    }

    async fn on_restart(&mut self, tick: TimerTick) {
        let current = self.restart.as_ref().map_or(false, |t| t.is_current(&tick));
        if !current || self.exiting || self.state() != ConnectionState::Stopped {
            return;
        }
        info!("Restarting listener");
        self.on_service_start().await;
    }

    // ------------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------------

    fn on_accept(&mut self, stream: TcpStream, remote: SocketAddr, dispatcher: &Dispatcher) {
        if !self.acceptor.accept_connection(&remote) {
            info!(%remote, "Connection refused by admission policy");
            return;
        }

        let cookie = match self.shared.update(|shared| shared.cookies.mint()) {
            Some(cookie) => cookie,
            None => {
                warn!(%remote, "No free cookie, refusing connection");
                return;
            }
        };

        match self.start_peer(stream, remote, cookie, dispatcher) {
            Ok(peer) => {
                debug!(%remote, %cookie, "Peer admitted");
                self.peers.insert(cookie, peer);
            }
            Err(e) => {
                warn!(%remote, %cookie, error = %e, "Failed to start peer I/O");
                self.shared.update(|shared| shared.cookies.release(cookie));
            }
        }
    }

    fn start_peer(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        cookie: Cookie,
        dispatcher: &Dispatcher,
    ) -> SvcbusResult<PeerLink> {
        let (read, write) = split_accepted(stream)?;
        let socket = write.try_clone()?;
        let bridge: Arc<dyn RemoteMessageHandler> =
            Arc::new(ServerBridge::new(dispatcher.handle(), cookie));
        let base = format!("{}-{}", dispatcher.name(), cookie.value());

        let receive = ReceiveThread::start(
            &format!("{}-recv", base),
            &self.io_registry,
            read,
            bridge.clone(),
            IoOptions::new(self.config.max_message_size, self.ready, self.received.clone()),
        )?;
        let send = SendThread::start(
            &format!("{}-send", base),
            &self.io_registry,
            write,
            bridge,
            IoOptions::new(self.config.max_message_size, self.ready, self.sent.clone()),
        )?;

        Ok(PeerLink {
            remote,
            source: ItemId::UNKNOWN,
            connected: false,
            socket,
            send,
            receive,
        })
    }

    /// Tear a peer down without a goodbye and return its cookie
    fn cancel_peer(&mut self, cookie: Cookie) -> Option<PeerLink> {
        let peer = self.peers.remove(&cookie)?;
        peer.close();
        peer.send.exit();
        peer.receive.exit();
        if !peer.send.wait_completion(self.ready) || !peer.receive.wait_completion(self.ready) {
            warn!(%cookie, "Peer I/O threads did not stop in time");
        }
        self.shared.update(|shared| {
            shared.cookies.release(cookie);
            if peer.connected {
                shared.connected -= 1;
            }
        });
        Some(peer)
    }

    fn on_peer_lost(&mut self, cookie: Cookie, cause: &str) {
        let peer = match self.cancel_peer(cookie) {
            Some(peer) => peer,
            None => return,
        };
        info!(%cookie, remote = %peer.remote, cause, "Peer disconnected");

        let mut outbox = Outbox::new();
        self.listener.peer_disconnected(cookie, &mut outbox);
        self.flush(&mut outbox);

        if peer.connected {
            self.broadcast(ControlMessage::PeerDisconnected(PeerNotice { cookie }));
        }
    }

    fn broadcast(&mut self, notice: ControlMessage) {
        let targets: Vec<Cookie> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.connected)
            .map(|(cookie, _)| *cookie)
            .collect();

        for target in targets {
            match notice.clone().into_message(target, Cookie::ROUTER) {
                Ok(message) => {
                    self.route(message);
                }
                Err(e) => warn!(error = %e, "Failed to encode broadcast"),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    fn on_io(&mut self, cookie: Cookie, event: IoEvent) {
        if !self.peers.contains_key(&cookie) {
            match event {
                // Forwards still queued when the peer departed drain here
                IoEvent::SendFailed(message) => self.on_send_failed(cookie, message),
                _ => debug!(%cookie, "I/O report from a departed peer, ignoring"),
            }
            return;
        }

        match event {
            IoEvent::Received(message) => self.process_received_message(cookie, message),
            IoEvent::SendFailed(message) => self.on_send_failed(cookie, message),
            IoEvent::ReceiveFailed => self.on_peer_lost(cookie, "connection lost"),
        }
    }

    fn process_received_message(&mut self, cookie: Cookie, mut message: RemoteMessage) {
        if message.source_cookie() != cookie {
            message.set_source_cookie(cookie);
            message.seal();
        }

        let control = match ControlMessage::decode(&message) {
            Ok(control) => control,
            Err(e) => {
                warn!(%cookie, message_id = message.message_id(), error = %e, "Malformed control message");
                return;
            }
        };

        match &control {
            Some(ControlMessage::Connect(request)) => {
                self.on_peer_connect(cookie, request.source);
                return;
            }
            Some(ControlMessage::Disconnect(_)) => {
                self.on_peer_lost(cookie, "disconnect request");
                return;
            }
            _ => {}
        }

        if !self.peers.get(&cookie).map_or(false, |peer| peer.connected) {
            debug!(%cookie, message_id = message.message_id(), "Message before connect request");
            self.answer_failure(&message, MessageResult::Rejected);
            return;
        }

        let target = message.target_cookie();
        if target == Cookie::ROUTER || control.is_some() {
            let mut outbox = Outbox::new();
            let handled = self.listener.message_received(&message, &mut outbox);
            self.flush(&mut outbox);
            if !handled {
                self.answer_failure(&message, MessageResult::NotProcessed);
            }
        } else if self.is_connected(target) {
            self.route(message);
        } else {
            debug!(%cookie, %target, message_id = message.message_id(), "Unknown target cookie");
            self.answer_failure(&message, MessageResult::ServiceUnavailable);
        }
    }

    fn on_peer_connect(&mut self, cookie: Cookie, source: ItemId) {
        let newly = match self.peers.get_mut(&cookie) {
            Some(peer) => {
                let newly = !peer.connected;
                peer.connected = true;
                peer.source = source;
                newly
            }
            None => return,
        };
        if newly {
            self.shared.update(|shared| shared.connected += 1);
        }

        let notify = ControlMessage::ConnectNotify(ConnectNotify {
            source: self.router_id,
            target: source,
            cookie,
            accepted: true,
        });
        match notify.into_message(cookie, Cookie::ROUTER) {
            Ok(message) => {
                self.route(message);
            }
            Err(e) => warn!(%cookie, error = %e, "Failed to encode connect notification"),
        }

        info!(%cookie, %source, "Peer connected");
        if newly {
            let mut outbox = Outbox::new();
            self.listener.peer_connected(cookie, &mut outbox);
            self.flush(&mut outbox);
        }
    }

    fn on_send_failed(&mut self, cookie: Cookie, message: RemoteMessage) {
        debug!(%cookie, message_id = message.message_id(), "Send to peer failed");
        let origin = message.source_cookie();
        if origin != cookie && self.is_connected(origin) {
            self.answer_failure(&message, MessageResult::NotProcessed);
        }
    }

    /// Answer a request with a failure result. Failure responses and control
    /// traffic are never answered.
    fn answer_failure(&mut self, message: &RemoteMessage, result: MessageResult) {
        if !message.result().is_success() || message.system_id().is_some() {
            return;
        }
        self.route(message.failure_response(result));
    }

    fn is_connected(&self, cookie: Cookie) -> bool {
        self.peers.get(&cookie).map_or(false, |peer| peer.connected)
    }

    /// Queue a message on the send thread of its target peer
    fn route(&mut self, message: RemoteMessage) -> bool {
        let target = message.target_cookie();
        match self.peers.get(&target) {
            Some(peer) => peer.send.forward(message),
            None => {
                debug!(%target, message_id = message.message_id(), "No peer for target, dropping");
                false
            }
        }
    }

    fn flush(&mut self, outbox: &mut Outbox) {
        let messages: Vec<RemoteMessage> = outbox.drain().collect();
        for mut message in messages {
            if message.source_cookie() == Cookie::UNKNOWN {
                message.set_source_cookie(Cookie::ROUTER);
            }
            self.route(message);
        }
    }

    fn on_send(&mut self, mut message: RemoteMessage) {
        let target = message.target_cookie();
        if message.source_cookie() == Cookie::UNKNOWN {
            message.set_source_cookie(Cookie::ROUTER);
        }
        if target == Cookie::ANY {
            let targets: Vec<Cookie> = self
                .peers
                .iter()
                .filter(|(_, peer)| peer.connected)
                .map(|(cookie, _)| *cookie)
                .collect();
            for cookie in targets {
                let mut copy = message.clone();
                copy.set_target_cookie(cookie);
                self.route(copy);
            }
        } else if !self.route(message) {
            warn!(%target, "Message for unknown peer dropped");
        }
    }
}

#[async_trait]
impl ThreadBody for ServerBody {
    type Command = ServerEvent;
    type Io = std::io::Result<(TcpStream, SocketAddr)>;

    async fn on_start(&mut self, dispatcher: &mut Dispatcher) -> SvcbusResult<()> {
        self.restart = Some(Timer::new("listener-restart", dispatcher.handle()));
        Ok(())
    }

    async fn handle_command(&mut self, event: ServerEvent, dispatcher: &mut Dispatcher) {
        match event {
            ServerEvent::Command(command) => self.on_command(command, dispatcher).await,
            ServerEvent::Io { cookie, event } => self.on_io(cookie, event),
            ServerEvent::Send(message) => self.on_send(message),
            ServerEvent::Restart(tick) => self.on_restart(tick).await,
        }
    }

    async fn wait_io(&mut self) -> Self::Io {
        match self.server.as_mut() {
            Some(server) => server.accept().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_io(&mut self, io: Self::Io, dispatcher: &mut Dispatcher) {
        match io {
            Ok((stream, remote)) => self.on_accept(stream, remote, dispatcher),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {
                warn!("Listening socket closed");
                self.on_server_lost();
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    async fn on_exit(&mut self, _dispatcher: &mut Dispatcher) {
        self.exiting = true;
        self.stop_restart();
        self.restart = None;
        if self.server.is_some() || !self.peers.is_empty() {
            self.stop_listening();
        }
        self.shared.update(|shared| shared.local_addr = None);
        self.transition(ConnectionState::Stopped, "owner thread exit");
    }
}

// ----------------------------------------------------------------------------
// Service Server Connection
// ----------------------------------------------------------------------------

/// Collaborators of a server connection
pub struct ServerOptions {
    pub router_id: ItemId,
    pub listener: Arc<dyn ServerListener>,
    /// Defaults to the configured admission lists
    pub acceptor: Option<Arc<dyn ConnectionAcceptor>>,
    pub scope: LogScope,
    /// Bound on I/O thread start and stop
    pub ready: WaitTimeout,
}

impl ServerOptions {
    pub fn new(listener: Arc<dyn ServerListener>, scope: LogScope) -> Self {
        Self {
            router_id: ItemId::new(Cookie::ROUTER.value()),
            listener,
            acceptor: None,
            scope,
            ready: WaitTimeout::from_millis(5_000),
        }
    }

    pub fn with_acceptor(mut self, acceptor: Arc<dyn ConnectionAcceptor>) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn with_ready_timeout(mut self, ready: WaitTimeout) -> Self {
        self.ready = ready;
        self
    }
}

/// Server role of a service connection
pub struct ServiceServerConnection {
    thread: DispatcherThread,
    shared: Arc<Shared<ServerShared>>,
    sent: Arc<ByteCounter>,
    received: Arc<ByteCounter>,
    ready: WaitTimeout,
}

impl ServiceServerConnection {
    /// Start the owner thread; the listener opens on `start_service`
    pub fn spawn(
        name: &str,
        config: &RouterConfig,
        options: ServerOptions,
        registry: &Arc<DispatchRegistry>,
    ) -> SvcbusResult<Self> {
        let ServerOptions {
            router_id,
            listener,
            acceptor,
            scope,
            ready,
        } = options;
        let acceptor =
            acceptor.unwrap_or_else(|| Arc::new(AdmissionPolicy::new(&config.admission)));

        let shared = Arc::new(Shared::new(ServerShared {
            state: ConnectionState::Stopped,
            local_addr: None,
            cookies: CookieAllocator::new(Cookie::new(config.first_cookie)),
            connected: 0,
        }));
        let sent = Arc::new(ByteCounter::new());
        let received = Arc::new(ByteCounter::new());

        let thread = DispatcherThread::new(name, registry);
        thread.start(ServerBody {
            config: config.clone(),
            router_id,
            ready,
            shared: shared.clone(),
            listener,
            acceptor,
            scope,
            io_registry: DispatchRegistry::new(),
            sent: sent.clone(),
            received: received.clone(),
            server: None,
            peers: HashMap::new(),
            restart: None,
            exiting: false,
        })?;
        if !thread.wait_ready(ready) {
            thread.shutdown(ready);
            return Err(SvcbusError::not_running(name));
        }

        Ok(Self {
            thread,
            shared,
            sent,
            received,
            ready,
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
            .post(Event::new(ServerEvent::Command(command)).with_priority(priority))
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

    pub fn exit_service(&self) -> bool {
        self.command(ServiceCommand::Exit);
        self.thread.wait_completion(self.ready)
    }

    /// Send a message from the router itself; `Cookie::ANY` reaches every
    /// connected peer
    pub fn send_message(&self, message: RemoteMessage) -> bool {
        self.thread.dispatcher().post(Event::new(ServerEvent::Send(message)))
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.lock().local_addr
    }

    /// Peers that completed the connect handshake
    pub fn peer_count(&self) -> usize {
        self.shared.lock().connected
    }

    pub fn is_cookie_live(&self, cookie: Cookie) -> bool {
        self.shared.lock().cookies.is_live(cookie)
    }

    pub fn wait_state(&self, state: ConnectionState, timeout: WaitTimeout) -> bool {
        self.shared.wait_until(timeout, |shared| shared.state == state)
    }

    pub fn wait_peers(&self, count: usize, timeout: WaitTimeout) -> bool {
        self.shared.wait_until(timeout, |shared| shared.connected == count)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.extract_and_reset()
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.extract_and_reset()
    }
}

impl Drop for ServiceServerConnection {
    fn drop(&mut self) {
        if self.thread.is_running() && !self.exit_service() {
            warn!(thread = %self.thread.name(), "Server connection did not exit in time");
        }
    }
}

impl std::fmt::Debug for ServiceServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("ServiceServerConnection")
            .field("name", &self.thread.name())
            .field("state", &shared.state)
            .field("local_addr", &shared.local_addr)
            .field("connected", &shared.connected)
            .finish()
    }
}
