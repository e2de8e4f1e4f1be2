//! Process-level service host
//!
//! The surface a host application uses to reach the router: connect,
//! disconnect, reconnect, query the connection, send messages. The host owns
//! one client service connection, created lazily on the first connect.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use svcbus_core::{
    AppContext, Channel, ItemId, RemoteMessage, SvcbusConfig, SvcbusResult, TracingSink,
    WaitTimeout,
};

use crate::service::{ConnectionListener, ConnectionState, ServiceClientConnection};

/// Name of the client owner thread
pub const HOST_THREAD: &str = "svcbus-host";

pub struct ServiceHost {
    context: Arc<AppContext>,
    listener: Arc<dyn ConnectionListener>,
    source: ItemId,
    thread_name: String,
    connection: Mutex<Option<ServiceClientConnection>>,
}

impl ServiceHost {
    pub fn new(context: Arc<AppContext>, listener: Arc<dyn ConnectionListener>) -> Self {
        Self {
            context,
            listener,
            source: ItemId::new(u64::from(std::process::id())),
            thread_name: HOST_THREAD.to_string(),
            connection: Mutex::new(None),
        }
    }

    /// Host with its own context, configured from a TOML file
    pub fn from_config_file<P: AsRef<Path>>(
        path: P,
        listener: Arc<dyn ConnectionListener>,
    ) -> SvcbusResult<Self> {
        let config = SvcbusConfig::load_from_file(path)?;
        let context = AppContext::init(config, Arc::new(TracingSink::default()));
        Ok(Self::new(context, listener))
    }

    /// Logical id announced in the connect request
    pub fn with_source(mut self, source: ItemId) -> Self {
        self.source = source;
        self
    }

    /// Owner thread name; distinct hosts in one context need distinct names
    pub fn with_thread_name<N: Into<String>>(mut self, name: N) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn context(&self) -> &Arc<AppContext> {
        &self.context
    }

    fn connection(&self) -> MutexGuard<'_, Option<ServiceClientConnection>> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------------
    // Connection Control
    // ------------------------------------------------------------------------

    /// Connect to the configured router
    pub fn connect_service_host(&self) -> SvcbusResult<bool> {
        let address = self.context.config().connection.address();
        self.connect_to(&address)
    }

    /// Connect to `host:port`, overriding the configured address
    pub fn connect_service_host_to(&self, host: &str, port: u16) -> SvcbusResult<bool> {
        self.connect_to(&format!("{}:{}", host, port))
    }

    fn connect_to(&self, address: &str) -> SvcbusResult<bool> {
        let mut connection = self.connection();
        if connection.is_none() {
            let config = &self.context.config().connection;
            *connection = Some(ServiceClientConnection::spawn(
                &self.thread_name,
                config,
                self.source,
                self.listener.clone(),
                self.context.log_scope(self.thread_name.as_str()),
                self.context.registry(),
            )?);
        }

        let Some(client) = connection.as_ref() else {
            return Ok(false);
        };
        client.set_address(address);
        if client.state().is_connect_like() {
            return Ok(true);
        }
        info!(%address, "Connecting service host");
        Ok(client.start_service())
    }

    pub fn disconnect_service_host(&self) -> bool {
        match self.connection().as_ref() {
            Some(client) => client.stop_service(),
            None => false,
        }
    }

    pub fn reconnect_service_host(&self) -> bool {
        match self.connection().as_ref() {
            Some(client) => client.restart_service(),
            None => false,
        }
    }

    pub fn is_service_host_connected(&self) -> bool {
        self.connection()
            .as_ref()
            .map_or(false, |client| client.is_started())
    }

    pub fn state(&self) -> ConnectionState {
        self.connection()
            .as_ref()
            .map_or(ConnectionState::Stopped, |client| client.state())
    }

    /// Block until the connection reaches `Started`
    pub fn wait_connected(&self, timeout: WaitTimeout) -> bool {
        self.wait_state(ConnectionState::Started, timeout)
    }

    pub fn wait_state(&self, state: ConnectionState, timeout: WaitTimeout) -> bool {
        match self.connection().as_ref() {
            Some(client) => client.wait_state(state, timeout),
            None => state == ConnectionState::Stopped,
        }
    }

    /// Session channel; unknown while not connected
    pub fn channel(&self) -> Channel {
        self.connection()
            .as_ref()
            .map_or_else(Channel::unknown, |client| client.channel())
    }

    pub fn send_message(&self, message: RemoteMessage) -> bool {
        match self.connection().as_ref() {
            Some(client) => client.send_message(message),
            None => {
                warn!(message_id = message.message_id(), "Service host not connected");
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------------

    pub fn extract_bytes_sent(&self) -> u64 {
        self.connection().as_ref().map_or(0, |client| client.bytes_sent())
    }

    pub fn extract_bytes_received(&self) -> u64 {
        self.connection()
            .as_ref()
            .map_or(0, |client| client.bytes_received())
    }

    /// End the owner thread; a later connect starts a fresh one
    pub fn shutdown(&self) {
        if let Some(client) = self.connection().take() {
            if !client.exit_service() {
                warn!(thread = %client.name(), "Service host did not exit in time");
            }
        }
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("source", &self.source)
            .field("thread", &self.thread_name)
            .field("state", &self.state())
            .finish()
    }
}
