//! Centralized Configuration Management
//!
//! All tunables of the dispatch engine, the connection layer and the router
//! live here. Every section has sensible defaults and a `testing()` preset with
//! short timeouts; a whole configuration can be loaded from a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Cookie;
use crate::{Result, SvcbusError};

/// Size of the fixed envelope header, in bytes
pub const HEADER_SIZE: usize = 52;

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Client side connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Router host name or address
    pub host: String,
    /// Router port
    pub port: u16,
    /// Fixed delay between reconnect attempts (milliseconds)
    pub reconnect_interval_ms: u64,
    /// Upper bound of one TCP connect attempt (milliseconds)
    pub connect_timeout_ms: u64,
    /// How long to wait for an I/O thread to report ready (milliseconds)
    pub thread_ready_timeout_ms: u64,
    /// Largest accepted frame, header included
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8181,
            reconnect_interval_ms: 500,
            connect_timeout_ms: 2_000,
            thread_ready_timeout_ms: 5_000,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl ConnectionConfig {
    /// Short timeouts, loopback router
    pub fn testing() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            reconnect_interval_ms: 100,
            connect_timeout_ms: 500,
            thread_ready_timeout_ms: 2_000,
            max_message_size: 1024 * 1024,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn thread_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.thread_ready_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Router Configuration
// ----------------------------------------------------------------------------

/// What to do with a peer that neither list mentions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionDefault {
    Accept,
    Reject,
}

/// Host based admission of inbound sockets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub default: AdmissionDefault,
    /// Hosts always accepted (unless blacklisted)
    pub whitelist: Vec<String>,
    /// Hosts always rejected
    pub blacklist: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default: AdmissionDefault::Accept,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

/// Server side (router) parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub admission: AdmissionConfig,
    /// First cookie handed to a connecting peer
    pub first_cookie: u64,
    /// Delay before the listener is restarted after a failure (milliseconds)
    pub restart_interval_ms: u64,
    /// Largest accepted frame, header included
    pub max_message_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8181,
            admission: AdmissionConfig::default(),
            first_cookie: Cookie::FIRST_REMOTE.value(),
            restart_interval_ms: 1_000,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

impl RouterConfig {
    /// Loopback listener on an ephemeral port
    pub fn testing() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            admission: AdmissionConfig::default(),
            first_cookie: Cookie::FIRST_REMOTE.value(),
            restart_interval_ms: 100,
            max_message_size: 1024 * 1024,
        }
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_millis(self.restart_interval_ms)
    }
}

// ----------------------------------------------------------------------------
// Dispatcher Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Bounded join of a dispatcher thread on shutdown (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl DispatcherConfig {
    pub fn testing() -> Self {
        Self {
            shutdown_timeout_ms: 2_000,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Unified Configuration
// ----------------------------------------------------------------------------

/// Complete svcbus configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvcbusConfig {
    pub connection: ConnectionConfig,
    pub router: RouterConfig,
    pub dispatcher: DispatcherConfig,
}

impl SvcbusConfig {
    /// Preset with short timeouts for tests
    pub fn testing() -> Self {
        Self {
            connection: ConnectionConfig::testing(),
            router: RouterConfig::testing(),
            dispatcher: DispatcherConfig::testing(),
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SvcbusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SvcbusError::config_error(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.is_empty() {
            return Err(SvcbusError::config_error("connection.host must not be empty"));
        }
        if self.connection.reconnect_interval_ms == 0 {
            return Err(SvcbusError::config_error(
                "connection.reconnect_interval_ms must be positive",
            ));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(SvcbusError::config_error(
                "connection.connect_timeout_ms must be positive",
            ));
        }
        for (section, size) in [
            ("connection", self.connection.max_message_size),
            ("router", self.router.max_message_size),
        ] {
            if size <= HEADER_SIZE || size >= u32::MAX as usize - 1 {
                return Err(SvcbusError::config_error(format!(
                    "{}.max_message_size must be between {} and {}",
                    section,
                    HEADER_SIZE + 1,
                    u32::MAX - 2
                )));
            }
        }
        if Cookie::new(self.router.first_cookie).is_sentinel() {
            return Err(SvcbusError::config_error(format!(
                "router.first_cookie {} is a reserved value",
                self.router.first_cookie
            )));
        }
        Ok(())
    }
}
