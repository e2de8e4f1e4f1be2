//! Error types for the svcbus middleware
//!
//! This module contains all error types used by the dispatch engine and the
//! connection layer, including transport errors, envelope (wire) errors,
//! dispatch routing errors, component lifecycle errors, and the main
//! `SvcbusError` type that unifies them all.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Socket level failures. Always recoverable by cancel-and-reconnect.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Connection to {address} timed out after {duration_ms}ms")]
    Timeout { address: String, duration_ms: u64 },
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("I/O thread {name} did not become ready")]
    ThreadNotReady { name: String },
    #[error("Connection is not started")]
    NotConnected,
}

/// Envelope validation and framing failures
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Message too short (expected at least {expected}, got {actual})")]
    TooShort { expected: usize, actual: usize },
    #[error("Message too large (max {max}, got {actual})")]
    TooLarge { max: usize, actual: usize },
    #[error("Message size field carries a sentinel value")]
    InvalidSize,
    #[error("Header inconsistent: {reason}")]
    MalformedHeader { reason: String },
    #[error("Checksum verification failed (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumFailed { expected: u32, actual: u32 },
    #[error("Framing I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Event routing failures
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No consumer registered for event {event_type}")]
    NoConsumer { event_type: String },
    #[error("Ambiguous route for event {event_type}: {count} dispatchers registered")]
    AmbiguousRoute { event_type: String, count: usize },
    #[error("Dispatcher {name} is not running")]
    NotRunning { name: String },
    #[error("Dispatcher thread {name} is already started")]
    AlreadyStarted { name: String },
    #[error("Dispatcher thread {name} could not be spawned: {reason}")]
    SpawnFailed { name: String, reason: String },
}

/// Component model failures
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    #[error("Component role {role_name} is already registered")]
    DuplicateRole { role_name: String },
    #[error("No components registered for thread {thread_name}")]
    NoComponents { thread_name: String },
    #[error("Component {role_name} failed to start: {reason}")]
    StartupFailed { role_name: String, reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error types for the svcbus middleware
#[derive(Debug, thiserror::Error)]
pub enum SvcbusError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid message: {0}")]
    Message(#[from] MessageError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Component error: {0}")]
    Component(#[from] ComponentError),

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),
}

impl From<std::io::Error> for SvcbusError {
    fn from(err: std::io::Error) -> Self {
        SvcbusError::Transport(TransportError::NetworkIo(err))
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl SvcbusError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        SvcbusError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a transport connection failed error
    pub fn connection_failed<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        SvcbusError::Transport(TransportError::ConnectionFailed {
            address: address.into(),
            reason: reason.into(),
        })
    }

    /// Create a send failure error
    pub fn send_failed<R: Into<String>>(reason: R) -> Self {
        SvcbusError::Transport(TransportError::SendFailed {
            reason: reason.into(),
        })
    }

    /// Create a malformed header error
    pub fn malformed<R: Into<String>>(reason: R) -> Self {
        SvcbusError::Message(MessageError::MalformedHeader {
            reason: reason.into(),
        })
    }

    /// Create a "no consumer for this event type" routing error
    pub fn dispatch_error<E: Into<String>>(event_type: E) -> Self {
        SvcbusError::Dispatch(DispatchError::NoConsumer {
            event_type: event_type.into(),
        })
    }

    /// Create a "dispatcher not running" error
    pub fn not_running<N: Into<String>>(name: N) -> Self {
        SvcbusError::Dispatch(DispatchError::NotRunning { name: name.into() })
    }

    /// Whether the error is a recoverable transport failure
    pub fn is_transport(&self) -> bool {
        matches!(self, SvcbusError::Transport(_))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, SvcbusError>;
pub type SvcbusResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: SvcbusError = io.into();
        assert!(err.is_transport());
    }

    #[test]
    fn test_dispatch_error_is_not_transport() {
        let err = SvcbusError::dispatch_error("Ping");
        assert!(!err.is_transport());
        assert!(matches!(
            err,
            SvcbusError::Dispatch(DispatchError::NoConsumer { ref event_type }) if event_type == "Ping"
        ));
    }

    #[test]
    fn test_error_display() {
        let err = SvcbusError::connection_failed("127.0.0.1:8181", "refused");
        assert_eq!(
            err.to_string(),
            "Transport error: Connection failed to 127.0.0.1:8181: refused"
        );
    }
}
