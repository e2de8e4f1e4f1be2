//! Structured log sink
//!
//! The engine and the connection layer report lifecycle milestones through a
//! `LogSink` carried by the process context. `TracingSink` forwards records to
//! `tracing`; `NoOpSink` is the absent sink.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ----------------------------------------------------------------------------
// Severity
// ----------------------------------------------------------------------------

/// Log levels understood by every sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Trace => write!(f, "TRACE"),
            Severity::Debug => write!(f, "DEBUG"),
            Severity::Info => write!(f, "INFO"),
            Severity::Warn => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

// ----------------------------------------------------------------------------
// Sink Trait
// ----------------------------------------------------------------------------

/// Receiver of (scope, severity, message) records
pub trait LogSink: Send + Sync {
    fn log(&self, scope: &str, severity: Severity, message: &str);

    /// Whether a record of the given severity would be kept
    fn enabled(&self, _severity: Severity) -> bool {
        true
    }
}

/// Shared sink handle
pub type SharedLogSink = Arc<dyn LogSink>;

/// Forwards records to the `tracing` subscriber installed by the host process
#[derive(Debug, Clone)]
pub struct TracingSink {
    min_level: Severity,
}

impl TracingSink {
    pub fn new(min_level: Severity) -> Self {
        Self { min_level }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(Severity::Debug)
    }
}

impl LogSink for TracingSink {
    fn log(&self, scope: &str, severity: Severity, message: &str) {
        if !self.enabled(severity) {
            return;
        }

        match severity {
            Severity::Trace => tracing::trace!(scope, "{}", message),
            Severity::Debug => tracing::debug!(scope, "{}", message),
            Severity::Info => tracing::info!(scope, "{}", message),
            Severity::Warn => tracing::warn!(scope, "{}", message),
            Severity::Error => tracing::error!(scope, "{}", message),
        }
    }

    fn enabled(&self, severity: Severity) -> bool {
        severity >= self.min_level
    }
}

/// No-op sink for when logging is disabled
#[derive(Debug, Clone, Default)]
pub struct NoOpSink;

impl LogSink for NoOpSink {
    fn log(&self, _scope: &str, _severity: Severity, _message: &str) {}

    fn enabled(&self, _severity: Severity) -> bool {
        false
    }
}

// ----------------------------------------------------------------------------
// Scoped Logger
// ----------------------------------------------------------------------------

/// A sink bound to one scope name
#[derive(Clone)]
pub struct LogScope {
    name: String,
    sink: SharedLogSink,
}

impl LogScope {
    pub fn new<N: Into<String>>(name: N, sink: SharedLogSink) -> Self {
        Self {
            name: name.into(),
            sink,
        }
    }

    /// Scope that discards everything
    pub fn disabled<N: Into<String>>(name: N) -> Self {
        Self::new(name, Arc::new(NoOpSink))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self, severity: Severity, message: &str) {
        self.sink.log(&self.name, severity, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Severity::Warn, message);
    }

    /// Record a state machine transition
    pub fn transition(&self, from: impl fmt::Display, to: impl fmt::Display, cause: &str) {
        if self.sink.enabled(Severity::Debug) {
            self.sink.log(
                &self.name,
                Severity::Debug,
                &format!("{} -> {} ({})", from, to, cause),
            );
        }
    }
}

impl fmt::Debug for LogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogScope").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<(String, Severity, String)>>,
    }

    impl LogSink for RecordingSink {
        fn log(&self, scope: &str, severity: Severity, message: &str) {
            self.records
                .lock()
                .unwrap()
                .push((scope.to_string(), severity, message.to_string()));
        }
    }

    #[test]
    fn test_tracing_sink_level_filtering() {
        let sink = TracingSink::new(Severity::Warn);
        assert!(!sink.enabled(Severity::Debug));
        assert!(!sink.enabled(Severity::Info));
        assert!(sink.enabled(Severity::Warn));
        assert!(sink.enabled(Severity::Error));
    }

    #[test]
    fn test_scope_records_transition() {
        let sink = Arc::new(RecordingSink::default());
        let scope = LogScope::new("svcbus.client", sink.clone());
        scope.transition("Stopped", "Starting", "start requested");

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "svcbus.client");
        assert_eq!(records[0].1, Severity::Debug);
        assert_eq!(records[0].2, "Stopped -> Starting (start requested)");
    }

    #[test]
    fn test_noop_sink_is_silent() {
        let scope = LogScope::disabled("quiet");
        scope.info("nothing happens");
        assert_eq!(scope.name(), "quiet");
    }
}
