//! Process context
//!
//! `AppContext` replaces process-wide singletons: it owns the dispatch
//! registry, the component model, the logging sink and the component threads
//! started from the model. It is created once with `init` and passed
//! explicitly to whatever needs it.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::component::{ComponentEntry, ComponentModel};
use crate::config::SvcbusConfig;
use crate::event::{DispatchRegistry, DispatcherHandle, Event};
use crate::logging::{LogScope, SharedLogSink};
use crate::thread::state::lock;
use crate::thread::ComponentThread;
use crate::types::WaitTimeout;
use crate::Result;

pub struct AppContext {
    config: SvcbusConfig,
    registry: Arc<DispatchRegistry>,
    model: Mutex<ComponentModel>,
    sink: SharedLogSink,
    threads: Mutex<Vec<ComponentThread>>,
}

impl AppContext {
    pub fn init(config: SvcbusConfig, sink: SharedLogSink) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: DispatchRegistry::new(),
            model: Mutex::new(ComponentModel::new()),
            sink,
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &SvcbusConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.registry
    }

    pub fn log_sink(&self) -> SharedLogSink {
        self.sink.clone()
    }

    /// Sink bound to a scope name
    pub fn log_scope<N: Into<String>>(&self, name: N) -> LogScope {
        LogScope::new(name, self.sink.clone())
    }

    // ------------------------------------------------------------------------
    // Component Model
    // ------------------------------------------------------------------------

    pub fn register_component(&self, entry: ComponentEntry) -> Result<()> {
        lock(&self.model).add(entry)
    }

    /// Snapshot of the registered entries
    pub fn model(&self) -> ComponentModel {
        lock(&self.model).clone()
    }

    /// Start one component thread per thread name in the model. Threads that
    /// are already running are left alone. On failure every thread started by
    /// this call is stopped again.
    pub fn start_component_threads(&self) -> Result<usize> {
        let model = self.model();
        let timeout = WaitTimeout::After(self.config.dispatcher.shutdown_timeout());
        let mut threads = lock(&self.threads);
        let mut started: Vec<ComponentThread> = Vec::new();

        for name in model.thread_names() {
            if threads.iter().any(|t| t.name() == name) {
                continue;
            }

            let thread = ComponentThread::new(name.as_str(), model.entries_for(&name), &self.registry)
                .with_timeouts(
                    WaitTimeout::After(self.config.connection.thread_ready_timeout()),
                    self.config.dispatcher.shutdown_timeout(),
                );

            if let Err(e) = thread.start() {
                warn!(thread = %name, error = %e, "Component thread failed to start");
                for thread in started.iter().rev() {
                    thread.shutdown(timeout);
                }
                return Err(e);
            }
            started.push(thread);
        }

        let count = started.len();
        threads.extend(started);
        info!(threads = count, "Component threads started");
        Ok(count)
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn post_event(&self, event: Event) -> bool {
        self.registry.post_event(event)
    }

    /// The single dispatcher hosting a consumer of `E`
    pub fn event_consumer_thread<E: 'static>(&self) -> Option<DispatcherHandle> {
        self.registry.event_consumer_thread::<E>()
    }

    pub fn dispatcher(&self, thread_name: &str) -> Option<DispatcherHandle> {
        self.registry.dispatcher(thread_name)
    }

    /// Stop every component thread, last started first
    pub fn shutdown(&self) {
        let threads: Vec<ComponentThread> = lock(&self.threads).drain(..).collect();
        for thread in threads.iter().rev() {
            thread.trigger_exit();
        }

        let timeout = WaitTimeout::After(self.config.dispatcher.shutdown_timeout());
        for thread in threads.iter().rev() {
            if !thread.wait_completion(timeout) {
                warn!(thread = %thread.name(), "Component thread did not stop in time");
            }
        }
        info!("Application context shut down");
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("threads", &self.registry.thread_names())
            .finish()
    }
}
