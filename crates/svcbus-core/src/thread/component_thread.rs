//! Component threads
//!
//! A dispatcher thread that hosts the components registered for its name.
//! Start: create every component through its factory, then start them in list
//! order, then run the dispatch loop. Exit: stop bound proxies, notify every
//! component, shut every component down, then delete them, each pass in list
//! order. A thread with no components never enters its loop.

use async_trait::async_trait;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::component::{Component, ComponentEntry};
use crate::errors::ComponentError;
use crate::event::{DispatchRegistry, Dispatcher, DispatcherHandle};
use crate::thread::dispatcher_thread::{DispatcherThread, ThreadBody};
use crate::thread::state::ThreadState;
use crate::types::WaitTimeout;
use crate::{Result, SvcbusError};

// ----------------------------------------------------------------------------
// Component Body
// ----------------------------------------------------------------------------

struct ComponentBody {
    entries: Vec<ComponentEntry>,
    components: Vec<(ComponentEntry, Box<dyn Component>)>,
}

impl ComponentBody {
    fn new(entries: Vec<ComponentEntry>) -> Self {
        Self {
            entries,
            components: Vec::new(),
        }
    }

    fn create_components(&mut self, dispatcher: &DispatcherHandle) -> usize {
        for entry in &self.entries {
            match entry.create(dispatcher) {
                Ok(component) => {
                    debug!(role = %entry.role_name, "Component created");
                    self.components.push((entry.clone(), component));
                }
                Err(e) => {
                    error!(role = %entry.role_name, error = %e, "Component factory failed");
                }
            }
        }
        self.components.len()
    }

    async fn start_components(&mut self, dispatcher: &mut Dispatcher) -> Result<()> {
        for (entry, component) in self.components.iter_mut() {
            if let Err(e) = component.startup(dispatcher).await {
                error!(role = %entry.role_name, error = %e, "Component startup failed");
                return Err(ComponentError::StartupFailed {
                    role_name: entry.role_name.clone(),
                    reason: e.to_string(),
                }
                .into());
            }
            debug!(role = %entry.role_name, "Component started");
        }
        Ok(())
    }

    async fn shutdown_components(&mut self, dispatcher: &mut Dispatcher) {
        for (_, component) in self.components.iter_mut() {
            component.notify_shutdown(dispatcher).await;
        }
        for (entry, component) in self.components.iter_mut() {
            component.shutdown(dispatcher).await;
            debug!(role = %entry.role_name, "Component stopped");
        }
    }

    fn destroy_components(&mut self) {
        for (entry, component) in self.components.drain(..) {
            entry.delete(component);
        }
    }
}

#[async_trait]
impl ThreadBody for ComponentBody {
    type Command = Infallible;
    type Io = Infallible;

    async fn on_start(&mut self, dispatcher: &mut Dispatcher) -> Result<()> {
        let created = self.create_components(&dispatcher.handle());
        if created == 0 {
            return Err(ComponentError::NoComponents {
                thread_name: dispatcher.name().to_string(),
            }
            .into());
        }

        if let Err(e) = self.start_components(dispatcher).await {
            self.shutdown_components(dispatcher).await;
            self.destroy_components();
            return Err(e);
        }

        info!(thread = %dispatcher.name(), components = created, "Components started");
        Ok(())
    }

    async fn on_exit(&mut self, dispatcher: &mut Dispatcher) {
        let proxies = dispatcher.stop_proxies();
        if proxies > 0 {
            debug!(thread = %dispatcher.name(), proxies, "Stopped bound proxies");
        }
        self.shutdown_components(dispatcher).await;
        self.destroy_components();
    }
}

// ----------------------------------------------------------------------------
// Component Thread
// ----------------------------------------------------------------------------

pub struct ComponentThread {
    thread: DispatcherThread,
    entries: Vec<ComponentEntry>,
    ready_timeout: WaitTimeout,
}

impl ComponentThread {
    pub fn new<N: Into<String>>(
        name: N,
        entries: Vec<ComponentEntry>,
        registry: &Arc<DispatchRegistry>,
    ) -> Self {
        Self {
            thread: DispatcherThread::new(name, registry),
            entries,
            ready_timeout: WaitTimeout::After(Duration::from_secs(5)),
        }
    }

    pub fn with_timeouts(mut self, ready: WaitTimeout, shutdown: Duration) -> Self {
        self.ready_timeout = ready;
        self.thread = self.thread.with_shutdown_timeout(shutdown);
        self
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

    pub fn component_count(&self) -> usize {
        self.entries.len()
    }

    /// Start the thread and wait until its components are running
    pub fn start(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(ComponentError::NoComponents {
                thread_name: self.name().to_string(),
            }
            .into());
        }

        self.thread.start(ComponentBody::new(self.entries.clone()))?;
        if self.thread.wait_ready(self.ready_timeout) {
            return Ok(());
        }

        self.thread.shutdown(self.ready_timeout);
        Err(SvcbusError::Component(ComponentError::StartupFailed {
            role_name: self.name().to_string(),
            reason: "component thread did not reach the running state".to_string(),
        }))
    }

    pub fn trigger_exit(&self) {
        self.thread.trigger_exit();
    }

    pub fn wait_completion(&self, timeout: WaitTimeout) -> bool {
        self.thread.wait_completion(timeout)
    }

    pub fn shutdown(&self, timeout: WaitTimeout) -> bool {
        self.thread.shutdown(timeout)
    }
}

impl std::fmt::Debug for ComponentThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentThread")
            .field("name", &self.thread.name())
            .field("state", &self.thread.state())
            .field("components", &self.entries.len())
            .finish()
    }
}
