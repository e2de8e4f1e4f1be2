//! Dispatcher threads
//!
//! A `DispatcherThread` owns one OS thread running a single-threaded tokio
//! runtime. The thread's `ThreadBody` decides what happens on start and exit,
//! may consume its own command type, and may supply an I/O readiness source
//! that the loop polls ahead of every queued event.
//!
//! Loop iteration:
//! 1. exit signaled: discard everything pending and stop
//! 2. move the channel contents into the priority queue
//! 3. poll the I/O source once with zero timeout
//! 4. dispatch the next queued event
//! 5. idle: wait on {exit, I/O, channel}

use async_trait::async_trait;
use futures::FutureExt;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::DispatchError;
use crate::event::dispatcher::Dispatcher;
use crate::event::{DispatchRegistry, DispatcherHandle};
use crate::thread::state::{lock, StateCell, ThreadState};
use crate::types::WaitTimeout;
use crate::{Result, SvcbusError};

// ----------------------------------------------------------------------------
// Thread Body
// ----------------------------------------------------------------------------

/// Behavior plugged into a dispatcher thread
#[async_trait]
pub trait ThreadBody: Send + 'static {
    /// Commands addressed to the body itself; intercepted before consumer lookup
    type Command: Send + 'static;
    /// Readiness value produced by `wait_io`
    type Io: Send + 'static;

    /// Runs on the new thread before the loop; an error prevents the loop
    async fn on_start(&mut self, _dispatcher: &mut Dispatcher) -> Result<()> {
        Ok(())
    }

    async fn handle_command(&mut self, _command: Self::Command, _dispatcher: &mut Dispatcher) {}

    /// I/O readiness source. Must be cancel safe: the loop drops the future
    /// whenever another branch wins.
    async fn wait_io(&mut self) -> Self::Io {
        std::future::pending().await
    }

    async fn handle_io(&mut self, _io: Self::Io, _dispatcher: &mut Dispatcher) {}

    /// Runs on the thread after the exit signal was observed and pending
    /// events were discarded
    async fn on_exit(&mut self, _dispatcher: &mut Dispatcher) {}
}

/// Body of a plain dispatcher thread: consumers only
#[derive(Debug, Default)]
pub struct IdleBody;

#[async_trait]
impl ThreadBody for IdleBody {
    type Command = Infallible;
    type Io = Infallible;
}

// ----------------------------------------------------------------------------
// Dispatcher Thread
// ----------------------------------------------------------------------------

/// One OS thread with its own dispatcher
pub struct DispatcherThread {
    name: String,
    registry: Weak<DispatchRegistry>,
    state: Arc<StateCell>,
    handle: Mutex<DispatcherHandle>,
    join: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl DispatcherThread {
    pub fn new<N: Into<String>>(name: N, registry: &Arc<DispatchRegistry>) -> Self {
        Self {
            name: name.into(),
            registry: Arc::downgrade(registry),
            state: Arc::new(StateCell::new(ThreadState::Idle)),
            handle: Mutex::new(DispatcherHandle::null()),
            join: Mutex::new(None),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Bound used by `Drop` when joining the thread
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    /// Handle of the running dispatcher, or the null dispatcher before start
    pub fn dispatcher(&self) -> DispatcherHandle {
        lock(&self.handle).clone()
    }

    /// Spawn the OS thread and start `body` on it. Does not wait for the
    /// loop; use `wait_ready` for that.
    pub fn start<B: ThreadBody>(&self, body: B) -> Result<()> {
        if self.state.get() != ThreadState::Idle {
            return Err(DispatchError::AlreadyStarted {
                name: self.name.clone(),
            }
            .into());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let exit = CancellationToken::new();
        let handle = DispatcherHandle::new(self.name.clone(), sender, self.state.clone(), exit);
        let dispatcher = Dispatcher::new(handle.clone(), receiver, self.registry.clone());

        self.state.set(ThreadState::Starting);
        *lock(&self.handle) = handle.clone();
        if let Some(registry) = self.registry.upgrade() {
            registry.insert_dispatcher(handle.clone());
        }

        let state = self.state.clone();
        let registry = self.registry.clone();
        let spawned = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_thread(body, dispatcher, state, registry));

        match spawned {
            Ok(join) => {
                *lock(&self.join) = Some(join);
                Ok(())
            }
            Err(e) => {
                self.state.set(ThreadState::Stopped);
                if let Some(registry) = self.registry.upgrade() {
                    registry.remove_dispatcher(&handle);
                }
                Err(SvcbusError::Dispatch(DispatchError::SpawnFailed {
                    name: self.name.clone(),
                    reason: e.to_string(),
                }))
            }
        }
    }

    /// Wait until the loop runs. False if it stopped or the timeout elapsed.
    pub fn wait_ready(&self, timeout: WaitTimeout) -> bool {
        if self.state.get() == ThreadState::Idle {
            return false;
        }
        let state = self.state.wait_until(timeout, |s| {
            matches!(s, ThreadState::Running | ThreadState::Stopped)
        });
        state == ThreadState::Running
    }

    /// Raise the exit signal. Idempotent; a no-op before start.
    pub fn trigger_exit(&self) {
        self.dispatcher().trigger_exit();
    }

    /// Wait for the thread to stop and join it
    pub fn wait_completion(&self, timeout: WaitTimeout) -> bool {
        if self.dispatcher().is_owner_thread() {
            // The thread cannot wait for itself
            return false;
        }

        let state = self.state.wait_until(timeout, ThreadState::is_terminal);
        if !state.is_terminal() {
            return false;
        }

        let join = lock(&self.join).take();
        if let Some(join) = join {
            if join.join().is_err() {
                error!(thread = %self.name, "Dispatcher thread panicked");
            }
        }
        true
    }

    /// Trigger exit and wait for completion
    pub fn shutdown(&self, timeout: WaitTimeout) -> bool {
        self.trigger_exit();
        self.wait_completion(timeout)
    }
}

impl Drop for DispatcherThread {
    fn drop(&mut self) {
        if self.state.get() == ThreadState::Idle {
            return;
        }
        if !self.shutdown(WaitTimeout::After(self.shutdown_timeout)) {
            warn!(thread = %self.name, "Dispatcher thread did not stop in time, detaching");
        }
    }
}

impl std::fmt::Debug for DispatcherThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherThread")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Thread Main
// ----------------------------------------------------------------------------

fn run_thread<B: ThreadBody>(
    body: B,
    dispatcher: Dispatcher,
    state: Arc<StateCell>,
    registry: Weak<DispatchRegistry>,
) {
    let handle = dispatcher.handle();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(thread = %handle.name(), error = %e, "Failed to build dispatcher runtime");
            finish(&handle, &state, &registry);
            return;
        }
    };

    handle.bind_owner(runtime.handle().clone());
    runtime.block_on(run_loop(body, dispatcher, &state));
    finish(&handle, &state, &registry);
}

fn finish(handle: &DispatcherHandle, state: &StateCell, registry: &Weak<DispatchRegistry>) {
    if let Some(registry) = registry.upgrade() {
        registry.remove_dispatcher(handle);
    }
    state.set(ThreadState::Stopped);
    debug!(thread = %handle.name(), "Dispatcher thread stopped");
}

async fn run_loop<B: ThreadBody>(mut body: B, mut dispatcher: Dispatcher, state: &StateCell) {
    let exit = dispatcher.handle().exit_token();

    if let Err(e) = body.on_start(&mut dispatcher).await {
        error!(thread = %dispatcher.name(), error = %e, "Thread start failed");
        state.set(ThreadState::Stopping);
        dispatcher.discard_pending();
        dispatcher.release_consumers();
        return;
    }

    state.set(ThreadState::Running);
    info!(thread = %dispatcher.name(), "Dispatcher running");

    loop {
        if exit.is_cancelled() {
            break;
        }

        dispatcher.drain_channel();

        if let Some(io) = body.wait_io().now_or_never() {
            body.handle_io(io, &mut dispatcher).await;
            continue;
        }

        if let Some(event) = dispatcher.pop() {
            if exit.is_cancelled() {
                drop(event);
                break;
            }
            if event.is::<B::Command>() {
                if let Ok(command) = event.downcast::<B::Command>() {
                    dispatcher.note_dispatched();
                    body.handle_command(command, &mut dispatcher).await;
                }
            } else {
                dispatcher.dispatch(event).await;
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = exit.cancelled() => break,
            io = body.wait_io() => body.handle_io(io, &mut dispatcher).await,
            envelope = dispatcher.recv() => match envelope {
                Some(envelope) => dispatcher.accept(envelope),
                None => break,
            },
        }
    }

    state.set(ThreadState::Stopping);
    let discarded = dispatcher.discard_pending();
    if discarded > 0 {
        debug!(thread = %dispatcher.name(), discarded, "Discarded pending events on exit");
    }

    body.on_exit(&mut dispatcher).await;
    dispatcher.release_consumers();
    info!(thread = %dispatcher.name(), "Dispatcher exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{consumer_fn, Event};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: WaitTimeout = WaitTimeout::After(Duration::from_secs(5));

    struct Tick;

    #[test]
    fn test_null_dispatcher_before_start() {
        let registry = DispatchRegistry::new();
        let thread = DispatcherThread::new("idle", &registry);

        assert!(thread.dispatcher().is_null());
        assert!(!thread.dispatcher().post(Event::new(Tick)));
        assert!(!thread.wait_ready(WaitTimeout::DoNotWait));
        thread.trigger_exit();
        assert_eq!(thread.state(), ThreadState::Idle);
    }

    #[test]
    fn test_start_run_and_stop() {
        let registry = DispatchRegistry::new();
        let thread = DispatcherThread::new("worker", &registry);
        thread.start(IdleBody).unwrap();
        assert!(thread.wait_ready(WAIT));
        assert!(registry.dispatcher("worker").is_some());

        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let handle = thread.dispatcher();
        handle.register_consumer::<Tick, _>(consumer_fn(move |_: Tick, _: &mut Dispatcher| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(handle.post(Event::new(Tick)));
        assert!(handle.post(Event::new(Tick)));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert!(thread.shutdown(WAIT));
        assert_eq!(thread.state(), ThreadState::Stopped);
        assert!(registry.dispatcher("worker").is_none());
        assert!(!handle.post(Event::new(Tick)));
    }

    #[test]
    fn test_second_start_is_rejected() {
        let registry = DispatchRegistry::new();
        let thread = DispatcherThread::new("once", &registry);
        thread.start(IdleBody).unwrap();
        assert!(thread.start(IdleBody).is_err());
        assert!(thread.shutdown(WAIT));
    }

    struct FailingBody;

    #[async_trait]
    impl ThreadBody for FailingBody {
        type Command = Infallible;
        type Io = Infallible;

        async fn on_start(&mut self, _dispatcher: &mut Dispatcher) -> Result<()> {
            Err(SvcbusError::config_error("refusing to start"))
        }
    }

    #[test]
    fn test_failed_start_never_runs() {
        let registry = DispatchRegistry::new();
        let thread = DispatcherThread::new("failing", &registry);
        thread.start(FailingBody).unwrap();

        assert!(!thread.wait_ready(WAIT));
        assert_eq!(thread.state(), ThreadState::Stopped);
        assert!(thread.wait_completion(WAIT));
    }
}
