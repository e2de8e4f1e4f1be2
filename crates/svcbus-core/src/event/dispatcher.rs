//! Per-thread dispatcher
//!
//! Every dispatcher thread owns one `Dispatcher`: the receiving end of an
//! unbounded channel, the priority queue the channel is drained into, and the
//! table of consumers registered on that thread. Other threads only ever see a
//! `DispatcherHandle`, which can enqueue, register and raise the exit signal.

use core::any::TypeId;
use core::fmt;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::consumer::{Delivery, ErasedConsumer, TypedConsumer};
use super::queue::EventQueue;
use super::registry::DispatchRegistry;
use super::{ConsumerId, Event, EventConsumer, EventType};
use crate::thread::state::{StateCell, ThreadState};

// ----------------------------------------------------------------------------
// Channel Envelope
// ----------------------------------------------------------------------------

pub(crate) enum Envelope {
    Event(Event),
    Register {
        event_type: EventType,
        id: ConsumerId,
        consumer: Box<dyn ErasedConsumer>,
    },
    Unregister(ConsumerId),
}

// ----------------------------------------------------------------------------
// Dispatcher Handle
// ----------------------------------------------------------------------------

struct HandleInner {
    name: String,
    sender: mpsc::UnboundedSender<Envelope>,
    state: Arc<StateCell>,
    exit: CancellationToken,
    owner: OnceLock<ThreadId>,
    runtime: OnceLock<tokio::runtime::Handle>,
}

/// Cloneable, thread-safe reference to one dispatcher.
///
/// The default handle is the null dispatcher: it accepts nothing and drops
/// everything posted to it.
#[derive(Clone, Default)]
pub struct DispatcherHandle {
    inner: Option<Arc<HandleInner>>,
}

impl DispatcherHandle {
    pub(crate) fn new(
        name: String,
        sender: mpsc::UnboundedSender<Envelope>,
        state: Arc<StateCell>,
        exit: CancellationToken,
    ) -> Self {
        Self {
            inner: Some(Arc::new(HandleInner {
                name,
                sender,
                state,
                exit,
                owner: OnceLock::new(),
                runtime: OnceLock::new(),
            })),
        }
    }

    /// The null dispatcher
    pub fn null() -> Self {
        Self { inner: None }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    pub fn name(&self) -> &str {
        self.inner.as_ref().map_or("", |inner| inner.name.as_str())
    }

    pub fn state(&self) -> ThreadState {
        self.inner
            .as_ref()
            .map_or(ThreadState::Idle, |inner| inner.state.get())
    }

    pub fn is_running(&self) -> bool {
        self.state() == ThreadState::Running
    }

    /// Enqueue an event; returns false (and drops the event) when the
    /// dispatcher is null or no longer accepting events.
    pub fn post(&self, event: Event) -> bool {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => {
                trace!(event_type = %event.event_type(), "Dropping event posted to null dispatcher");
                return false;
            }
        };

        if !inner.state.get().accepts_events() || inner.exit.is_cancelled() {
            trace!(dispatcher = %inner.name, event_type = %event.event_type(), "Dispatcher not accepting events");
            return false;
        }

        inner.sender.send(Envelope::Event(event)).is_ok()
    }

    /// Wrap `payload` in a normal priority event and post it
    pub fn emit<E: Send + 'static>(&self, payload: E) -> bool {
        self.post(Event::new(payload))
    }

    /// Register a consumer from any thread. It becomes active once the owning
    /// thread drains its channel.
    pub fn register_consumer<E, C>(&self, consumer: C) -> Option<ConsumerId>
    where
        E: Send + 'static,
        C: EventConsumer<E>,
    {
        let inner = self.inner.as_ref()?;
        if !inner.state.get().accepts_events() {
            return None;
        }

        let id = ConsumerId::next();
        let envelope = Envelope::Register {
            event_type: EventType::of::<E>(),
            id,
            consumer: TypedConsumer::boxed(consumer),
        };
        inner.sender.send(envelope).ok().map(|_| id)
    }

    pub fn unregister_consumer(&self, id: ConsumerId) -> bool {
        match &self.inner {
            Some(inner) => inner.sender.send(Envelope::Unregister(id)).is_ok(),
            None => false,
        }
    }

    /// Raise the exit signal. Idempotent.
    pub fn trigger_exit(&self) {
        if let Some(inner) = &self.inner {
            inner.exit.cancel();
        }
    }

    pub fn is_exit_triggered(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |inner| inner.exit.is_cancelled())
    }

    /// Whether the caller runs on the dispatcher's own OS thread
    pub fn is_owner_thread(&self) -> bool {
        self.inner
            .as_ref()
            .and_then(|inner| inner.owner.get())
            .map_or(false, |owner| *owner == std::thread::current().id())
    }

    /// Runtime driving the dispatcher, once the thread has started
    pub fn runtime(&self) -> Option<tokio::runtime::Handle> {
        self.inner
            .as_ref()
            .and_then(|inner| inner.runtime.get().cloned())
    }

    /// Whether both handles refer to the same dispatcher
    pub fn same_dispatcher(&self, other: &DispatcherHandle) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    pub(crate) fn exit_token(&self) -> CancellationToken {
        self.inner
            .as_ref()
            .map(|inner| inner.exit.clone())
            .unwrap_or_else(CancellationToken::new)
    }

    pub(crate) fn bind_owner(&self, runtime: tokio::runtime::Handle) {
        if let Some(inner) = &self.inner {
            let _ = inner.owner.set(std::thread::current().id());
            let _ = inner.runtime.set(runtime);
        }
    }
}

impl fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("DispatcherHandle")
                .field("name", &inner.name)
                .field("state", &inner.state.get())
                .finish(),
            None => f.write_str("DispatcherHandle(null)"),
        }
    }
}

// ----------------------------------------------------------------------------
// Proxy Binding
// ----------------------------------------------------------------------------

/// A proxy attached to a dispatcher; stopped before components shut down
pub trait ProxyBinding: Send {
    fn proxy_name(&self) -> &str;
    fn stop_proxy(&mut self);
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

struct ConsumerSlot {
    id: ConsumerId,
    event_type: EventType,
    // `None` while the consumer is running
    consumer: Option<Box<dyn ErasedConsumer>>,
}

/// Owner-thread side of a dispatcher
pub struct Dispatcher {
    handle: DispatcherHandle,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    queue: EventQueue,
    consumers: HashMap<TypeId, Vec<ConsumerSlot>>,
    registry: Weak<DispatchRegistry>,
    proxies: Vec<Box<dyn ProxyBinding>>,
    current: Option<ConsumerId>,
    dispatched: u64,
    dropped: u64,
}

impl Dispatcher {
    pub(crate) fn new(
        handle: DispatcherHandle,
        receiver: mpsc::UnboundedReceiver<Envelope>,
        registry: Weak<DispatchRegistry>,
    ) -> Self {
        Self {
            handle,
            receiver,
            queue: EventQueue::new(),
            consumers: HashMap::new(),
            registry,
            proxies: Vec::new(),
            current: None,
            dispatched: 0,
            dropped: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Post to this dispatcher (behind anything already in its channel)
    pub fn post_event(&self, event: Event) -> bool {
        self.handle.post(event)
    }

    pub fn emit<E: Send + 'static>(&self, payload: E) -> bool {
        self.handle.emit(payload)
    }

    pub fn trigger_exit(&self) {
        self.handle.trigger_exit();
    }

    /// Consumer whose handler is currently running, if any
    pub fn current_consumer(&self) -> Option<ConsumerId> {
        self.current
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    pub fn dispatched_events(&self) -> u64 {
        self.dispatched
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped
    }

    // ------------------------------------------------------------------------
    // Consumer Registration
    // ------------------------------------------------------------------------

    pub fn register_consumer<E, C>(&mut self, consumer: C) -> ConsumerId
    where
        E: Send + 'static,
        C: EventConsumer<E>,
    {
        let id = ConsumerId::next();
        self.insert_consumer(EventType::of::<E>(), id, TypedConsumer::boxed(consumer));
        id
    }

    pub fn unregister_consumer(&mut self, id: ConsumerId) -> bool {
        let mut removed = None;
        for slots in self.consumers.values_mut() {
            if let Some(pos) = slots.iter().position(|slot| slot.id == id) {
                removed = Some(slots.remove(pos).event_type);
                break;
            }
        }

        match removed {
            Some(event_type) => {
                self.consumers.retain(|_, slots| !slots.is_empty());
                if let Some(registry) = self.registry.upgrade() {
                    registry.consumer_removed(event_type, self.handle.name());
                }
                debug!(dispatcher = %self.name(), %id, event_type = %event_type, "Consumer unregistered");
                true
            }
            None => false,
        }
    }

    pub fn has_consumer<E: 'static>(&self) -> bool {
        self.consumers.contains_key(&TypeId::of::<E>())
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.values().map(Vec::len).sum()
    }

    fn insert_consumer(
        &mut self,
        event_type: EventType,
        id: ConsumerId,
        consumer: Box<dyn ErasedConsumer>,
    ) {
        self.consumers
            .entry(event_type.id())
            .or_default()
            .push(ConsumerSlot {
                id,
                event_type,
                consumer: Some(consumer),
            });

        if let Some(registry) = self.registry.upgrade() {
            registry.consumer_added(event_type, self.handle.name());
        }
        debug!(dispatcher = %self.name(), %id, event_type = %event_type, "Consumer registered");
    }

    // ------------------------------------------------------------------------
    // Proxies
    // ------------------------------------------------------------------------

    pub fn bind_proxy(&mut self, proxy: Box<dyn ProxyBinding>) {
        self.proxies.push(proxy);
    }

    /// Stop and release every bound proxy in binding order
    pub fn stop_proxies(&mut self) -> usize {
        let count = self.proxies.len();
        for mut proxy in self.proxies.drain(..) {
            debug!(dispatcher = %self.handle.name(), proxy = proxy.proxy_name(), "Stopping proxy");
            proxy.stop_proxy();
        }
        count
    }

    // ------------------------------------------------------------------------
    // Loop Support
    // ------------------------------------------------------------------------

    pub(crate) fn accept(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Event(event) => self.queue.push(event),
            Envelope::Register {
                event_type,
                id,
                consumer,
            } => self.insert_consumer(event_type, id, consumer),
            Envelope::Unregister(id) => {
                self.unregister_consumer(id);
            }
        }
    }

    /// Move everything currently in the channel into the queue
    pub(crate) fn drain_channel(&mut self) {
        while let Ok(envelope) = self.receiver.try_recv() {
            self.accept(envelope);
        }
    }

    pub(crate) async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }

    pub(crate) fn pop(&mut self) -> Option<Event> {
        self.queue.pop()
    }

    /// Close the channel and drop all pending events without running them
    pub(crate) fn discard_pending(&mut self) -> usize {
        self.receiver.close();
        let mut count = self.queue.clear();
        while let Ok(envelope) = self.receiver.try_recv() {
            if let Envelope::Event(_) = envelope {
                count += 1;
            }
        }
        self.dropped += count as u64;
        count
    }

    /// Drop every consumer and detach from the registry
    pub(crate) fn release_consumers(&mut self) {
        let registry = self.registry.upgrade();
        for (_, slots) in self.consumers.drain() {
            for slot in slots {
                if let Some(registry) = &registry {
                    registry.consumer_removed(slot.event_type, self.handle.name());
                }
            }
        }
    }

    /// Count an event that was consumed outside the consumer table
    pub(crate) fn note_dispatched(&mut self) {
        self.dispatched += 1;
    }

    /// Deliver one event to its bound consumer, or to the first consumer
    /// registered for its type
    pub(crate) async fn dispatch(&mut self, event: Event) {
        debug_assert!(
            self.handle.is_owner_thread(),
            "dispatcher {} dispatched from a foreign thread",
            self.handle.name()
        );

        let event_type = event.event_type();
        let (id, mut consumer) = match self.take_consumer(event_type.id(), event.consumer()) {
            Some(taken) => taken,
            None => {
                warn!(
                    dispatcher = %self.name(),
                    event_type = %event_type,
                    bound = ?event.consumer(),
                    "No consumer for event, dropping"
                );
                self.dropped += 1;
                return;
            }
        };

        let previous = self.current.replace(id);
        let delivery = consumer.deliver(event, self).await;
        self.current = previous;
        self.restore_consumer(event_type.id(), id, consumer);

        match delivery {
            Delivery::Processed => self.dispatched += 1,
            Delivery::Rejected => {
                warn!(dispatcher = %self.name(), event_type = %event_type, %id, "Event rejected by preprocess, dropping");
                self.dropped += 1;
            }
            Delivery::TypeMismatch => {
                warn!(dispatcher = %self.name(), event_type = %event_type, %id, "Event type mismatch, dropping");
                self.dropped += 1;
            }
        }
    }

    fn take_consumer(
        &mut self,
        type_id: TypeId,
        bound: Option<ConsumerId>,
    ) -> Option<(ConsumerId, Box<dyn ErasedConsumer>)> {
        let slots = self.consumers.get_mut(&type_id)?;
        let slot = match bound {
            Some(id) => slots.iter_mut().find(|slot| slot.id == id)?,
            None => slots.iter_mut().find(|slot| slot.consumer.is_some())?,
        };
        let consumer = slot.consumer.take()?;
        Some((slot.id, consumer))
    }

    fn restore_consumer(
        &mut self,
        type_id: TypeId,
        id: ConsumerId,
        consumer: Box<dyn ErasedConsumer>,
    ) {
        let slot = self
            .consumers
            .get_mut(&type_id)
            .and_then(|slots| slots.iter_mut().find(|slot| slot.id == id));

        match slot {
            Some(slot) => slot.consumer = Some(consumer),
            // Unregistered by its own handler
            None => drop(consumer),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.handle.name())
            .field("pending", &self.queue.len())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}
