//! Events and their dispatch
//!
//! An `Event` is a type-erased payload tagged with its runtime type, a priority
//! band and optional routing information. Events are moved into the queue of
//! exactly one dispatcher and either handed to exactly one consumer or dropped.

pub mod consumer;
pub mod dispatcher;
pub mod queue;
pub mod registry;

pub use consumer::{consumer_fn, EventConsumer, FnConsumer};
pub use dispatcher::{Dispatcher, DispatcherHandle, ProxyBinding};
pub use queue::EventQueue;
pub use registry::DispatchRegistry;

use core::any::{Any, TypeId};
use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ----------------------------------------------------------------------------
// Priority
// ----------------------------------------------------------------------------

/// Priority bands, drained from `Critical` down to `Low`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const COUNT: usize = 4;

    pub(crate) fn band(self) -> usize {
        self as usize
    }
}

// ----------------------------------------------------------------------------
// Event Type
// ----------------------------------------------------------------------------

/// Runtime type tag of an event payload
#[derive(Debug, Clone, Copy)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
}

impl EventType {
    pub fn of<E: 'static>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: core::any::type_name::<E>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventType {}

impl core::hash::Hash for EventType {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ----------------------------------------------------------------------------
// Consumer Identity
// ----------------------------------------------------------------------------

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one registered consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

impl ConsumerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Event
// ----------------------------------------------------------------------------

/// Explicit destination of an event
#[derive(Debug, Clone)]
pub enum EventTarget {
    Dispatcher(DispatcherHandle),
    Named(String),
}

/// A unit of work travelling to exactly one consumer
pub struct Event {
    event_type: EventType,
    priority: Priority,
    consumer: Option<ConsumerId>,
    target: Option<EventTarget>,
    payload: Box<dyn Any + Send>,
}

impl Event {
    pub fn new<E: Send + 'static>(payload: E) -> Self {
        Self {
            event_type: EventType::of::<E>(),
            priority: Priority::Normal,
            consumer: None,
            target: None,
            payload: Box::new(payload),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Deliver to this consumer instead of the first one registered for the type
    pub fn for_consumer(mut self, consumer: ConsumerId) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn to_dispatcher(mut self, dispatcher: DispatcherHandle) -> Self {
        self.target = Some(EventTarget::Dispatcher(dispatcher));
        self
    }

    pub fn to_thread<N: Into<String>>(mut self, thread_name: N) -> Self {
        self.target = Some(EventTarget::Named(thread_name.into()));
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn consumer(&self) -> Option<ConsumerId> {
        self.consumer
    }

    pub fn target(&self) -> Option<&EventTarget> {
        self.target.as_ref()
    }

    pub fn bind_consumer(&mut self, consumer: ConsumerId) {
        self.consumer = Some(consumer);
    }

    pub(crate) fn take_target(&mut self) -> Option<EventTarget> {
        self.target.take()
    }

    pub fn is<E: 'static>(&self) -> bool {
        self.event_type.id == TypeId::of::<E>()
    }

    /// Checked downcast; gives the event back on a type mismatch
    pub fn downcast<E: 'static>(self) -> Result<E, Self> {
        if !self.is::<E>() {
            return Err(self);
        }

        let Event {
            event_type,
            priority,
            consumer,
            target,
            payload,
        } = self;

        match payload.downcast::<E>() {
            Ok(value) => Ok(*value),
            Err(payload) => Err(Event {
                event_type,
                priority,
                consumer,
                target,
                payload,
            }),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("type", &self.event_type.name)
            .field("priority", &self.priority)
            .field("consumer", &self.consumer)
            .field("target", &self.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Ping(u32);

    #[test]
    fn test_downcast_checks_type() {
        let event = Event::new(Ping(3)).with_priority(Priority::High);
        assert!(event.is::<Ping>());
        assert_eq!(event.priority(), Priority::High);

        let event = match event.downcast::<String>() {
            Ok(_) => panic!("downcast to the wrong type succeeded"),
            Err(event) => event,
        };
        assert_eq!(event.downcast::<Ping>().unwrap(), Ping(3));
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_consumer_ids_are_unique() {
        let a = ConsumerId::next();
        let b = ConsumerId::next();
        assert_ne!(a, b);
    }
}
