//! Event consumers
//!
//! A consumer registers with one dispatcher for one event type. Dispatch calls
//! the `preprocess` gate first; an event the gate rejects is dropped with a
//! warning and never reaches `process_event`.

use async_trait::async_trait;
use core::marker::PhantomData;

use super::dispatcher::Dispatcher;
use super::Event;

/// Typed handler for events carrying an `E` payload
#[async_trait]
pub trait EventConsumer<E: Send + 'static>: Send + 'static {
    /// Gate evaluated before the handler runs
    fn preprocess(&mut self, _event: &E) -> bool {
        true
    }

    /// Handle one event on the dispatcher's own thread
    async fn process_event(&mut self, event: E, dispatcher: &mut Dispatcher);
}

// ----------------------------------------------------------------------------
// Closure Consumer
// ----------------------------------------------------------------------------

/// Consumer backed by a synchronous closure
pub struct FnConsumer<E, F> {
    handler: F,
    _event: PhantomData<fn(E)>,
}

/// Wrap a closure as an `EventConsumer`
pub fn consumer_fn<E, F>(handler: F) -> FnConsumer<E, F>
where
    E: Send + 'static,
    F: FnMut(E, &mut Dispatcher) + Send + 'static,
{
    FnConsumer {
        handler,
        _event: PhantomData,
    }
}

#[async_trait]
impl<E, F> EventConsumer<E> for FnConsumer<E, F>
where
    E: Send + 'static,
    F: FnMut(E, &mut Dispatcher) + Send + 'static,
{
    async fn process_event(&mut self, event: E, dispatcher: &mut Dispatcher) {
        (self.handler)(event, dispatcher)
    }
}

// ----------------------------------------------------------------------------
// Type Erasure
// ----------------------------------------------------------------------------

/// Outcome of handing an event to an erased consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Processed,
    Rejected,
    TypeMismatch,
}

#[async_trait]
pub(crate) trait ErasedConsumer: Send {
    async fn deliver(&mut self, event: Event, dispatcher: &mut Dispatcher) -> Delivery;
}

pub(crate) struct TypedConsumer<E, C> {
    inner: C,
    _event: PhantomData<fn(E)>,
}

impl<E, C> TypedConsumer<E, C>
where
    E: Send + 'static,
    C: EventConsumer<E>,
{
    pub(crate) fn boxed(inner: C) -> Box<dyn ErasedConsumer> {
        Box::new(Self {
            inner,
            _event: PhantomData,
        })
    }
}

#[async_trait]
impl<E, C> ErasedConsumer for TypedConsumer<E, C>
where
    E: Send + 'static,
    C: EventConsumer<E>,
{
    async fn deliver(&mut self, event: Event, dispatcher: &mut Dispatcher) -> Delivery {
        let payload = match event.downcast::<E>() {
            Ok(payload) => payload,
            Err(_) => return Delivery::TypeMismatch,
        };

        if !self.inner.preprocess(&payload) {
            return Delivery::Rejected;
        }

        self.inner.process_event(payload, dispatcher).await;
        Delivery::Processed
    }
}
