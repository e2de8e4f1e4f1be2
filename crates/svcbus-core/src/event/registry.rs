//! Process-wide dispatch registry
//!
//! Maps thread names to dispatcher handles and keeps, per event type, how many
//! consumers each dispatcher has registered. `post_event` resolves the target
//! dispatcher of an event from these two tables.

use core::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::dispatcher::DispatcherHandle;
use super::{Event, EventTarget, EventType};
use crate::errors::DispatchError;

#[derive(Debug, Default)]
pub struct DispatchRegistry {
    threads: DashMap<String, DispatcherHandle>,
    consumers: DashMap<TypeId, HashMap<String, usize>>,
    dropped: AtomicU64,
}

impl DispatchRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ------------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------------

    pub(crate) fn insert_dispatcher(&self, handle: DispatcherHandle) {
        debug!(dispatcher = %handle.name(), "Dispatcher registered");
        self.threads.insert(handle.name().to_string(), handle);
    }

    /// Remove `handle` unless the name was already taken over by a newer thread
    pub(crate) fn remove_dispatcher(&self, handle: &DispatcherHandle) {
        let removed = self
            .threads
            .remove_if(handle.name(), |_, current| current.same_dispatcher(handle));

        if removed.is_some() {
            debug!(dispatcher = %handle.name(), "Dispatcher unregistered");
        }
    }

    pub fn dispatcher(&self, thread_name: &str) -> Option<DispatcherHandle> {
        self.threads.get(thread_name).map(|entry| entry.value().clone())
    }

    pub fn thread_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.threads.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------------
    // Consumer Bookkeeping
    // ------------------------------------------------------------------------

    pub(crate) fn consumer_added(&self, event_type: EventType, thread_name: &str) {
        *self
            .consumers
            .entry(event_type.id())
            .or_default()
            .entry(thread_name.to_string())
            .or_insert(0) += 1;
    }

    pub(crate) fn consumer_removed(&self, event_type: EventType, thread_name: &str) {
        if let Some(mut per_thread) = self.consumers.get_mut(&event_type.id()) {
            if let Some(count) = per_thread.get_mut(thread_name) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    per_thread.remove(thread_name);
                }
            }
        }
        self.consumers
            .remove_if(&event_type.id(), |_, per_thread| per_thread.is_empty());
    }

    /// Names of the threads with at least one consumer of `event_type`
    pub fn consumer_threads(&self, event_type: EventType) -> Vec<String> {
        let mut names: Vec<String> = self
            .consumers
            .get(&event_type.id())
            .map(|per_thread| per_thread.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// The single dispatcher with a consumer for `E`
    pub fn event_consumer_thread<E: 'static>(&self) -> Option<DispatcherHandle> {
        self.resolve_by_type(EventType::of::<E>()).ok()
    }

    fn resolve_by_type(&self, event_type: EventType) -> Result<DispatcherHandle, DispatchError> {
        let names = self.consumer_threads(event_type);
        match names.as_slice() {
            [name] => self.dispatcher(name).ok_or_else(|| DispatchError::NotRunning {
                name: name.clone(),
            }),
            [] => Err(DispatchError::NoConsumer {
                event_type: event_type.name().to_string(),
            }),
            _ => Err(DispatchError::AmbiguousRoute {
                event_type: event_type.name().to_string(),
                count: names.len(),
            }),
        }
    }

    /// Find the dispatcher an event is destined for
    pub fn resolve(&self, event: &Event) -> Result<DispatcherHandle, DispatchError> {
        match event.target() {
            Some(EventTarget::Dispatcher(handle)) => Ok(handle.clone()),
            Some(EventTarget::Named(name)) => self
                .dispatcher(name)
                .ok_or_else(|| DispatchError::NotRunning { name: name.clone() }),
            None => self.resolve_by_type(event.event_type()),
        }
    }

    // ------------------------------------------------------------------------
    // Posting
    // ------------------------------------------------------------------------

    /// Route and enqueue an event. On failure the event is dropped here and
    /// false is returned.
    pub fn post_event(&self, mut event: Event) -> bool {
        let handle = match self.resolve(&event) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(event_type = %event.event_type(), error = %e, "Unable to route event, dropping");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        event.take_target();
        if handle.post(event) {
            true
        } else {
            warn!(dispatcher = %handle.name(), "Dispatcher refused event, dropping");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Events dropped because no route or no running dispatcher was found
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
