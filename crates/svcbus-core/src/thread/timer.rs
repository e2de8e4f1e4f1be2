//! Timers posting events to a dispatcher
//!
//! A timer runs as a task on the target dispatcher's runtime. Every expiry
//! posts one event built by the caller's factory from a `TimerTick`. Restarting
//! or stopping the timer bumps its generation, so a tick that was already
//! queued can be recognised as stale by `is_current`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::event::{ConsumerId, DispatcherHandle, Event, Priority};

/// How often a started timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRepeat {
    Once,
    Times(u32),
    Continuous,
}

impl TimerRepeat {
    fn is_done(self, fired: u64) -> bool {
        match self {
            TimerRepeat::Once => fired >= 1,
            TimerRepeat::Times(n) => fired >= u64::from(n),
            TimerRepeat::Continuous => false,
        }
    }
}

/// One expiry of a timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTick {
    pub name: Arc<str>,
    pub generation: u64,
    /// 1-based expiry count within this generation
    pub count: u64,
}

pub struct Timer {
    name: Arc<str>,
    target: DispatcherHandle,
    consumer: Option<ConsumerId>,
    priority: Priority,
    generation: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl Timer {
    pub fn new<N: AsRef<str>>(name: N, target: DispatcherHandle) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            target,
            consumer: None,
            priority: Priority::Normal,
            generation: Arc::new(AtomicU64::new(0)),
            active: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    /// Bind expiry events to one consumer of the target dispatcher
    pub fn for_consumer(mut self, consumer: ConsumerId) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whether `tick` belongs to the current run of this timer
    pub fn is_current(&self, tick: &TimerTick) -> bool {
        tick.name == self.name && tick.generation == self.generation.load(Ordering::Acquire)
    }

    /// Start (or restart) the timer. Returns false when the target dispatcher
    /// has no runtime to run on.
    pub fn start<E, F>(&mut self, period: Duration, repeat: TimerRepeat, factory: F) -> bool
    where
        E: Send + 'static,
        F: Fn(TimerTick) -> E + Send + 'static,
    {
        self.cancel_task();

        let runtime = match self.target.runtime() {
            Some(runtime) => runtime,
            None => {
                self.active.store(false, Ordering::Release);
                return false;
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.active.store(true, Ordering::Release);

        let name = self.name.clone();
        let target = self.target.clone();
        let consumer = self.consumer;
        let priority = self.priority;
        let current = self.generation.clone();
        let active = self.active.clone();

        let task = runtime.spawn(async move {
            let mut fired = 0u64;
            loop {
                tokio::time::sleep(period).await;
                if current.load(Ordering::Acquire) != generation {
                    break;
                }

                fired += 1;
                let tick = TimerTick {
                    name: name.clone(),
                    generation,
                    count: fired,
                };
                let mut event = Event::new(factory(tick)).with_priority(priority);
                if let Some(consumer) = consumer {
                    event.bind_consumer(consumer);
                }

                trace!(timer = %name, fired, "Timer expired");
                if !target.post(event) || repeat.is_done(fired) {
                    break;
                }
            }

            if current.load(Ordering::Acquire) == generation {
                active.store(false, Ordering::Release);
            }
        });

        self.task = Some(task.abort_handle());
        debug!(timer = %self.name, ?period, ?repeat, "Timer started");
        true
    }

    /// Stop the timer; ticks already queued become stale
    pub fn stop(&mut self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.active.store(false, Ordering::Release);
        self.cancel_task();
    }

    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.name)
            .field("target", &self.target.name())
            .field("active", &self.is_active())
            .finish()
    }
}
