//! Dispatcher thread lifecycle state

use core::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::types::WaitTimeout;

/// Lifecycle of one dispatcher thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ThreadState {
    /// Whether posted events are still accepted
    pub fn accepts_events(self) -> bool {
        matches!(self, ThreadState::Starting | ThreadState::Running)
    }

    /// Whether the thread has finished (or never ran)
    pub fn is_terminal(self) -> bool {
        matches!(self, ThreadState::Idle | ThreadState::Stopped)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lock a std mutex, recovering the data of a poisoned one
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the owning thread and its observers
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<ThreadState>,
    changed: Condvar,
}

impl StateCell {
    pub fn new(initial: ThreadState) -> Self {
        Self {
            state: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> ThreadState {
        *lock(&self.state)
    }

    pub fn set(&self, state: ThreadState) -> ThreadState {
        let previous = std::mem::replace(&mut *lock(&self.state), state);
        self.changed.notify_all();
        previous
    }

    /// Block until `done` holds for the current state or the timeout elapses.
    /// Returns the last observed state.
    pub fn wait_until<F>(&self, timeout: WaitTimeout, done: F) -> ThreadState
    where
        F: Fn(ThreadState) -> bool,
    {
        let mut guard = lock(&self.state);
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);

        while !done(*guard) {
            match deadline {
                None => {
                    guard = self
                        .changed
                        .wait(guard)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    guard = self
                        .changed
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_wait_until_observes_transition() {
        let cell = Arc::new(StateCell::new(ThreadState::Starting));
        let setter = cell.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.set(ThreadState::Running);
        });

        let state = cell.wait_until(WaitTimeout::from_millis(2_000), |s| s == ThreadState::Running);
        assert_eq!(state, ThreadState::Running);
        worker.join().unwrap();
    }

    #[test]
    fn test_do_not_wait_returns_immediately() {
        let cell = StateCell::new(ThreadState::Idle);
        let state = cell.wait_until(WaitTimeout::DoNotWait, |s| s == ThreadState::Running);
        assert_eq!(state, ThreadState::Idle);
    }

    #[test]
    fn test_accepting_states() {
        assert!(ThreadState::Starting.accepts_events());
        assert!(ThreadState::Running.accepts_events());
        assert!(!ThreadState::Stopping.accepts_events());
        assert!(!ThreadState::Stopped.accepts_events());
        assert!(!ThreadState::Idle.accepts_events());
    }
}
