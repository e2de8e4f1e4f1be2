//! Connection state and the shared connection object
//!
//! States carry a bit-flag encoding: `0x20` marks the connect-like states and
//! `0x10` the disconnect-like ones, so both classifications are a mask test.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use svcbus_core::WaitTimeout;

const CONNECT_BIT: u8 = 0x20;
const DISCONNECT_BIT: u8 = 0x10;

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Stopped = DISCONNECT_BIT | 0x01,
    Stopping = DISCONNECT_BIT | 0x02,
    Starting = CONNECT_BIT | 0x01,
    Started = CONNECT_BIT | 0x02,
}

impl ConnectionState {
    pub fn bits(self) -> u8 {
        self as u8
    }

    /// Starting or Started
    pub fn is_connect_like(self) -> bool {
        self.bits() & CONNECT_BIT != 0
    }

    /// Stopping or Stopped
    pub fn is_disconnect_like(self) -> bool {
        self.bits() & DISCONNECT_BIT != 0
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Stopped
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::Stopping => "stopping",
            ConnectionState::Starting => "starting",
            ConnectionState::Started => "started",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Shared Object
// ----------------------------------------------------------------------------

/// Coarse lock around the fields a state machine shares with its host surface
/// and I/O threads, with a condition variable for waiting on changes
#[derive(Debug, Default)]
pub struct Shared<T> {
    value: Mutex<T>,
    changed: Condvar,
}

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mutate under the lock and wake every waiter
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.lock());
        self.changed.notify_all();
        result
    }

    /// Block until `pred` holds or the timeout elapses; returns whether it held
    pub fn wait_until<F: Fn(&T) -> bool>(&self, timeout: WaitTimeout, pred: F) -> bool {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut guard = self.lock();

        loop {
            if pred(&guard) {
                return true;
            }
            match (timeout, deadline) {
                (WaitTimeout::DoNotWait, _) => return false,
                (_, None) => {
                    guard = self
                        .changed
                        .wait(guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                (_, Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    guard = self
                        .changed
                        .wait_timeout(guard, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_state_classification() {
        assert_eq!(ConnectionState::Stopped.bits(), 0x11);
        assert_eq!(ConnectionState::Stopping.bits(), 0x12);
        assert_eq!(ConnectionState::Starting.bits(), 0x21);
        assert_eq!(ConnectionState::Started.bits(), 0x22);

        assert!(ConnectionState::Starting.is_connect_like());
        assert!(ConnectionState::Started.is_connect_like());
        assert!(!ConnectionState::Started.is_disconnect_like());
        assert!(ConnectionState::Stopping.is_disconnect_like());
        assert!(!ConnectionState::Stopped.is_connect_like());
    }

    #[test]
    fn test_wait_until_sees_update_from_other_thread() {
        let shared = Arc::new(Shared::new(ConnectionState::Stopped));
        let writer = shared.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.update(|state| *state = ConnectionState::Started);
        });

        assert!(shared.wait_until(WaitTimeout::from_millis(5_000), |s| *s
            == ConnectionState::Started));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_until_times_out() {
        let shared = Shared::new(0u32);
        assert!(!shared.wait_until(WaitTimeout::DoNotWait, |v| *v == 1));
        assert!(!shared.wait_until(WaitTimeout::from_millis(10), |v| *v == 1));
    }
}
