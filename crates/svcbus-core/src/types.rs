//! Core types for the svcbus middleware
//!
//! This module defines the fundamental identity and timing types used
//! throughout the engine, using newtype patterns for type safety.

use core::fmt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ----------------------------------------------------------------------------
// Cookie
// ----------------------------------------------------------------------------

/// Peer-assigned identity of one endpoint within one connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cookie(u64);

impl Cookie {
    /// Identity not yet assigned by the peer
    pub const UNKNOWN: Self = Self(0);
    /// Endpoint that never leaves the process
    pub const LOCAL: Self = Self(1);
    /// The router (server role) itself
    pub const ROUTER: Self = Self(2);
    /// Wildcard, used to address "whichever socket this thread owns"
    pub const ANY: Self = Self(u64::MAX);
    /// First cookie a server hands out by default
    pub const FIRST_REMOTE: Self = Self(256);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Whether this is one of the reserved sentinel values
    pub fn is_sentinel(&self) -> bool {
        matches!(*self, Self::UNKNOWN | Self::LOCAL | Self::ROUTER | Self::ANY)
    }

    /// Whether this cookie can identify a connected remote peer
    pub fn is_remote(&self) -> bool {
        !self.is_sentinel()
    }
}

impl Default for Cookie {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNKNOWN => write!(f, "unknown"),
            Self::LOCAL => write!(f, "local"),
            Self::ROUTER => write!(f, "router"),
            Self::ANY => write!(f, "any"),
            Self(value) => write!(f, "{}", value),
        }
    }
}

// ----------------------------------------------------------------------------
// Item Identifier
// ----------------------------------------------------------------------------

/// Logical id of an endpoint (process, stub or proxy) within a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ItemId(u64);

impl ItemId {
    pub const UNKNOWN: Self = Self(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::UNKNOWN
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Wait Timeout
// ----------------------------------------------------------------------------

/// Deadline threaded through every blocking call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Block until the condition holds
    Infinite,
    /// Check once and return
    DoNotWait,
    /// Block for at most the given duration
    After(Duration),
}

impl WaitTimeout {
    pub fn from_millis(ms: u64) -> Self {
        WaitTimeout::After(Duration::from_millis(ms))
    }

    /// Bounded duration, `None` for `Infinite`
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            WaitTimeout::Infinite => None,
            WaitTimeout::DoNotWait => Some(Duration::ZERO),
            WaitTimeout::After(d) => Some(*d),
        }
    }
}

impl From<Duration> for WaitTimeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            WaitTimeout::DoNotWait
        } else {
            WaitTimeout::After(duration)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_sentinels() {
        assert!(Cookie::UNKNOWN.is_sentinel());
        assert!(Cookie::LOCAL.is_sentinel());
        assert!(Cookie::ROUTER.is_sentinel());
        assert!(Cookie::ANY.is_sentinel());
        assert!(Cookie::new(7).is_remote());
        assert!(Cookie::FIRST_REMOTE.is_remote());
    }

    #[test]
    fn test_cookie_display() {
        assert_eq!(format!("{}", Cookie::ROUTER), "router");
        assert_eq!(format!("{}", Cookie::new(300)), "300");
    }

    #[test]
    fn test_wait_timeout_duration() {
        assert_eq!(WaitTimeout::Infinite.as_duration(), None);
        assert_eq!(WaitTimeout::DoNotWait.as_duration(), Some(Duration::ZERO));
        assert_eq!(
            WaitTimeout::from(Duration::from_millis(5)),
            WaitTimeout::After(Duration::from_millis(5))
        );
    }
}
