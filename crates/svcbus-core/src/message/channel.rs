//! Channel addressing triple

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::types::{Cookie, ItemId};
use crate::SvcbusError;

/// Identifies one communicating pair: (cookie, source, target).
///
/// Only meaningful while the owning connection is started; reset to the
/// unknown triple on every disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Channel {
    cookie: Cookie,
    source: ItemId,
    target: ItemId,
}

impl Channel {
    pub const fn new(cookie: Cookie, source: ItemId, target: ItemId) -> Self {
        Self {
            cookie,
            source,
            target,
        }
    }

    /// The (unknown, unknown, unknown) triple
    pub const fn unknown() -> Self {
        Self::new(Cookie::UNKNOWN, ItemId::UNKNOWN, ItemId::UNKNOWN)
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn source(&self) -> ItemId {
        self.source
    }

    pub fn target(&self) -> ItemId {
        self.target
    }

    pub fn set_cookie(&mut self, cookie: Cookie) {
        self.cookie = cookie;
    }

    pub fn set_source(&mut self, source: ItemId) {
        self.source = source;
    }

    pub fn set_target(&mut self, target: ItemId) {
        self.target = target;
    }

    /// A channel is usable once the peer assigned a concrete cookie
    pub fn is_valid(&self) -> bool {
        self.cookie != Cookie::UNKNOWN && self.cookie != Cookie::ANY && self.source.is_valid()
    }

    pub fn reset(&mut self) {
        *self = Self::unknown();
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.cookie.value(),
            self.source.value(),
            self.target.value()
        )
    }
}

impl FromStr for Channel {
    type Err = SvcbusError;

    /// Parse the `cookie.source.target` form produced by `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(SvcbusError::malformed(format!("invalid channel '{}'", s)));
        }

        let mut values = [0u64; 3];
        for (value, part) in values.iter_mut().zip(parts) {
            *value = part
                .trim()
                .parse()
                .map_err(|_| SvcbusError::malformed(format!("invalid channel '{}'", s)))?;
        }

        Ok(Self::new(
            Cookie::new(values[0]),
            ItemId::new(values[1]),
            ItemId::new(values[2]),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_returns_unknown_triple() {
        let mut channel = Channel::new(Cookie::new(300), ItemId::new(5), ItemId::new(9));
        assert!(channel.is_valid());

        channel.reset();
        assert_eq!(channel, Channel::unknown());
        assert!(!channel.is_valid());
    }

    #[test]
    fn test_string_form() {
        let channel = Channel::new(Cookie::new(7), ItemId::new(1), ItemId::new(2));
        assert_eq!(channel.to_string(), "7.1.2");
        assert_eq!("7.1.2".parse::<Channel>().unwrap(), channel);
        assert!("7.1".parse::<Channel>().is_err());
        assert!("a.b.c".parse::<Channel>().is_err());
    }
}
