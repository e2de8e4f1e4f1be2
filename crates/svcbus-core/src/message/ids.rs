//! Message identifiers and result codes carried in the envelope header

use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Result Codes
// ----------------------------------------------------------------------------

/// Outcome carried in the `result` header field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u16)]
pub enum MessageResult {
    #[default]
    Succeed = 0,
    NotProcessed = 1,
    InvalidBuffer = 2,
    UnknownError = 3,
    Ignored = 4,
    ServiceUnavailable = 5,
    Rejected = 6,
}

impl MessageResult {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Unknown codes read from the wire collapse to `UnknownError`
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => MessageResult::Succeed,
            1 => MessageResult::NotProcessed,
            2 => MessageResult::InvalidBuffer,
            4 => MessageResult::Ignored,
            5 => MessageResult::ServiceUnavailable,
            6 => MessageResult::Rejected,
            _ => MessageResult::UnknownError,
        }
    }

    pub fn is_success(self) -> bool {
        self == MessageResult::Succeed
    }
}

impl fmt::Display for MessageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ----------------------------------------------------------------------------
// System Message Identifiers
// ----------------------------------------------------------------------------

/// Lowest message id reserved for router control traffic.
/// Application ids must stay below it.
pub const SYSTEM_ID_BASE: u32 = 0xFFFF_0000;

/// Control messages exchanged between endpoints and the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum SystemMessageId {
    RouterConnect = SYSTEM_ID_BASE + 1,
    RouterConnectNotify = SYSTEM_ID_BASE + 2,
    RouterDisconnect = SYSTEM_ID_BASE + 3,
    RegisterProvider = SYSTEM_ID_BASE + 4,
    UnregisterProvider = SYSTEM_ID_BASE + 5,
    RegisterConsumer = SYSTEM_ID_BASE + 6,
    UnregisterConsumer = SYSTEM_ID_BASE + 7,
    ServiceAvailable = SYSTEM_ID_BASE + 8,
    ServiceUnavailable = SYSTEM_ID_BASE + 9,
    PeerDisconnected = SYSTEM_ID_BASE + 10,
}

impl SystemMessageId {
    pub const ALL: [SystemMessageId; 10] = [
        SystemMessageId::RouterConnect,
        SystemMessageId::RouterConnectNotify,
        SystemMessageId::RouterDisconnect,
        SystemMessageId::RegisterProvider,
        SystemMessageId::UnregisterProvider,
        SystemMessageId::RegisterConsumer,
        SystemMessageId::UnregisterConsumer,
        SystemMessageId::ServiceAvailable,
        SystemMessageId::ServiceUnavailable,
        SystemMessageId::PeerDisconnected,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|id| id.as_u32() == value)
    }
}

/// Whether the id belongs to the reserved control range
pub fn is_system_id(message_id: u32) -> bool {
    message_id >= SYSTEM_ID_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes_roundtrip() {
        for result in [
            MessageResult::Succeed,
            MessageResult::NotProcessed,
            MessageResult::ServiceUnavailable,
            MessageResult::Rejected,
        ] {
            assert_eq!(MessageResult::from_u16(result.as_u16()), result);
        }
        assert_eq!(MessageResult::from_u16(999), MessageResult::UnknownError);
    }

    #[test]
    fn test_system_id_lookup() {
        assert_eq!(
            SystemMessageId::from_u32(SYSTEM_ID_BASE + 2),
            Some(SystemMessageId::RouterConnectNotify)
        );
        assert_eq!(SystemMessageId::from_u32(42), None);
        assert!(!is_system_id(42));
        assert!(is_system_id(SystemMessageId::PeerDisconnected.as_u32()));
    }
}
