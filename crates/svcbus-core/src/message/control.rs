//! Control message bodies
//!
//! Router control traffic travels in ordinary envelopes whose message id lies
//! in the reserved range; the body is bincode encoded.

use serde::{Deserialize, Serialize};

use crate::message::ids::SystemMessageId;
use crate::message::remote::RemoteMessage;
use crate::types::{Cookie, ItemId};
use crate::Result;

/// Sent by an endpoint right after its socket connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Logical id of the connecting endpoint
    pub source: ItemId,
    /// Always `Cookie::UNKNOWN`; the router assigns the real one
    pub cookie: Cookie,
}

/// Router answer to `ConnectRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectNotify {
    /// Logical id of the router
    pub source: ItemId,
    /// Echo of the requesting endpoint id
    pub target: ItemId,
    /// Cookie assigned to the requesting endpoint
    pub cookie: Cookie,
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub source: ItemId,
    pub cookie: Cookie,
}

/// Body of the register / unregister provider and consumer messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service: String,
    pub endpoint: Cookie,
}

/// Body of the service available / unavailable notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNotice {
    pub service: String,
    pub provider: Cookie,
}

/// Body of the peer disconnected broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNotice {
    pub cookie: Cookie,
}

// ----------------------------------------------------------------------------
// Decoded Control Message
// ----------------------------------------------------------------------------

/// A control envelope with its body decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Connect(ConnectRequest),
    ConnectNotify(ConnectNotify),
    Disconnect(DisconnectRequest),
    RegisterProvider(ServiceRegistration),
    UnregisterProvider(ServiceRegistration),
    RegisterConsumer(ServiceRegistration),
    UnregisterConsumer(ServiceRegistration),
    ServiceAvailable(ServiceNotice),
    ServiceUnavailable(ServiceNotice),
    PeerDisconnected(PeerNotice),
}

impl ControlMessage {
    /// Decode a control envelope; `None` for application messages
    pub fn decode(message: &RemoteMessage) -> Result<Option<Self>> {
        let id = match message.system_id() {
            Some(id) => id,
            None => return Ok(None),
        };

        let decoded = match id {
            SystemMessageId::RouterConnect => ControlMessage::Connect(message.decode_body()?),
            SystemMessageId::RouterConnectNotify => {
                ControlMessage::ConnectNotify(message.decode_body()?)
            }
            SystemMessageId::RouterDisconnect => ControlMessage::Disconnect(message.decode_body()?),
            SystemMessageId::RegisterProvider => {
                ControlMessage::RegisterProvider(message.decode_body()?)
            }
            SystemMessageId::UnregisterProvider => {
                ControlMessage::UnregisterProvider(message.decode_body()?)
            }
            SystemMessageId::RegisterConsumer => {
                ControlMessage::RegisterConsumer(message.decode_body()?)
            }
            SystemMessageId::UnregisterConsumer => {
                ControlMessage::UnregisterConsumer(message.decode_body()?)
            }
            SystemMessageId::ServiceAvailable => {
                ControlMessage::ServiceAvailable(message.decode_body()?)
            }
            SystemMessageId::ServiceUnavailable => {
                ControlMessage::ServiceUnavailable(message.decode_body()?)
            }
            SystemMessageId::PeerDisconnected => {
                ControlMessage::PeerDisconnected(message.decode_body()?)
            }
        };

        Ok(Some(decoded))
    }

    pub fn id(&self) -> SystemMessageId {
        match self {
            ControlMessage::Connect(_) => SystemMessageId::RouterConnect,
            ControlMessage::ConnectNotify(_) => SystemMessageId::RouterConnectNotify,
            ControlMessage::Disconnect(_) => SystemMessageId::RouterDisconnect,
            ControlMessage::RegisterProvider(_) => SystemMessageId::RegisterProvider,
            ControlMessage::UnregisterProvider(_) => SystemMessageId::UnregisterProvider,
            ControlMessage::RegisterConsumer(_) => SystemMessageId::RegisterConsumer,
            ControlMessage::UnregisterConsumer(_) => SystemMessageId::UnregisterConsumer,
            ControlMessage::ServiceAvailable(_) => SystemMessageId::ServiceAvailable,
            ControlMessage::ServiceUnavailable(_) => SystemMessageId::ServiceUnavailable,
            ControlMessage::PeerDisconnected(_) => SystemMessageId::PeerDisconnected,
        }
    }

    /// Wrap into an envelope addressed to `target`
    pub fn into_message(self, target: Cookie, source: Cookie) -> Result<RemoteMessage> {
        let id = self.id();
        match &self {
            ControlMessage::Connect(body) => RemoteMessage::control(id, target, source, body),
            ControlMessage::ConnectNotify(body) => RemoteMessage::control(id, target, source, body),
            ControlMessage::Disconnect(body) => RemoteMessage::control(id, target, source, body),
            ControlMessage::RegisterProvider(body)
            | ControlMessage::UnregisterProvider(body)
            | ControlMessage::RegisterConsumer(body)
            | ControlMessage::UnregisterConsumer(body) => {
                RemoteMessage::control(id, target, source, body)
            }
            ControlMessage::ServiceAvailable(body) | ControlMessage::ServiceUnavailable(body) => {
                RemoteMessage::control(id, target, source, body)
            }
            ControlMessage::PeerDisconnected(body) => {
                RemoteMessage::control(id, target, source, body)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_notify_through_envelope() {
        let notify = ControlMessage::ConnectNotify(ConnectNotify {
            source: ItemId::new(1),
            target: ItemId::new(99),
            cookie: Cookie::new(7),
            accepted: true,
        });

        let message = notify.clone().into_message(Cookie::UNKNOWN, Cookie::ROUTER).unwrap();
        assert_eq!(message.system_id(), Some(SystemMessageId::RouterConnectNotify));
        assert_eq!(message.source_cookie(), Cookie::ROUTER);

        let decoded = ControlMessage::decode(&message).unwrap();
        assert_eq!(decoded, Some(notify));
    }

    #[test]
    fn test_application_message_is_not_control() {
        let message = RemoteMessage::request(42, Cookie::ROUTER, &b"app"[..]);
        assert_eq!(ControlMessage::decode(&message).unwrap(), None);
    }

    #[test]
    fn test_truncated_body_is_an_error() {
        let mut message = ControlMessage::RegisterProvider(ServiceRegistration {
            service: "clock".to_string(),
            endpoint: Cookie::new(300),
        })
        .into_message(Cookie::ROUTER, Cookie::new(300))
        .unwrap();
        message.set_payload(&b"\x01"[..]);

        assert!(ControlMessage::decode(&message).is_err());
    }
}
