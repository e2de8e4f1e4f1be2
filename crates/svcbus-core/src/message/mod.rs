//! Wire envelope, channel addressing and stream framing

pub mod channel;
pub mod codec;
pub mod control;
pub mod ids;
pub mod remote;

pub use channel::Channel;
pub use codec::RemoteMessageCodec;
pub use control::{
    ConnectNotify, ConnectRequest, ControlMessage, DisconnectRequest, PeerNotice, ServiceNotice,
    ServiceRegistration,
};
pub use ids::{is_system_id, MessageResult, SystemMessageId, SYSTEM_ID_BASE};
pub use remote::{MessageHeader, RemoteMessage, BUFFER_TYPE_REMOTE, IGNORE_VALUE, INVALID_SIZE};
