//! The remote message envelope
//!
//! A `RemoteMessage` is a fixed 52 byte big-endian header followed by an opaque
//! payload. The header checksum is a CRC-32 over every other header field and
//! the payload; a receiver never trusts a header whose checksum does not match.

use bytes::{BufMut, Bytes, BytesMut};
use core::convert::TryInto;
use serde::{de::DeserializeOwned, Serialize};

use crate::config::HEADER_SIZE;
use crate::errors::MessageError;
use crate::message::ids::{MessageResult, SystemMessageId};
use crate::types::Cookie;
use crate::{Result, SvcbusError};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Size field value marking an invalidated envelope
pub const INVALID_SIZE: u32 = u32::MAX;

/// Size field value marking an envelope that must be skipped
pub const IGNORE_VALUE: u32 = u32::MAX - 1;

/// Buffer type tag of envelopes that cross a socket
pub const BUFFER_TYPE_REMOTE: u16 = 0x0052;

// Byte offsets of the header fields
const OFFSET_CHECKSUM: usize = 26;
const OFFSET_CHECKSUM_END: usize = 30;

// ----------------------------------------------------------------------------
// Header
// ----------------------------------------------------------------------------

/// Envelope header, field order matches the wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total frame length, header included
    pub buffer_size: u32,
    pub payload_length: u32,
    pub buffer_type: u16,
    pub used_length: u32,
    pub ref_count: u32,
    pub target_cookie: Cookie,
    pub checksum: u32,
    pub source_cookie: Cookie,
    pub message_id: u32,
    pub result: MessageResult,
    pub sequence_nr: u64,
}

impl MessageHeader {
    fn for_payload(message_id: u32, payload_len: usize) -> Self {
        Self {
            buffer_size: (HEADER_SIZE + payload_len) as u32,
            payload_length: payload_len as u32,
            buffer_type: BUFFER_TYPE_REMOTE,
            used_length: payload_len as u32,
            ref_count: 1,
            target_cookie: Cookie::UNKNOWN,
            checksum: 0,
            source_cookie: Cookie::UNKNOWN,
            message_id,
            result: MessageResult::Succeed,
            sequence_nr: 0,
        }
    }

    fn invalid() -> Self {
        Self {
            buffer_size: INVALID_SIZE,
            payload_length: INVALID_SIZE,
            buffer_type: 0,
            used_length: INVALID_SIZE,
            ref_count: 0,
            target_cookie: Cookie::UNKNOWN,
            checksum: 0,
            source_cookie: Cookie::UNKNOWN,
            message_id: 0,
            result: MessageResult::InvalidBuffer,
            sequence_nr: 0,
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.buffer_size);
        buf.put_u32(self.payload_length);
        buf.put_u16(self.buffer_type);
        buf.put_u32(self.used_length);
        buf.put_u32(self.ref_count);
        buf.put_u64(self.target_cookie.value());
        buf.put_u32(self.checksum);
        buf.put_u64(self.source_cookie.value());
        buf.put_u32(self.message_id);
        buf.put_u16(self.result.as_u16());
        buf.put_u64(self.sequence_nr);
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(MessageError::TooShort {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            }
            .into());
        }

        let mut reader = FieldReader { bytes, offset: 0 };
        Ok(Self {
            buffer_size: reader.u32()?,
            payload_length: reader.u32()?,
            buffer_type: reader.u16()?,
            used_length: reader.u32()?,
            ref_count: reader.u32()?,
            target_cookie: Cookie::new(reader.u64()?),
            checksum: reader.u32()?,
            source_cookie: Cookie::new(reader.u64()?),
            message_id: reader.u32()?,
            result: MessageResult::from_u16(reader.u16()?),
            sequence_nr: reader.u64()?,
        })
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl FieldReader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let field: [u8; N] = self.bytes[self.offset..self.offset + N]
            .try_into()
            .map_err(|_| SvcbusError::malformed("header field out of range"))?;
        self.offset += N;
        Ok(field)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take::<2>()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take::<4>()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take::<8>()?))
    }
}

fn frame_checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[..OFFSET_CHECKSUM]);
    hasher.update(&header[OFFSET_CHECKSUM_END..HEADER_SIZE]);
    hasher.update(payload);
    hasher.finalize()
}

// ----------------------------------------------------------------------------
// Remote Message
// ----------------------------------------------------------------------------

/// Header plus payload exchanged over a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    header: MessageHeader,
    payload: Bytes,
}

impl Default for RemoteMessage {
    /// The default envelope is invalid
    fn default() -> Self {
        Self::invalid()
    }
}

impl RemoteMessage {
    /// New envelope with the given id and payload; cookies start as unknown
    pub fn new(message_id: u32, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            header: MessageHeader::for_payload(message_id, payload.len()),
            payload,
        }
    }

    /// New request addressed to `target`
    pub fn request(message_id: u32, target: Cookie, payload: impl Into<Bytes>) -> Self {
        let mut message = Self::new(message_id, payload);
        message.header.target_cookie = target;
        message
    }

    /// Control message with a bincode encoded body
    pub fn control<T: Serialize>(
        id: SystemMessageId,
        target: Cookie,
        source: Cookie,
        body: &T,
    ) -> Result<Self> {
        let payload = bincode::serialize(body)?;
        let mut message = Self::request(id.as_u32(), target, payload);
        message.header.source_cookie = source;
        Ok(message)
    }

    pub fn invalid() -> Self {
        Self {
            header: MessageHeader::invalid(),
            payload: Bytes::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn message_id(&self) -> u32 {
        self.header.message_id
    }

    pub fn system_id(&self) -> Option<SystemMessageId> {
        SystemMessageId::from_u32(self.header.message_id)
    }

    pub fn target_cookie(&self) -> Cookie {
        self.header.target_cookie
    }

    pub fn source_cookie(&self) -> Cookie {
        self.header.source_cookie
    }

    pub fn result(&self) -> MessageResult {
        self.header.result
    }

    pub fn sequence_nr(&self) -> u64 {
        self.header.sequence_nr
    }

    pub fn set_target_cookie(&mut self, cookie: Cookie) {
        self.header.target_cookie = cookie;
    }

    pub fn set_source_cookie(&mut self, cookie: Cookie) {
        self.header.source_cookie = cookie;
    }

    pub fn set_sequence_nr(&mut self, sequence_nr: u64) {
        self.header.sequence_nr = sequence_nr;
    }

    pub fn set_result(&mut self, result: MessageResult) {
        self.header.result = result;
    }

    /// Replace the payload, keeping the size fields consistent
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
        let len = self.payload.len() as u32;
        self.header.payload_length = len;
        self.header.used_length = len;
        self.header.buffer_size = HEADER_SIZE as u32 + len;
    }

    /// Decode the bincode body of a control message
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    // ------------------------------------------------------------------------
    // Validity
    // ------------------------------------------------------------------------

    /// False for invalidated or ignore-marked envelopes
    pub fn is_valid(&self) -> bool {
        let sizes = [
            self.header.buffer_size,
            self.header.payload_length,
            self.header.used_length,
        ];
        !sizes.iter().any(|s| *s == INVALID_SIZE || *s == IGNORE_VALUE)
    }

    /// Mark the envelope so that receivers skip it
    pub fn mark_ignored(&mut self) {
        self.header.buffer_size = IGNORE_VALUE;
        self.header.result = MessageResult::Ignored;
    }

    /// Reset to sentinel sizes and an empty payload
    pub fn invalidate(&mut self) {
        *self = Self::invalid();
    }

    /// Move the envelope out, leaving an invalidated one behind
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    /// CRC-32 over the header without the checksum field, then the payload
    pub fn compute_checksum(&self) -> u32 {
        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        self.header.write_to(&mut header);
        frame_checksum(&header, &self.payload)
    }

    /// Store the current checksum in the header
    pub fn seal(&mut self) {
        self.header.checksum = self.compute_checksum();
    }

    pub fn is_checksum_valid(&self) -> bool {
        self.header.checksum == self.compute_checksum()
    }

    /// Failure answer to this message: cookies swapped, empty payload
    pub fn failure_response(&self, result: MessageResult) -> Self {
        let mut response = Self::new(self.header.message_id, Bytes::new());
        response.header.target_cookie = self.header.source_cookie;
        response.header.source_cookie = self.header.target_cookie;
        response.header.sequence_nr = self.header.sequence_nr;
        response.header.result = result;
        response
    }

    // ------------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------------

    /// Serialize into `buf`, writing a freshly computed checksum
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        if !self.is_valid() {
            return Err(MessageError::InvalidSize.into());
        }

        let mut header = self.header;
        header.checksum = self.compute_checksum();

        buf.reserve(HEADER_SIZE + self.payload.len());
        header.write_to(buf);
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse one complete frame and verify its checksum
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = MessageHeader::read_from(bytes)?;

        if header.buffer_size == INVALID_SIZE || header.buffer_size == IGNORE_VALUE {
            return Err(MessageError::InvalidSize.into());
        }
        if header.buffer_size as usize != bytes.len() {
            return Err(SvcbusError::malformed(format!(
                "buffer size {} does not match frame length {}",
                header.buffer_size,
                bytes.len()
            )));
        }
        if header.payload_length as usize != bytes.len() - HEADER_SIZE
            || header.used_length != header.payload_length
        {
            return Err(SvcbusError::malformed("payload length inconsistent"));
        }

        // Verified over the raw bytes, before any field is interpreted
        let actual = frame_checksum(&bytes[..HEADER_SIZE], &bytes[HEADER_SIZE..]);
        if header.checksum != actual {
            return Err(MessageError::ChecksumFailed {
                expected: header.checksum,
                actual,
            }
            .into());
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RemoteMessage {
        let mut message = RemoteMessage::request(42, Cookie::ROUTER, &b"hello"[..]);
        message.set_source_cookie(Cookie::new(7));
        message.set_sequence_nr(3);
        message
    }

    #[test]
    fn test_header_is_fifty_two_bytes() {
        let bytes = RemoteMessage::new(1, Bytes::new()).to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..4], &(HEADER_SIZE as u32).to_be_bytes());
    }

    #[test]
    fn test_roundtrip_preserves_fields() {
        let message = sample();
        let decoded = RemoteMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();

        assert!(decoded.is_checksum_valid());
        assert_eq!(decoded.message_id(), 42);
        assert_eq!(decoded.target_cookie(), Cookie::ROUTER);
        assert_eq!(decoded.source_cookie(), Cookie::new(7));
        assert_eq!(decoded.sequence_nr(), 3);
        assert_eq!(decoded.payload().as_ref(), b"hello");
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let mut bytes = sample().to_bytes().unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        assert!(matches!(
            RemoteMessage::from_bytes(&bytes),
            Err(SvcbusError::Message(MessageError::ChecksumFailed { .. }))
        ));
    }

    #[test]
    fn test_take_invalidates_source() {
        let mut message = sample();
        let taken = message.take();

        assert!(taken.is_valid());
        assert!(!message.is_valid());
        assert!(message.payload().is_empty());
        assert!(message.to_bytes().is_err());
    }

    #[test]
    fn test_failure_response_swaps_cookies() {
        let response = sample().failure_response(MessageResult::NotProcessed);

        assert_eq!(response.message_id(), 42);
        assert_eq!(response.target_cookie(), Cookie::new(7));
        assert_eq!(response.source_cookie(), Cookie::ROUTER);
        assert_eq!(response.result(), MessageResult::NotProcessed);
        assert_eq!(response.sequence_nr(), 3);
        assert!(response.payload().is_empty());
    }

    #[test]
    fn test_ignored_message_not_encodable() {
        let mut message = sample();
        message.mark_ignored();
        assert!(!message.is_valid());
        assert!(message.to_bytes().is_err());
    }
}
