//! Stream framing of remote messages
//!
//! Frames are self-delimiting: the leading `buffer_size` field carries the
//! total frame length. Sentinel, undersized and oversized lengths are framing
//! errors (the stream cannot be resynchronized). A complete frame whose
//! checksum or header is inconsistent decodes as an invalidated message.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::HEADER_SIZE;
use crate::errors::MessageError;
use crate::message::remote::{RemoteMessage, IGNORE_VALUE, INVALID_SIZE};
use crate::SvcbusError;

/// `tokio_util` codec for `RemoteMessage` frames
#[derive(Debug, Clone)]
pub struct RemoteMessageCodec {
    max_frame: usize,
}

impl RemoteMessageCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for RemoteMessageCodec {
    fn default() -> Self {
        Self::new(crate::config::ConnectionConfig::default().max_message_size)
    }
}

impl Decoder for RemoteMessageCodec {
    type Item = RemoteMessage;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if size == INVALID_SIZE || size == IGNORE_VALUE {
            return Err(MessageError::InvalidSize);
        }

        let size = size as usize;
        if size < HEADER_SIZE {
            return Err(MessageError::TooShort {
                expected: HEADER_SIZE,
                actual: size,
            });
        }
        if size > self.max_frame {
            return Err(MessageError::TooLarge {
                max: self.max_frame,
                actual: size,
            });
        }

        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let frame = src.split_to(size);
        match RemoteMessage::from_bytes(&frame) {
            Ok(message) => Ok(Some(message)),
            Err(SvcbusError::Message(MessageError::Io(e))) => Err(MessageError::Io(e)),
            Err(_) => Ok(Some(RemoteMessage::invalid())),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.is_empty() => Ok(None),
            None => {
                let remaining = buf.remaining();
                buf.clear();
                Err(MessageError::TooShort {
                    expected: HEADER_SIZE,
                    actual: remaining,
                })
            }
        }
    }
}

impl Encoder<RemoteMessage> for RemoteMessageCodec {
    type Error = MessageError;

    fn encode(&mut self, item: RemoteMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = item.header();
        if !item.is_valid() {
            return Err(MessageError::InvalidSize);
        }
        if header.buffer_size as usize > self.max_frame {
            return Err(MessageError::TooLarge {
                max: self.max_frame,
                actual: header.buffer_size as usize,
            });
        }

        item.encode_into(dst).map_err(|_| MessageError::InvalidSize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cookie;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    fn message(id: u32, payload: &'static [u8]) -> RemoteMessage {
        let mut message = RemoteMessage::request(id, Cookie::ROUTER, payload);
        message.set_source_cookie(Cookie::new(7));
        message
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let bytes = message(42, b"partial payload").to_bytes().unwrap();
        let mut codec = RemoteMessageCodec::new(1024);
        let mut buf = BytesMut::from(&bytes[..10]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[10..]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.message_id(), 42);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_sentinel_length_is_framing_error() {
        let mut codec = RemoteMessageCodec::new(1024);
        let mut buf = BytesMut::from(&INVALID_SIZE.to_be_bytes()[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MessageError::InvalidSize)
        ));
    }

    #[test]
    fn test_oversized_frame_is_framing_error() {
        let bytes = message(1, &[0u8; 200]).to_bytes().unwrap();
        let mut codec = RemoteMessageCodec::new(128);
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MessageError::TooLarge { max: 128, .. })
        ));
    }

    #[test]
    fn test_corrupted_frame_decodes_as_invalid() {
        let mut bytes = message(5, b"abc").to_bytes().unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let mut codec = RemoteMessageCodec::new(1024);
        let mut buf = BytesMut::from(&bytes[..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(!decoded.is_valid());
    }

    #[tokio::test]
    async fn test_framed_stream_roundtrip() {
        let (client, server) = tokio::io::duplex(256);
        let mut writer = FramedWrite::new(client, RemoteMessageCodec::new(4096));
        let mut reader = FramedRead::new(server, RemoteMessageCodec::new(4096));

        writer.send(message(1, b"first")).await.unwrap();
        writer.send(message(2, b"second")).await.unwrap();
        drop(writer);

        let first = reader.next().await.unwrap().unwrap();
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(first.message_id(), 1);
        assert_eq!(second.payload(), &Bytes::from_static(b"second"));
        assert!(reader.next().await.is_none());
    }
}
