//! Length-prefixed framing
//!
//! Each frame is a 4-byte big-endian payload length followed by a JSON
//! envelope.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;
use super::peer::NetworkError;

/// Largest accepted frame payload
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Message codec for length-prefixed framing
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl MessageCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item.to_bytes()?;
        if data.len() > self.max_frame_size {
            return Err(NetworkError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(LENGTH_PREFIX + data.len());
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(NetworkError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let data = src.split_to(len);
        Ok(Some(Message::from_bytes(&data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{GetBlocksPayload, MessageError};

    fn getblocks(start_height: u64) -> Message {
        Message::GetBlocks(GetBlocksPayload { start_height })
    }

    #[test]
    fn test_message_codec() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(getblocks(3), &mut buf).unwrap();
        codec.encode(Message::GetChain, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(getblocks(3)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::GetChain));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Message::GetChain, &mut buf).unwrap();

        let body_len = buf.len() - LENGTH_PREFIX;
        assert_eq!(&buf[..4], &(body_len as u32).to_be_bytes());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = MessageCodec::default();
        let mut full = BytesMut::new();
        codec.encode(getblocks(1), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(getblocks(1)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = MessageCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::FrameTooLarge { size: 1024, max: 16 })
        ));
        assert!(codec.encode(getblocks(1), &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        let body = br#"{"type":"bogus","payload":{},"timestamp":"2024-01-01T00:00:00Z"}"#;
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);

        let mut codec = MessageCodec::default();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetworkError::Message(MessageError::UnknownType(_)))
        ));
    }
}
