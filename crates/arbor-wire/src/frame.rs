//! Length-prefixed frames carrying one protocol message
//!
//! Frame layout:
//! - Byte 0: Wire version
//! - Byte 1: Message kind
//! - Bytes 2-5: Body length (LE)
//! - Body: JSON encoding of the sender and message

use arbor_core::{ArborError, ArborResult, PeerId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Message, MessageKind};

/// Current wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 6;

/// Largest accepted body
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One message and the peer that sent it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub sender: PeerId,
    pub message: Message,
}

impl Frame {
    pub fn new(sender: PeerId, message: Message) -> Self {
        Frame { sender, message }
    }

    /// Serialize to bytes
    pub fn encode(&self) -> ArborResult<Bytes> {
        let body = serde_json::to_vec(self)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(ArborError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.message.kind().to_byte());
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Parse exactly one frame from `buf`
    pub fn decode(buf: &[u8]) -> ArborResult<Self> {
        let header = FrameHeader::parse(buf)?;
        let total = FRAME_HEADER_SIZE + header.body_len;
        if buf.len() < total {
            return Err(ArborError::BufferTooShort {
                expected: total,
                actual: buf.len(),
            });
        }
        if buf.len() > total {
            return Err(ArborError::InvalidWireFormat(format!(
                "{} trailing bytes after frame",
                buf.len() - total
            )));
        }
        header.decode_body(&buf[FRAME_HEADER_SIZE..total])
    }
}

/// Parsed frame header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FrameHeader {
    kind: MessageKind,
    body_len: usize,
}

impl FrameHeader {
    fn parse(buf: &[u8]) -> ArborResult<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ArborError::BufferTooShort {
                expected: FRAME_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut cursor = buf;
        let version = cursor.get_u8();
        if version != WIRE_VERSION {
            return Err(ArborError::InvalidWireFormat(format!(
                "Unsupported wire version {}",
                version
            )));
        }
        let kind_byte = cursor.get_u8();
        let kind =
            MessageKind::from_byte(kind_byte).ok_or(ArborError::UnknownMessageKind(kind_byte))?;
        let body_len = cursor.get_u32_le() as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(ArborError::FrameTooLarge {
                size: body_len,
                max: MAX_FRAME_SIZE,
            });
        }

        Ok(FrameHeader { kind, body_len })
    }

    fn decode_body(&self, body: &[u8]) -> ArborResult<Frame> {
        let frame: Frame = serde_json::from_slice(body)?;
        if frame.message.kind() != self.kind {
            return Err(ArborError::InvalidWireFormat(format!(
                "Header kind {:?} does not match body {:?}",
                self.kind,
                frame.message.kind()
            )));
        }
        Ok(frame)
    }
}

/// Streaming decoder for a byte stream of concatenated frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> ArborResult<Option<Frame>> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let header = FrameHeader::parse(&self.buf)?;
        let total = FRAME_HEADER_SIZE + header.body_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame_bytes = self.buf.split_to(total);
        header.decode_body(&frame_bytes[FRAME_HEADER_SIZE..]).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Hello, ObjectCatchup, VersionAck, VersionPush};
    use arbor_core::{KeyPath, Patch, VersionInfo};
    use arbor_state::{AckTable, SyncObject};
    use proptest::prelude::*;
    use serde_json::json;

    fn push() -> Frame {
        let patch = Patch::set(KeyPath::parse("a.b").unwrap(), json!(1));
        Frame::new(
            "alice".into(),
            Message::Version(VersionPush {
                object_id: "doc".into(),
                version: VersionInfo::new("v2".into(), vec!["v1".into()], vec![patch]),
            }),
        )
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = push();
        let bytes = frame.encode().unwrap();

        assert_eq!(bytes[0], WIRE_VERSION);
        assert_eq!(bytes[1], MessageKind::Version.to_byte());
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_hello_with_snapshot_roundtrip() {
        let mut obj = SyncObject::new(json!({ "x": 1 }));
        obj.insert(VersionInfo::new("v1".into(), vec![], vec![])).unwrap();
        obj.ack(&"alice".into(), &"v1".into());

        let mut hello = Hello::default();
        hello.missing_objects.insert("doc".into(), obj);
        hello.catchup.insert(
            "other".into(),
            ObjectCatchup {
                versions: vec![],
                peer_acks: AckTable::new(),
            },
        );
        hello.known_peers = vec!["alice".into(), "bob".into()];

        let frame = Frame::new("alice".into(), Message::HelloBack(hello));
        let bytes = frame.encode().unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        let bytes = push().encode().unwrap();
        let err = Frame::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, ArborError::BufferTooShort { .. }));

        let err = Frame::decode(&bytes[..3]).unwrap_err();
        assert_eq!(
            err,
            ArborError::BufferTooShort {
                expected: FRAME_HEADER_SIZE,
                actual: 3
            }
        );
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut bytes = push().encode().unwrap().to_vec();
        bytes[1] = 0x7F;
        assert_eq!(
            Frame::decode(&bytes).unwrap_err(),
            ArborError::UnknownMessageKind(0x7F)
        );
    }

    #[test]
    fn test_decode_rejects_kind_mismatch() {
        let mut bytes = push().encode().unwrap().to_vec();
        bytes[1] = MessageKind::Ack.to_byte();
        assert!(matches!(
            Frame::decode(&bytes).unwrap_err(),
            ArborError::InvalidWireFormat(_)
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut bytes = push().encode().unwrap().to_vec();
        bytes[2..6].copy_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_le_bytes());
        assert!(matches!(
            Frame::decode(&bytes).unwrap_err(),
            ArborError::FrameTooLarge { .. }
        ));
    }

    #[test]
    fn test_stream_decoder_splits_frames() {
        let first = push();
        let second = Frame::new(
            "bob".into(),
            Message::Ack(VersionAck::new("doc".into(), "v2".into())),
        );

        let mut stream = first.encode().unwrap().to_vec();
        stream.extend_from_slice(&second.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        // Feed in two uneven chunks
        let (a, b) = stream.split_at(4);
        decoder.extend(a);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(b);

        assert_eq!(decoder.next_frame().unwrap(), Some(first));
        assert_eq!(decoder.next_frame().unwrap(), Some(second));
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Frame::decode(&data);
            let mut decoder = FrameDecoder::new();
            decoder.extend(&data);
            let _ = decoder.next_frame();
        }
    }
}
