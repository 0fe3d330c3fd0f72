// Wire format for changefeed traffic: a fixed frame header wrapping either a binary
// stamped change message or a JSON control message.
use bytes::{Buf, Bytes, BytesMut};

pub mod control;
mod message;

pub use control::ControlMessage;
pub use message::{ChangeEvent, ChangeKind, FeedMessage, Row, StampedMessage};

pub const MAGIC: u32 = 0x5250_4C31;
pub const VERSION: u16 = 1;
// Flags describe how to interpret the frame payload. Zero means JSON control.
pub const FLAG_STAMPED_MESSAGE: u16 = 0x0001;

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("unexpected frame flags {0:#06x}")]
    UnexpectedFlags(u16),
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("invalid presence marker {0}")]
    InvalidPresence(u8),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("change event has neither an old nor a new value")]
    EmptyChange,
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Network byte order throughout.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(WireError::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(WireError::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Frame containing a header and payload.
///
/// ```
/// use bytes::Bytes;
/// use ripple_wire::Frame;
///
/// let frame = Frame::new(0x1, Bytes::from_static(b"hello")).expect("frame");
/// let decoded = Frame::decode(frame.encode()).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        // Keep length within the on-wire u32 size.
        if payload.len() > u32::MAX as usize {
            return Err(WireError::FrameTooLarge);
        }
        Ok(Self {
            header: FrameHeader::new(flags, payload.len() as u32),
            payload,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + self.payload.len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes exactly one frame; bytes past the declared length are an error.
    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(WireError::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        let end = FrameHeader::LEN + length;
        if input.len() < end {
            return Err(WireError::Incomplete);
        }
        if input.len() > end {
            return Err(WireError::TrailingBytes(input.len() - end));
        }
        let payload = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        Ok(Self { header, payload })
    }

    pub fn is_stamped(&self) -> bool {
        self.header.flags & FLAG_STAMPED_MESSAGE != 0
    }
}

pub mod binary {
    //! Binary layout of a stamped message payload:
    //!
    //! ```text
    //! source_id: [u8; 16]
    //! stamp:     u64
    //! tag:       u8         0 = stop, 1 = change
    //! change:    old: value, new: value
    //! value:     u8 presence (0 | 1), then u32 length + JSON bytes when present
    //! ```
    use super::*;
    use bytes::BufMut;
    use ripple_common::ids::PublisherId;

    const TAG_STOP: u8 = 0;
    const TAG_CHANGE: u8 = 1;
    const ABSENT: u8 = 0;
    const PRESENT: u8 = 1;

    // Offset of the stamp inside a full encoded frame.
    const STAMP_AT: usize = FrameHeader::LEN + 16;

    // Encode a stamped message into a full framed payload, header included.
    pub fn encode_stamped_bytes(message: &StampedMessage) -> Result<Bytes> {
        encode_stamped(message.source_id, message.stamp, &message.payload)
    }

    pub fn encode_stamped(
        source_id: PublisherId,
        stamp: u64,
        payload: &FeedMessage,
    ) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(64);
        body.extend_from_slice(&source_id.to_bytes());
        body.put_u64(stamp);
        match payload {
            FeedMessage::Stop => body.put_u8(TAG_STOP),
            FeedMessage::Change(change) => {
                body.put_u8(TAG_CHANGE);
                put_value(&mut body, change.old_value())?;
                put_value(&mut body, change.new_value())?;
            }
        }
        let len = u32::try_from(body.len()).map_err(|_| WireError::FrameTooLarge)?;
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + body.len());
        FrameHeader::new(FLAG_STAMPED_MESSAGE, len).encode(&mut buf);
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    // Copy of an encoded stamped frame carrying a different stamp. Lets a publisher
    // serialize a broadcast once and only patch the stamp per destination.
    pub fn restamp(encoded: &Bytes, stamp: u64) -> Result<Bytes> {
        if encoded.len() < STAMP_AT + 8 {
            return Err(WireError::Incomplete);
        }
        let mut buf = BytesMut::from(encoded.as_ref());
        buf[STAMP_AT..STAMP_AT + 8].copy_from_slice(&stamp.to_be_bytes());
        Ok(buf.freeze())
    }

    // Decode a stamped message from an already-split frame.
    pub fn decode_stamped(frame: &Frame) -> Result<StampedMessage> {
        if !frame.is_stamped() {
            return Err(WireError::UnexpectedFlags(frame.header.flags));
        }
        let mut buf = frame.payload.clone();
        if buf.remaining() < 16 + 8 + 1 {
            return Err(WireError::Incomplete);
        }
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let source_id = PublisherId::from_bytes(id);
        let stamp = buf.get_u64();
        let payload = match buf.get_u8() {
            TAG_STOP => FeedMessage::Stop,
            TAG_CHANGE => {
                let old_value = get_value(&mut buf)?;
                let new_value = get_value(&mut buf)?;
                FeedMessage::Change(ChangeEvent::new(old_value, new_value)?)
            }
            other => return Err(WireError::UnknownTag(other)),
        };
        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }
        Ok(StampedMessage {
            source_id,
            stamp,
            payload,
        })
    }

    // Split and decode in one step; used by inbox readers.
    pub fn decode_stamped_bytes(input: Bytes) -> Result<StampedMessage> {
        let frame = Frame::decode(input)?;
        decode_stamped(&frame)
    }

    fn put_value(buf: &mut BytesMut, value: Option<&Row>) -> Result<()> {
        match value {
            None => buf.put_u8(ABSENT),
            Some(row) => {
                let encoded = serde_json::to_vec(row).map_err(WireError::Serialize)?;
                let len = u32::try_from(encoded.len()).map_err(|_| WireError::FrameTooLarge)?;
                buf.put_u8(PRESENT);
                buf.put_u32(len);
                buf.extend_from_slice(&encoded);
            }
        }
        Ok(())
    }

    fn get_value(buf: &mut Bytes) -> Result<Option<Row>> {
        if !buf.has_remaining() {
            return Err(WireError::Incomplete);
        }
        match buf.get_u8() {
            ABSENT => Ok(None),
            PRESENT => {
                if buf.remaining() < 4 {
                    return Err(WireError::Incomplete);
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(WireError::Incomplete);
                }
                let bytes = buf.copy_to_bytes(len);
                serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(WireError::Deserialize)
            }
            other => Err(WireError::InvalidPresence(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use ripple_common::ids::PublisherId;
    use serde_json::json;

    fn stamped(payload: FeedMessage) -> StampedMessage {
        StampedMessage {
            source_id: PublisherId::new(),
            stamp: 42,
            payload,
        }
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
        buf.extend_from_slice(&VERSION.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("invalid magic");
        assert!(matches!(err, WireError::InvalidMagic));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.extend_from_slice(&0xFFFFu16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        let err = FrameHeader::decode(buf.freeze()).expect_err("unsupported version");
        assert!(matches!(err, WireError::UnsupportedVersion(0xFFFF)));
    }

    #[test]
    fn decode_rejects_incomplete_payload() {
        let header = FrameHeader::new(FLAG_STAMPED_MESSAGE, 5);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf.extend_from_slice(b"hi");
        let err = Frame::decode(buf.freeze()).expect_err("incomplete payload");
        assert!(matches!(err, WireError::Incomplete));
    }

    #[test]
    fn stamped_change_survives_encoding() {
        let change = ChangeEvent::new(
            Some(json!({"id": 1, "v": "a"})),
            Some(json!({"id": 1, "v": "b"})),
        )
        .expect("change");
        let message = stamped(FeedMessage::Change(change));
        let encoded = binary::encode_stamped_bytes(&message).expect("encode");
        let decoded = binary::decode_stamped_bytes(encoded).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn stop_payload_is_tag_only() {
        let message = stamped(FeedMessage::Stop);
        let encoded = binary::encode_stamped_bytes(&message).expect("encode");
        // header + source id + stamp + tag
        assert_eq!(encoded.len(), FrameHeader::LEN + 16 + 8 + 1);
        let frame = Frame::decode(encoded).expect("frame");
        assert!(frame.is_stamped());
        assert_eq!(binary::decode_stamped(&frame).expect("decode"), message);
    }

    #[test]
    fn restamp_only_changes_the_stamp() {
        let message = stamped(FeedMessage::Change(ChangeEvent::delete(json!({"id": 4}))));
        let encoded = binary::encode_stamped_bytes(&message).expect("encode");
        let patched = binary::restamp(&encoded, 7).expect("restamp");
        let decoded = binary::decode_stamped_bytes(patched).expect("decode");
        assert_eq!(decoded.stamp, 7);
        assert_eq!(decoded.source_id, message.source_id);
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn unknown_tag_is_a_protocol_violation() {
        let mut body = BytesMut::new();
        body.extend_from_slice(&PublisherId::new().to_bytes());
        body.put_u64(0);
        body.put_u8(9);
        let frame = Frame::new(FLAG_STAMPED_MESSAGE, body.freeze()).expect("frame");
        let err = binary::decode_stamped(&frame).expect_err("unknown tag");
        assert!(matches!(err, WireError::UnknownTag(9)));
    }

    #[test]
    fn change_with_both_values_absent_is_rejected_on_decode() {
        let mut body = BytesMut::new();
        body.extend_from_slice(&PublisherId::new().to_bytes());
        body.put_u64(3);
        body.put_u8(1);
        body.put_u8(0);
        body.put_u8(0);
        let frame = Frame::new(FLAG_STAMPED_MESSAGE, body.freeze()).expect("frame");
        let err = binary::decode_stamped(&frame).expect_err("empty change");
        assert!(matches!(err, WireError::EmptyChange));
    }

    #[test]
    fn invalid_presence_marker_is_rejected() {
        let mut body = BytesMut::new();
        body.extend_from_slice(&PublisherId::new().to_bytes());
        body.put_u64(3);
        body.put_u8(1);
        body.put_u8(7);
        let frame = Frame::new(FLAG_STAMPED_MESSAGE, body.freeze()).expect("frame");
        let err = binary::decode_stamped(&frame).expect_err("presence");
        assert!(matches!(err, WireError::InvalidPresence(7)));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let message = stamped(FeedMessage::Stop);
        let encoded = binary::encode_stamped_bytes(&message).expect("encode");
        let frame = Frame::decode(encoded).expect("frame");
        let mut padded = BytesMut::from(frame.payload.as_ref());
        padded.put_u8(0);
        let frame = Frame::new(FLAG_STAMPED_MESSAGE, padded.freeze()).expect("frame");
        let err = binary::decode_stamped(&frame).expect_err("trailing");
        assert!(matches!(err, WireError::TrailingBytes(1)));
    }

    #[test]
    fn bytes_after_the_declared_frame_are_rejected() {
        let message = stamped(FeedMessage::Stop);
        let encoded = binary::encode_stamped_bytes(&message).expect("encode");
        let mut padded = BytesMut::from(encoded.as_ref());
        padded.extend_from_slice(b"junk");
        let err = binary::decode_stamped_bytes(padded.freeze()).expect_err("trailing");
        assert!(matches!(err, WireError::TrailingBytes(4)));
    }

    #[test]
    fn control_frames_are_not_stamped() {
        let frame = Frame::new(0, Bytes::from_static(b"{}")).expect("frame");
        let err = binary::decode_stamped(&frame).expect_err("flags");
        assert!(matches!(err, WireError::UnexpectedFlags(0)));
    }
}
