//! Wire protocol definitions
//!
//! Message kinds, their numeric tags, and the payload schemas exchanged by
//! the streaming session. Every structured payload is
//! `[u16 LE schema version][bincode body]`; bincode writes the serde fields in
//! declaration order with explicit length prefixes for byte fields.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::media::{CodecParameters, CompressedPacket, MediaKind, Rational};

/// Current payload schema version
pub const SCHEMA_VERSION: u16 = 1;

/// Reserved tag: peer identification (datagram transports only)
pub const TAG_IDENTIFICATION: u32 = 0x0000_0000;
/// Reserved tag: the next `part_count` frames form one message
pub const TAG_SPLIT_PACKET: u32 = 0x0FFF_FFFF;
/// Reserved tag: the next `count` messages form one atomic batch
pub const TAG_MULTIPLE_PACKETS: u32 = 0x0FFF_FFFE;

/// Identifier of the peer a message came from, assigned per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Metadata,
    CodecParams,
    CompressedPacket,
    Play,
    Pause,
    Seek,
    SeekAck,
    BufferingStart,
    BufferingEnd,
    Position,
    ByteAck,
    Custom(u32),
}

impl MessageKind {
    pub fn tag(self) -> u32 {
        match self {
            MessageKind::Metadata => 1,
            MessageKind::CodecParams => 2,
            MessageKind::CompressedPacket => 3,
            MessageKind::Play => 4,
            MessageKind::Pause => 5,
            MessageKind::Seek => 6,
            MessageKind::SeekAck => 7,
            MessageKind::BufferingStart => 8,
            MessageKind::BufferingEnd => 9,
            MessageKind::Position => 10,
            MessageKind::ByteAck => 11,
            MessageKind::Custom(tag) => tag,
        }
    }

    pub fn from_tag(tag: u32) -> Self {
        match tag {
            1 => MessageKind::Metadata,
            2 => MessageKind::CodecParams,
            3 => MessageKind::CompressedPacket,
            4 => MessageKind::Play,
            5 => MessageKind::Pause,
            6 => MessageKind::Seek,
            7 => MessageKind::SeekAck,
            8 => MessageKind::BufferingStart,
            9 => MessageKind::BufferingEnd,
            10 => MessageKind::Position,
            11 => MessageKind::ByteAck,
            other => MessageKind::Custom(other),
        }
    }

    /// Media data, subject to flow control and seek purges
    pub fn is_media(self) -> bool {
        matches!(self, MessageKind::CompressedPacket)
    }

    /// Whether this kind may go on the wire. A custom tag must not alias a
    /// named kind, the identification tag or a framing marker.
    pub fn is_sendable(self) -> bool {
        match self {
            MessageKind::Custom(tag) => {
                tag > 11 && tag != TAG_SPLIT_PACKET && tag != TAG_MULTIPLE_PACKETS
            }
            _ => true,
        }
    }
}

/// One logical message in transit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub kind: MessageKind,
    pub payload: Bytes,
    pub peer: PeerId,
}

impl WireMessage {
    pub fn new(kind: MessageKind, payload: Bytes, peer: PeerId) -> Self {
        Self { kind, payload, peer }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Stream-level metadata sent once by the producer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub duration_us: i64,
    pub frame_rate: Rational,
    pub video_time_base: Rational,
    pub audio_time_base: Rational,
}

/// Codec parameters for one stream; `params` is `None` if the producer has no such stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecParamsMessage {
    pub kind: MediaKind,
    pub stream_index: u32,
    pub params: Option<CodecParameters>,
}

/// A payload with a versioned binary schema
pub trait Payload: Sized {
    fn encode(&self) -> Result<Bytes, ProtocolError>;
    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>;
}

fn encode_versioned<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let body = bincode::serialize(value)?;
    let mut buf = BytesMut::with_capacity(2 + body.len());
    buf.put_u16_le(SCHEMA_VERSION);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

fn decode_versioned<T: DeserializeOwned>(mut bytes: &[u8]) -> Result<T, ProtocolError> {
    if bytes.len() < 2 {
        return Err(ProtocolError::Truncated { expected: 2, actual: bytes.len() });
    }
    let version = bytes.get_u16_le();
    if version != SCHEMA_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(bincode::deserialize(bytes)?)
}

macro_rules! versioned_payload {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Payload for $ty {
                fn encode(&self) -> Result<Bytes, ProtocolError> {
                    encode_versioned(self)
                }

                fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
                    decode_versioned(bytes)
                }
            }
        )*
    };
}

versioned_payload!(StreamMetadata, CodecParamsMessage, CodecParameters, CompressedPacket);

/// Encode a bare timestamp (SEEK, SEEK_ACK, POSITION)
pub fn encode_timestamp(ts_us: i64) -> Bytes {
    Bytes::copy_from_slice(&ts_us.to_le_bytes())
}

pub fn decode_timestamp(mut bytes: &[u8]) -> Result<i64, ProtocolError> {
    if bytes.len() < 8 {
        return Err(ProtocolError::Truncated { expected: 8, actual: bytes.len() });
    }
    Ok(bytes.get_i64_le())
}

/// Encode a BYTE_ACK payload
pub fn encode_byte_ack(bytes: u64) -> Bytes {
    Bytes::copy_from_slice(&bytes.to_le_bytes())
}

pub fn decode_byte_ack(mut bytes: &[u8]) -> Result<u64, ProtocolError> {
    if bytes.len() < 8 {
        return Err(ProtocolError::Truncated { expected: 8, actual: bytes.len() });
    }
    Ok(bytes.get_u64_le())
}
