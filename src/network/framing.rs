//! Physical framing: `[i32 len][i32 tag][payload]`, little-endian
//!
//! `len` counts the tag and the payload. A message whose frame would exceed
//! the maximum packet size is sent as a SPLIT header carrying the part count,
//! followed by that many frames tagged with the real kind. A MULTIPLE header
//! announces a batch of messages (each possibly split) that the receiver
//! delivers together.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read};

use crate::constants::FRAME_HEADER_LEN;
use crate::error::NetworkError;
use crate::protocol::{TAG_MULTIPLE_PACKETS, TAG_SPLIT_PACKET};

/// Size of the `len` prefix
const LEN_PREFIX: usize = 4;
/// Size of the type tag
const TAG_LEN: usize = 4;

/// One physical frame read from the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub tag: u32,
    pub payload: Bytes,
}

/// Append one physical frame to `out`
pub fn encode_frame(tag: u32, payload: &[u8], out: &mut BytesMut) {
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.put_i32_le((payload.len() + TAG_LEN) as i32);
    out.put_i32_le(tag as i32);
    out.put_slice(payload);
}

/// Payload bytes carried by each part of a split message
pub fn split_chunk_len(max_packet_size: usize) -> usize {
    max_packet_size.saturating_sub(FRAME_HEADER_LEN).max(1)
}

/// Append the frames of one logical message, splitting it when needed.
/// Returns the number of frames written.
pub fn encode_message(tag: u32, payload: &[u8], max_packet_size: usize, out: &mut BytesMut) -> usize {
    if payload.len() + FRAME_HEADER_LEN <= max_packet_size {
        encode_frame(tag, payload, out);
        return 1;
    }

    let chunk = split_chunk_len(max_packet_size);
    let parts = payload.len().div_ceil(chunk);
    encode_frame(TAG_SPLIT_PACKET, &(parts as i32).to_le_bytes(), out);
    for part in payload.chunks(chunk) {
        encode_frame(tag, part, out);
    }
    parts + 1
}

/// Append a MULTIPLE header followed by every message. Returns the number of frames written.
pub fn encode_batch<'a, I>(messages: I, max_packet_size: usize, out: &mut BytesMut) -> usize
where
    I: IntoIterator<Item = (u32, &'a [u8])>,
    I::IntoIter: ExactSizeIterator,
{
    let messages = messages.into_iter();
    encode_frame(TAG_MULTIPLE_PACKETS, &(messages.len() as i32).to_le_bytes(), out);
    1 + messages.map(|(tag, payload)| encode_message(tag, payload, max_packet_size, out)).sum::<usize>()
}

/// Read one frame. `Ok(None)` means the peer closed the stream at a frame boundary.
pub fn read_frame<R: Read>(reader: &mut R, max_frame_size: usize) -> Result<Option<RawFrame>, NetworkError> {
    let mut prefix = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(NetworkError::Framing("connection closed inside a length prefix".into())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }

    let len = i32::from_le_bytes(prefix);
    if len < TAG_LEN as i32 {
        return Err(NetworkError::InvalidFrameLength(len));
    }
    let len = len as usize;
    if len > max_frame_size {
        return Err(NetworkError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => NetworkError::Framing("connection closed inside a frame".into()),
        _ => NetworkError::ReceiveFailed(e.to_string()),
    })?;

    let mut body = Bytes::from(body);
    let tag = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let payload = body.split_off(TAG_LEN);
    Ok(Some(RawFrame { tag, payload }))
}

/// A logical unit delivered by the [`Reassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    Message { tag: u32, payload: Bytes },
    Batch(Vec<(u32, Bytes)>),
}

#[derive(Debug)]
struct SplitState {
    remaining: usize,
    tag: Option<u32>,
    buffer: BytesMut,
}

#[derive(Debug)]
struct BatchState {
    remaining: usize,
    messages: Vec<(u32, Bytes)>,
}

/// Rebuilds logical messages from physical frames
#[derive(Debug, Default)]
pub struct Reassembler {
    split: Option<SplitState>,
    batch: Option<BatchState>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one frame; returns a message or batch once complete
    pub fn push(&mut self, frame: RawFrame) -> Result<Option<Assembled>, NetworkError> {
        match frame.tag {
            TAG_SPLIT_PACKET => {
                if self.split.is_some() {
                    return Err(NetworkError::Framing("split header inside a split message".into()));
                }
                let parts = read_count(&frame.payload, "split")?;
                if parts == 0 {
                    return Err(NetworkError::Framing("split message with zero parts".into()));
                }
                self.split = Some(SplitState { remaining: parts, tag: None, buffer: BytesMut::new() });
                Ok(None)
            }
            TAG_MULTIPLE_PACKETS => {
                if self.batch.is_some() || self.split.is_some() {
                    return Err(NetworkError::Framing("nested batch header".into()));
                }
                let count = read_count(&frame.payload, "batch")?;
                if count == 0 {
                    return Ok(Some(Assembled::Batch(Vec::new())));
                }
                self.batch = Some(BatchState { remaining: count, messages: Vec::with_capacity(count) });
                Ok(None)
            }
            tag => {
                let Some(message) = self.collect_part(tag, frame.payload)? else {
                    return Ok(None);
                };
                Ok(self.complete(message))
            }
        }
    }

    /// No partial message or batch is pending
    pub fn is_idle(&self) -> bool {
        self.split.is_none() && self.batch.is_none()
    }

    fn collect_part(&mut self, tag: u32, payload: Bytes) -> Result<Option<(u32, Bytes)>, NetworkError> {
        let Some(split) = self.split.as_mut() else {
            return Ok(Some((tag, payload)));
        };
        match split.tag {
            Some(expected) if expected != tag => {
                return Err(NetworkError::Framing(format!(
                    "split part tagged {:#x} inside a message tagged {:#x}",
                    tag, expected
                )));
            }
            _ => split.tag = Some(tag),
        }
        split.buffer.extend_from_slice(&payload);
        split.remaining -= 1;
        if split.remaining > 0 {
            return Ok(None);
        }
        let buffer = std::mem::take(&mut split.buffer);
        self.split = None;
        Ok(Some((tag, buffer.freeze())))
    }

    fn complete(&mut self, (tag, payload): (u32, Bytes)) -> Option<Assembled> {
        let Some(batch) = self.batch.as_mut() else {
            return Some(Assembled::Message { tag, payload });
        };
        batch.messages.push((tag, payload));
        batch.remaining -= 1;
        if batch.remaining > 0 {
            return None;
        }
        self.batch.take().map(|b| Assembled::Batch(b.messages))
    }
}

fn read_count(payload: &[u8], what: &str) -> Result<usize, NetworkError> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| NetworkError::Framing(format!("{} header too short", what)))?;
    let count = i32::from_le_bytes(bytes);
    usize::try_from(count).map_err(|_| NetworkError::Framing(format!("negative {} count {}", what, count)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    const MAX: usize = 1024;

    fn frames(bytes: &[u8]) -> Vec<RawFrame> {
        let mut cursor = Cursor::new(bytes);
        let mut out = Vec::new();
        while let Some(frame) = read_frame(&mut cursor, 1 << 20).unwrap() {
            out.push(frame);
        }
        out
    }

    fn reassemble(bytes: &[u8]) -> Vec<Assembled> {
        let mut reassembler = Reassembler::new();
        let out = frames(bytes).into_iter().filter_map(|f| reassembler.push(f).unwrap()).collect();
        assert!(reassembler.is_idle());
        out
    }

    #[test]
    fn test_frame_layout() {
        let mut out = BytesMut::new();
        encode_frame(3, b"abc", &mut out);
        assert_eq!(&out[..], &[7, 0, 0, 0, 3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_small_message_is_one_frame() {
        let mut out = BytesMut::new();
        assert_eq!(encode_message(2, &[0u8; MAX - 8], MAX, &mut out), 1);
        assert_eq!(out.len(), MAX);
    }

    #[test]
    fn test_large_message_is_split() {
        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let mut out = BytesMut::new();
        // 3000 / 1016 rounds up to 3 parts, plus the header
        assert_eq!(encode_message(3, &payload, MAX, &mut out), 4);

        let raw = frames(&out);
        assert_eq!(raw[0].tag, TAG_SPLIT_PACKET);
        assert_eq!(&raw[0].payload[..], &3i32.to_le_bytes());
        assert!(raw[1..].iter().all(|f| f.tag == 3 && f.payload.len() + 8 <= MAX));

        let messages = reassemble(&out);
        assert_eq!(messages, vec![Assembled::Message { tag: 3, payload: Bytes::from(payload) }]);
    }

    #[test]
    fn test_batch_with_split_member() {
        let big = vec![7u8; 2500];
        let mut out = BytesMut::new();
        let batch: Vec<(u32, &[u8])> = vec![(2, &b"video"[..]), (3, &big[..]), (1, &[][..])];
        encode_batch(batch, MAX, &mut out);

        let messages = reassemble(&out);
        assert_eq!(
            messages,
            vec![Assembled::Batch(vec![
                (2, Bytes::from_static(b"video")),
                (3, Bytes::from(big)),
                (1, Bytes::new()),
            ])]
        );
    }

    #[test]
    fn test_framing_violations() {
        let mut reassembler = Reassembler::new();
        let split = |n: i32| RawFrame { tag: TAG_SPLIT_PACKET, payload: Bytes::copy_from_slice(&n.to_le_bytes()) };
        reassembler.push(split(2)).unwrap();
        assert!(reassembler.push(split(2)).is_err());

        let mut reassembler = Reassembler::new();
        reassembler.push(split(2)).unwrap();
        reassembler.push(RawFrame { tag: 3, payload: Bytes::from_static(b"a") }).unwrap();
        assert!(reassembler.push(RawFrame { tag: 4, payload: Bytes::from_static(b"b") }).is_err());

        assert!(Reassembler::new().push(split(-1)).is_err());
        assert!(Reassembler::new().push(split(0)).is_err());
    }

    #[test]
    fn test_read_frame_rejects_bad_lengths() {
        let mut short = Cursor::new(2i32.to_le_bytes().to_vec());
        assert!(matches!(read_frame(&mut short, MAX), Err(NetworkError::InvalidFrameLength(2))));

        let mut huge = Cursor::new(4096i32.to_le_bytes().to_vec());
        assert!(matches!(read_frame(&mut huge, MAX), Err(NetworkError::FrameTooLarge(4096))));

        let mut truncated = Cursor::new(vec![9, 0, 0, 0, 1, 0]);
        assert!(matches!(read_frame(&mut truncated, MAX), Err(NetworkError::Framing(_))));

        let mut empty = Cursor::new(Vec::new());
        assert!(read_frame(&mut empty, MAX).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_split_then_combine_is_identity(
            payload in proptest::collection::vec(any::<u8>(), 0..5 * MAX),
            max in 9usize..2048,
        ) {
            let mut out = BytesMut::new();
            encode_message(3, &payload, max, &mut out);
            for frame in frames(&out) {
                prop_assert!(frame.payload.len() + FRAME_HEADER_LEN <= max.max(FRAME_HEADER_LEN + 4));
            }
            let messages = reassemble(&out);
            prop_assert_eq!(messages, vec![Assembled::Message { tag: 3, payload: Bytes::from(payload) }]);
        }
    }
}
