//! Media data model shared by the catalog, pipeline and transport
//!
//! Timestamps on packets stay in the stream's own time base; decoded frames
//! always carry microseconds.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Microseconds per second
pub const US_PER_SEC: i64 = 1_000_000;

/// Rational number, used for time bases and frame rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    /// The microsecond time base
    pub const MICROS: Rational = Rational { num: 1, den: 1_000_000 };

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Convert a timestamp in this time base to microseconds
    pub fn to_micros(&self, ts: i64) -> i64 {
        rescale(ts, self.num as i64 * US_PER_SEC, self.den as i64)
    }

    /// Convert microseconds to a timestamp in this time base
    pub fn from_micros(&self, us: i64) -> i64 {
        rescale(us, self.den as i64, self.num as i64 * US_PER_SEC)
    }
}

/// `value * mul / div` rounded towards negative infinity, without intermediate overflow
fn rescale(value: i64, mul: i64, div: i64) -> i64 {
    if div == 0 {
        return 0;
    }
    let wide = value as i128 * mul as i128;
    wide.div_euclid(div as i128) as i64
}

/// Kind of elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => f.write_str("video"),
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Subtitle => f.write_str("subtitle"),
        }
    }
}

/// Codec parameters needed to construct a decoder on either peer
///
/// This is an explicit field list rather than a copy of the codec library's
/// native struct, so both peers agree on the layout regardless of build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecParameters {
    /// Codec name as understood by the backend (e.g. "h264", "testsrc-video")
    pub codec: String,
    pub kind: MediaKind,
    pub codec_tag: u32,
    /// Backend-specific pixel / sample format identifier
    pub format: i32,
    pub bit_rate: i64,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per channel in one audio packet, 0 when unknown
    pub frame_size: u32,
    pub extradata: Bytes,
}

impl CodecParameters {
    pub fn new(codec: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            codec: codec.into(),
            kind,
            codec_tag: 0,
            format: -1,
            bit_rate: 0,
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            frame_size: 0,
            extradata: Bytes::new(),
        }
    }
}

/// Video-specific descriptor fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
}

/// Audio-specific descriptor fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub channels: u16,
    pub sample_rate: u32,
}

/// Metadata for one elementary stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub index: u32,
    pub kind: MediaKind,
    pub time_base: Rational,
    /// Duration in `time_base` units
    pub duration: Option<i64>,
    pub packet_count: Option<u64>,
    pub codec: CodecParameters,
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
}

impl StreamDescriptor {
    pub fn duration_us(&self) -> Option<i64> {
        self.duration.map(|d| self.time_base.to_micros(d))
    }

    /// Frame rate for video streams, if known
    pub fn frame_rate(&self) -> Option<Rational> {
        self.video.map(|v| v.frame_rate).filter(Rational::is_valid)
    }

    /// True when the kind-specific fields a decoder scan would reveal are known
    pub fn is_resolved(&self) -> bool {
        match self.kind {
            MediaKind::Video => self.video.is_some_and(|v| v.width > 0 && v.height > 0),
            MediaKind::Audio => self.audio.is_some_and(|a| a.channels > 0 && a.sample_rate > 0),
            MediaKind::Subtitle => true,
        }
    }
}

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFlags {
    /// Independently decodable
    pub key: bool,
    /// First packet of a logical unit
    pub first: bool,
    /// Last packet of a logical unit
    pub last: bool,
    /// Packet is known to be damaged
    pub corrupt: bool,
}

/// Codec side data attached to a packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideData {
    pub kind: u32,
    pub data: Bytes,
}

/// One compressed packet, owned by whichever queue currently holds it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedPacket {
    pub stream_index: u32,
    pub kind: MediaKind,
    /// Presentation timestamp in stream time base
    pub pts: Option<i64>,
    /// Decode timestamp in stream time base
    pub dts: Option<i64>,
    pub duration: i64,
    pub flags: PacketFlags,
    pub data: Bytes,
    pub side_data: Vec<SideData>,
}

impl CompressedPacket {
    pub fn new(stream_index: u32, kind: MediaKind, data: Bytes) -> Self {
        Self {
            stream_index,
            kind,
            pts: None,
            dts: None,
            duration: 0,
            flags: PacketFlags::default(),
            data,
            side_data: Vec::new(),
        }
    }

    /// Best timestamp for ordering: pts, falling back to dts
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }

    /// Approximate in-memory size
    pub fn size(&self) -> usize {
        self.data.len() + self.side_data.iter().map(|s| s.data.len()).sum::<usize>()
    }
}

/// Decoded video frame, packed BGRA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub timestamp_us: i64,
    pub data: Vec<u8>,
}

impl VideoFrame {
    pub const BYTES_PER_PIXEL: usize = 4;

    pub fn byte_size(width: u32, height: u32) -> usize {
        width as usize * height as usize * Self::BYTES_PER_PIXEL
    }
}

/// Decoded audio chunk, interleaved signed 16-bit PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Samples per channel
    pub samples: usize,
    pub channels: u16,
    pub sample_rate: u32,
    pub timestamp_us: i64,
    pub data: Vec<u8>,
}

impl AudioFrame {
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Chunk duration in microseconds
    pub fn duration_us(&self) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples as i64 * US_PER_SEC) / self.sample_rate as i64
    }
}

/// Output of a decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl DecodedFrame {
    pub fn timestamp_us(&self) -> i64 {
        match self {
            DecodedFrame::Video(f) => f.timestamp_us,
            DecodedFrame::Audio(f) => f.timestamp_us,
        }
    }
}
