//! Test-pattern codec backend
//!
//! A deterministic in-process codec library: sources are registered by name,
//! packets carry a compact header (frame index plus picture or sample
//! layout), and the decoder synthesises colour bars or a sine tone from it.
//! Used by the binaries when no real container is given and throughout the
//! test suite.

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::{CodecBackend, Decoder, Demuxer, MediaSource};
use crate::error::{CodecError, OpenError};
use crate::media::{
    AudioFrame, AudioInfo, CodecParameters, CompressedPacket, DecodedFrame, MediaKind, PacketFlags,
    Rational, StreamDescriptor, VideoFrame, VideoInfo, US_PER_SEC,
};

/// Codec names understood by [`TestPatternBackend::find_decoder`]
pub const VIDEO_CODEC: &str = "testsrc-video";
pub const AUDIO_CODEC: &str = "testsrc-audio";
pub const SUBTITLE_CODEC: &str = "testsrc-text";

/// Name of the pattern every backend registers on construction
pub const DEFAULT_SOURCE: &str = "testsrc";

const MAGIC: [u8; 2] = *b"TP";
const HEADER_LEN: usize = 2 + 1 + 8;

/// Video track of a test pattern
#[derive(Debug, Clone, PartialEq)]
pub struct VideoPattern {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub time_base: Rational,
    /// Packets between keyframes
    pub gop: u64,
}

/// Audio track of a test pattern
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPattern {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_packet: u32,
    pub time_base: Rational,
}

/// Description of a synthetic container
#[derive(Debug, Clone, PartialEq)]
pub struct TestPattern {
    pub duration_us: i64,
    pub video: Option<VideoPattern>,
    pub audio: Option<AudioPattern>,
    pub subtitles: bool,
    /// Whether stream headers declare duration and packet count
    pub declare_lengths: bool,
    /// Whether stream headers declare picture size / sample layout
    pub declare_layout: bool,
    /// Video packet indices that arrive damaged
    pub corrupt_video: HashSet<u64>,
}

impl TestPattern {
    pub fn new(duration_us: i64) -> Self {
        Self {
            duration_us,
            video: None,
            audio: None,
            subtitles: false,
            declare_lengths: true,
            declare_layout: true,
            corrupt_video: HashSet::new(),
        }
    }

    pub fn with_video(mut self, width: u32, height: u32, fps: u32) -> Self {
        self.video = Some(VideoPattern {
            codec: VIDEO_CODEC.to_string(),
            width,
            height,
            frame_rate: Rational::new(fps as i32, 1),
            time_base: Rational::MICROS,
            gop: fps.max(1) as u64,
        });
        self
    }

    pub fn with_audio(mut self, sample_rate: u32, channels: u16, samples_per_packet: u32) -> Self {
        self.audio = Some(AudioPattern {
            codec: AUDIO_CODEC.to_string(),
            sample_rate,
            channels,
            samples_per_packet,
            time_base: Rational::new(1, sample_rate as i32),
        });
        self
    }

    pub fn with_subtitles(mut self) -> Self {
        self.subtitles = true;
        self
    }

    /// Leave duration and packet count out of the stream headers
    pub fn without_lengths(mut self) -> Self {
        self.declare_lengths = false;
        self
    }

    /// Leave picture size and sample layout out of the stream headers
    pub fn without_layout(mut self) -> Self {
        self.declare_layout = false;
        self
    }

    pub fn with_corrupt_video(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.corrupt_video.extend(indices);
        self
    }

    /// The pattern served under [`DEFAULT_SOURCE`]
    pub fn standard() -> Self {
        Self::new(60 * US_PER_SEC)
            .with_video(320, 180, 30)
            .with_audio(48_000, 2, 1024)
    }

    pub fn video_packet_count(&self) -> u64 {
        self.video.as_ref().map_or(0, |v| {
            let count = self.duration_us as i128 * v.frame_rate.num as i128
                / (v.frame_rate.den as i128 * US_PER_SEC as i128);
            count.max(0) as u64
        })
    }

    pub fn audio_packet_count(&self) -> u64 {
        self.audio.as_ref().map_or(0, |a| {
            let count = self.duration_us as i128 * a.sample_rate as i128
                / (a.samples_per_packet.max(1) as i128 * US_PER_SEC as i128);
            count.max(0) as u64
        })
    }

    fn video_time_us(&self, index: u64) -> i64 {
        self.video.as_ref().map_or(0, |v| {
            (index as i128 * US_PER_SEC as i128 * v.frame_rate.den as i128 / v.frame_rate.num as i128) as i64
        })
    }

    fn audio_time_us(&self, index: u64) -> i64 {
        self.audio.as_ref().map_or(0, |a| {
            (index as i128 * a.samples_per_packet as i128 * US_PER_SEC as i128 / a.sample_rate as i128) as i64
        })
    }

    fn descriptors(&self) -> Vec<StreamDescriptor> {
        let mut streams = Vec::new();
        if let Some(v) = &self.video {
            let mut codec = CodecParameters::new(v.codec.clone(), MediaKind::Video);
            if self.declare_layout {
                codec.width = v.width;
                codec.height = v.height;
            }
            streams.push(StreamDescriptor {
                index: streams.len() as u32,
                kind: MediaKind::Video,
                time_base: v.time_base,
                duration: self.declare_lengths.then(|| v.time_base.from_micros(self.duration_us)),
                packet_count: self.declare_lengths.then(|| self.video_packet_count()),
                codec,
                video: Some(VideoInfo {
                    width: if self.declare_layout { v.width } else { 0 },
                    height: if self.declare_layout { v.height } else { 0 },
                    frame_rate: v.frame_rate,
                }),
                audio: None,
            });
        }
        if let Some(a) = &self.audio {
            let mut codec = CodecParameters::new(a.codec.clone(), MediaKind::Audio);
            codec.frame_size = a.samples_per_packet;
            if self.declare_layout {
                codec.sample_rate = a.sample_rate;
                codec.channels = a.channels;
            }
            streams.push(StreamDescriptor {
                index: streams.len() as u32,
                kind: MediaKind::Audio,
                time_base: a.time_base,
                duration: self.declare_lengths.then(|| a.time_base.from_micros(self.duration_us)),
                packet_count: self.declare_lengths.then(|| self.audio_packet_count()),
                codec,
                video: None,
                audio: self.declare_layout.then_some(AudioInfo {
                    channels: a.channels,
                    sample_rate: a.sample_rate,
                }),
            });
        }
        if self.subtitles {
            streams.push(StreamDescriptor {
                index: streams.len() as u32,
                kind: MediaKind::Subtitle,
                time_base: Rational::new(1, 1000),
                duration: None,
                packet_count: None,
                codec: CodecParameters::new(SUBTITLE_CODEC, MediaKind::Subtitle),
                video: None,
                audio: None,
            });
        }
        streams
    }
}

/// Codec backend serving registered test patterns
pub struct TestPatternBackend {
    sources: RwLock<HashMap<String, TestPattern>>,
}

impl TestPatternBackend {
    pub fn new() -> Self {
        let backend = Self { sources: RwLock::new(HashMap::new()) };
        backend.register(DEFAULT_SOURCE, TestPattern::standard());
        backend
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register (or replace) a pattern under `name`
    pub fn register(&self, name: impl Into<String>, pattern: TestPattern) {
        self.sources.write().insert(name.into(), pattern);
    }

    fn lookup(&self, source: &MediaSource) -> Option<TestPattern> {
        let key = source.to_string();
        self.sources.read().get(&key).cloned()
    }
}

impl Default for TestPatternBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecBackend for TestPatternBackend {
    fn name(&self) -> &str {
        "testsrc"
    }

    fn open_demuxer(&self, source: &MediaSource) -> Result<Box<dyn Demuxer>, OpenError> {
        let pattern = self
            .lookup(source)
            .ok_or_else(|| OpenError::NotFound(source.to_string()))?;
        tracing::debug!(%source, "opened test pattern");
        Ok(Box::new(TestPatternDemuxer::new(pattern)))
    }

    fn find_decoder(&self, stream: &StreamDescriptor) -> Result<Box<dyn Decoder>, CodecError> {
        match (stream.kind, stream.codec.codec.as_str()) {
            (MediaKind::Video, VIDEO_CODEC) | (MediaKind::Audio, AUDIO_CODEC) => {
                Ok(Box::new(TestPatternDecoder::new(stream.kind, stream.time_base)))
            }
            (_, codec) => Err(CodecError::DecoderNotFound(codec.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ScheduleEntry {
    time_us: i64,
    kind: MediaKind,
    index: u64,
}

/// Demuxer over a [`TestPattern`], interleaving packets by time
pub struct TestPatternDemuxer {
    pattern: TestPattern,
    streams: Vec<StreamDescriptor>,
    schedule: Vec<ScheduleEntry>,
    cursor: usize,
}

impl TestPatternDemuxer {
    pub fn new(pattern: TestPattern) -> Self {
        let mut schedule: Vec<ScheduleEntry> = (0..pattern.video_packet_count())
            .map(|index| ScheduleEntry { time_us: pattern.video_time_us(index), kind: MediaKind::Video, index })
            .chain((0..pattern.audio_packet_count()).map(|index| ScheduleEntry {
                time_us: pattern.audio_time_us(index),
                kind: MediaKind::Audio,
                index,
            }))
            .collect();
        // stable sort keeps video ahead of audio at equal times
        schedule.sort_by_key(|e| e.time_us);

        Self { streams: pattern.descriptors(), pattern, schedule, cursor: 0 }
    }

    fn stream_index(&self, kind: MediaKind) -> u32 {
        self.streams.iter().find(|s| s.kind == kind).map_or(0, |s| s.index)
    }

    fn build_packet(&self, entry: ScheduleEntry) -> Option<CompressedPacket> {
        let mut payload = BytesMut::with_capacity(32);
        payload.put_slice(&MAGIC);
        let (ts, duration, flags) = match (entry.kind, &self.pattern.video, &self.pattern.audio) {
            (MediaKind::Video, Some(v), _) => {
                payload.put_u8(0);
                payload.put_u64_le(entry.index);
                payload.put_u32_le(v.width);
                payload.put_u32_le(v.height);
                let frame_us = self.pattern.video_time_us(entry.index + 1) - entry.time_us;
                let flags = PacketFlags {
                    key: entry.index % v.gop.max(1) == 0,
                    first: true,
                    last: true,
                    corrupt: self.pattern.corrupt_video.contains(&entry.index),
                };
                (v.time_base.from_micros(entry.time_us), v.time_base.from_micros(frame_us), flags)
            }
            (MediaKind::Audio, _, Some(a)) => {
                payload.put_u8(1);
                payload.put_u64_le(entry.index);
                payload.put_u32_le(a.samples_per_packet);
                payload.put_u16_le(a.channels);
                payload.put_u32_le(a.sample_rate);
                // time base is 1/sample_rate, so sample counts are exact timestamps
                let ts = entry.index as i64 * a.samples_per_packet as i64;
                let flags = PacketFlags { key: true, first: true, last: true, corrupt: false };
                (ts, a.samples_per_packet as i64, flags)
            }
            _ => return None,
        };

        let mut data = payload.freeze();
        if flags.corrupt {
            data.truncate(HEADER_LEN - 1);
        }

        let mut packet = CompressedPacket::new(self.stream_index(entry.kind), entry.kind, data);
        packet.pts = Some(ts);
        packet.dts = Some(ts);
        packet.duration = duration;
        packet.flags = flags;
        Some(packet)
    }
}

impl Demuxer for TestPatternDemuxer {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn duration_us(&self) -> Option<i64> {
        Some(self.pattern.duration_us)
    }

    fn read_packet(&mut self) -> Result<Option<CompressedPacket>, CodecError> {
        let Some(entry) = self.schedule.get(self.cursor).copied() else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(self.build_packet(entry))
    }

    fn seek(&mut self, target_us: i64) -> Result<(), CodecError> {
        let target_us = target_us.clamp(0, self.pattern.duration_us.max(0));
        let key_time = match &self.pattern.video {
            Some(v) => {
                let index = self
                    .schedule
                    .iter()
                    .filter(|e| e.kind == MediaKind::Video && e.index % v.gop.max(1) == 0)
                    .take_while(|e| e.time_us <= target_us)
                    .last()
                    .map_or(0, |e| e.index);
                self.pattern.video_time_us(index)
            }
            None => self
                .schedule
                .iter()
                .take_while(|e| e.time_us <= target_us)
                .last()
                .map_or(0, |e| e.time_us),
        };
        self.cursor = self.schedule.partition_point(|e| e.time_us < key_time);
        tracing::trace!(target_us, key_time, cursor = self.cursor, "test pattern seek");
        Ok(())
    }
}

/// Decoder that synthesises frames from test-pattern packets
pub struct TestPatternDecoder {
    kind: MediaKind,
    time_base: Rational,
    pending: VecDeque<DecodedFrame>,
}

impl TestPatternDecoder {
    pub fn new(kind: MediaKind, time_base: Rational) -> Self {
        Self { kind, time_base, pending: VecDeque::new() }
    }

    fn video_frame(index: u64, width: u32, height: u32, timestamp_us: i64) -> VideoFrame {
        const BARS: [[u8; 4]; 8] = [
            [0xC0, 0xC0, 0xC0, 0xFF],
            [0x00, 0xC0, 0xC0, 0xFF],
            [0xC0, 0xC0, 0x00, 0xFF],
            [0x00, 0xC0, 0x00, 0xFF],
            [0xC0, 0x00, 0xC0, 0xFF],
            [0x00, 0x00, 0xC0, 0xFF],
            [0xC0, 0x00, 0x00, 0xFF],
            [0x10, 0x10, 0x10, 0xFF],
        ];
        let mut data = Vec::with_capacity(VideoFrame::byte_size(width, height));
        let bar_width = (width as usize / BARS.len()).max(1);
        // bars scroll one column per frame
        let shift = index as usize;
        for _ in 0..height {
            for x in 0..width as usize {
                let bar = ((x + shift) / bar_width) % BARS.len();
                data.extend_from_slice(&BARS[bar]);
            }
        }
        VideoFrame { width, height, timestamp_us, data }
    }

    fn audio_frame(index: u64, samples: u32, channels: u16, sample_rate: u32, timestamp_us: i64) -> AudioFrame {
        const TONE_HZ: f64 = 440.0;
        let mut data = Vec::with_capacity(samples as usize * channels as usize * AudioFrame::BYTES_PER_SAMPLE);
        let first = index * samples as u64;
        for n in 0..samples as u64 {
            let t = (first + n) as f64 / sample_rate.max(1) as f64;
            let value = ((t * TONE_HZ * std::f64::consts::TAU).sin() * 0.25 * i16::MAX as f64) as i16;
            for _ in 0..channels {
                data.extend_from_slice(&value.to_le_bytes());
            }
        }
        AudioFrame { samples: samples as usize, channels, sample_rate, timestamp_us, data }
    }
}

impl Decoder for TestPatternDecoder {
    fn send_packet(&mut self, packet: &CompressedPacket) -> Result<(), CodecError> {
        let mut data: &[u8] = &packet.data;
        if packet.flags.corrupt || data.len() < HEADER_LEN || data[..2] != MAGIC {
            return Err(CodecError::DecodingFailed(format!(
                "malformed {} packet ({} bytes)",
                self.kind,
                packet.data.len()
            )));
        }
        data.advance(2);
        let kind = data.get_u8();
        let index = data.get_u64_le();
        let timestamp_us = self.time_base.to_micros(packet.timestamp().unwrap_or(0));

        let frame = match (self.kind, kind) {
            (MediaKind::Video, 0) if data.remaining() >= 8 => {
                let width = data.get_u32_le();
                let height = data.get_u32_le();
                DecodedFrame::Video(Self::video_frame(index, width, height, timestamp_us))
            }
            (MediaKind::Audio, 1) if data.remaining() >= 10 => {
                let samples = data.get_u32_le();
                let channels = data.get_u16_le();
                let sample_rate = data.get_u32_le();
                DecodedFrame::Audio(Self::audio_frame(index, samples, channels, sample_rate, timestamp_us))
            }
            _ => {
                return Err(CodecError::DecodingFailed(format!(
                    "packet kind {} does not match {} decoder",
                    kind, self.kind
                )))
            }
        };
        self.pending.push_back(frame);
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        Ok(self.pending.pop_front())
    }

    fn flush(&mut self) {
        self.pending.clear();
    }
}

/// Every packet of `pattern` in container order, for feeding a pipeline by hand
pub fn packets_for(pattern: &TestPattern) -> Vec<CompressedPacket> {
    let mut demuxer = TestPatternDemuxer::new(pattern.clone());
    let mut packets = Vec::new();
    while let Ok(Some(packet)) = demuxer.read_packet() {
        packets.push(packet);
    }
    packets
}
