//! FFmpeg-backed codec library binding
//!
//! Containers are opened with libavformat. Decoders are always built from
//! [`CodecParameters`] rather than from the container's native parameters, so
//! the consumer, which only ever sees the parameters that came over the wire,
//! takes the same path as the producer.
//!
//! Video frames are scaled to packed BGRA and audio is resampled to
//! interleaved s16 at the source rate and channel count.

use bytes::Bytes;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::sample::{Sample, Type as SampleType};
use ffmpeg::format::Pixel;
use ffmpeg::media::Type;
use ffmpeg::software::resampling;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};
use ffmpeg::util::channel_layout::ChannelLayout;

use super::{CodecBackend, Decoder, Demuxer, MediaSource};
use crate::error::{CodecError, OpenError};
use crate::media::{
    AudioFrame, AudioInfo, CodecParameters, CompressedPacket, DecodedFrame, MediaKind, PacketFlags, Rational,
    StreamDescriptor, VideoFrame, VideoInfo,
};

const OUTPUT_SAMPLE: Sample = Sample::I16(SampleType::Packed);

/// Codec backend over libavformat / libavcodec
pub struct FfmpegBackend {
    /// Handles named sources and codecs libavcodec does not know
    fallback: Option<Arc<dyn CodecBackend>>,
}

impl FfmpegBackend {
    pub fn new() -> Result<Self, OpenError> {
        ffmpeg::init().map_err(|e| OpenError::Container(format!("ffmpeg init: {}", e)))?;
        Ok(Self { fallback: None })
    }

    /// Delegate named sources and unknown codecs to `fallback`
    pub fn with_fallback(mut self, fallback: Arc<dyn CodecBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl CodecBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn open_demuxer(&self, source: &MediaSource) -> Result<Box<dyn Demuxer>, OpenError> {
        match source {
            MediaSource::Path(path) => Ok(Box::new(FfmpegDemuxer::open(path)?)),
            MediaSource::Named(name) => match &self.fallback {
                Some(fallback) => fallback.open_demuxer(source),
                None => Err(OpenError::NotFound(name.clone())),
            },
        }
    }

    fn find_decoder(&self, stream: &StreamDescriptor) -> Result<Box<dyn Decoder>, CodecError> {
        if ffmpeg::codec::decoder::find_by_name(&stream.codec.codec).is_none() {
            if let Some(fallback) = &self.fallback {
                return fallback.find_decoder(stream);
            }
        }
        Ok(Box::new(FfmpegDecoder::new(stream)?))
    }
}

/// An opened container
pub struct FfmpegDemuxer {
    input: ffmpeg::format::context::Input,
    streams: Vec<StreamDescriptor>,
    /// Indexed by container stream index; `None` for streams that are not exposed
    kinds: Vec<Option<MediaKind>>,
    duration_us: Option<i64>,
}

// SAFETY: the format context is owned by this demuxer and only touched
// through `&mut self`, so it is never used from two threads at once.
unsafe impl Send for FfmpegDemuxer {}

impl FfmpegDemuxer {
    pub fn open(path: &Path) -> Result<Self, OpenError> {
        if !path.exists() {
            return Err(OpenError::NotFound(path.display().to_string()));
        }
        let input = ffmpeg::format::input(path)
            .map_err(|e| OpenError::Container(format!("{}: {}", path.display(), e)))?;

        let mut streams = Vec::new();
        let mut kinds = Vec::new();
        for stream in input.streams() {
            let descriptor = describe(&stream);
            kinds.push(descriptor.as_ref().map(|d| d.kind));
            streams.extend(descriptor);
        }

        let duration = input.duration();
        let duration_us = (duration > 0).then_some(duration);
        tracing::info!(path = %path.display(), streams = streams.len(), ?duration_us, "container opened");
        Ok(Self { input, streams, kinds, duration_us })
    }
}

fn media_kind(medium: Type) -> Option<MediaKind> {
    match medium {
        Type::Video => Some(MediaKind::Video),
        Type::Audio => Some(MediaKind::Audio),
        Type::Subtitle => Some(MediaKind::Subtitle),
        _ => None,
    }
}

fn rational(r: ffmpeg::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

fn describe(stream: &ffmpeg::format::stream::Stream<'_>) -> Option<StreamDescriptor> {
    let parameters = stream.parameters();
    let kind = media_kind(parameters.medium())?;

    let mut codec = CodecParameters::new(parameters.id().name(), kind);
    unsafe {
        let p = parameters.as_ptr();
        codec.codec_tag = (*p).codec_tag;
        codec.format = (*p).format;
        codec.bit_rate = (*p).bit_rate;
        codec.width = (*p).width.max(0) as u32;
        codec.height = (*p).height.max(0) as u32;
        codec.sample_rate = (*p).sample_rate.max(0) as u32;
        codec.channels = (*p).ch_layout.nb_channels.max(0) as u16;
        codec.frame_size = (*p).frame_size.max(0) as u32;
        if !(*p).extradata.is_null() && (*p).extradata_size > 0 {
            let extradata = std::slice::from_raw_parts((*p).extradata, (*p).extradata_size as usize);
            codec.extradata = Bytes::copy_from_slice(extradata);
        }
    }

    let frame_rate = {
        let avg = rational(stream.avg_frame_rate());
        if avg.is_valid() {
            avg
        } else {
            rational(stream.rate())
        }
    };
    let video = (kind == MediaKind::Video && codec.width > 0 && codec.height > 0)
        .then_some(VideoInfo { width: codec.width, height: codec.height, frame_rate });
    let audio = (kind == MediaKind::Audio && codec.channels > 0 && codec.sample_rate > 0)
        .then_some(AudioInfo { channels: codec.channels, sample_rate: codec.sample_rate });

    Some(StreamDescriptor {
        index: stream.index() as u32,
        kind,
        time_base: rational(stream.time_base()),
        duration: (stream.duration() > 0).then_some(stream.duration()),
        packet_count: (stream.frames() > 0).then_some(stream.frames() as u64),
        codec,
        video,
        audio,
    })
}

impl Demuxer for FfmpegDemuxer {
    fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    fn read_packet(&mut self) -> Result<Option<CompressedPacket>, CodecError> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) => return Err(CodecError::DemuxFailed(e.to_string())),
            }
            let index = packet.stream();
            let Some(kind) = self.kinds.get(index).copied().flatten() else { continue };

            return Ok(Some(CompressedPacket {
                stream_index: index as u32,
                kind,
                pts: packet.pts(),
                dts: packet.dts(),
                duration: packet.duration(),
                flags: PacketFlags { key: packet.is_key(), corrupt: packet.is_corrupt(), ..PacketFlags::default() },
                data: Bytes::copy_from_slice(packet.data().unwrap_or(&[])),
                side_data: Vec::new(),
            }));
        }
    }

    fn seek(&mut self, target_us: i64) -> Result<(), CodecError> {
        // timestamps without a stream index are in AV_TIME_BASE, i.e. microseconds
        self.input.seek(target_us, ..=target_us).map_err(|e| {
            tracing::warn!(target_us, "container seek failed: {}", e);
            CodecError::SeekFailed(target_us)
        })
    }
}

enum Inner {
    Video { decoder: ffmpeg::codec::decoder::Video, scaler: Option<(Pixel, u32, u32, SwsContext)> },
    Audio { decoder: ffmpeg::codec::decoder::Audio, resampler: Option<resampling::Context> },
}

/// Decoder for one stream with BGRA / s16 conversion
pub struct FfmpegDecoder {
    inner: Inner,
    time_base: Rational,
    last_timestamp_us: i64,
}

// SAFETY: the codec, scaler and resampler contexts are owned by this decoder
// and only used through `&mut self`.
unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    pub fn new(stream: &StreamDescriptor) -> Result<Self, CodecError> {
        let params = &stream.codec;
        let codec = ffmpeg::codec::decoder::find_by_name(&params.codec)
            .ok_or_else(|| CodecError::DecoderNotFound(params.codec.clone()))?;
        let mut context = ffmpeg::codec::context::Context::new_with_codec(codec);
        unsafe { apply_parameters(context.as_mut_ptr(), params, stream.time_base) };

        let decoder = context.decoder();
        let inner = match stream.kind {
            MediaKind::Video => Inner::Video {
                decoder: decoder.video().map_err(|e| CodecError::DecoderInit(e.to_string()))?,
                scaler: None,
            },
            MediaKind::Audio => Inner::Audio {
                decoder: decoder.audio().map_err(|e| CodecError::DecoderInit(e.to_string()))?,
                resampler: None,
            },
            MediaKind::Subtitle => return Err(CodecError::DecoderNotFound(format!("{} (subtitle)", params.codec))),
        };
        tracing::debug!(codec = %params.codec, kind = %stream.kind, "ffmpeg decoder opened");
        Ok(Self { inner, time_base: stream.time_base, last_timestamp_us: 0 })
    }

    fn timestamp_us(&mut self, timestamp: Option<i64>) -> i64 {
        if let Some(ts) = timestamp {
            self.last_timestamp_us = self.time_base.to_micros(ts);
        }
        self.last_timestamp_us
    }
}

/// Copy the wire parameters into a fresh codec context
///
/// # Safety
/// `p` must point to a valid, not yet opened codec context.
unsafe fn apply_parameters(p: *mut ffmpeg::ffi::AVCodecContext, params: &CodecParameters, time_base: Rational) {
    (*p).codec_tag = params.codec_tag;
    (*p).bit_rate = params.bit_rate;
    (*p).pkt_timebase = ffmpeg::ffi::AVRational { num: time_base.num, den: time_base.den };
    match params.kind {
        MediaKind::Video => {
            (*p).width = params.width as i32;
            (*p).height = params.height as i32;
        }
        MediaKind::Audio => {
            (*p).sample_rate = params.sample_rate as i32;
            (*p).frame_size = params.frame_size as i32;
            if params.channels > 0 {
                ffmpeg::ffi::av_channel_layout_default(&mut (*p).ch_layout, params.channels as i32);
            }
        }
        MediaKind::Subtitle => {}
    }
    if !params.extradata.is_empty() {
        let len = params.extradata.len();
        let buffer = ffmpeg::ffi::av_mallocz(len + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
        if !buffer.is_null() {
            ptr::copy_nonoverlapping(params.extradata.as_ptr(), buffer, len);
            (*p).extradata = buffer;
            (*p).extradata_size = len as i32;
        }
    }
}

/// `Ok(false)` when the decoder needs more input or is drained
fn received(result: Result<(), ffmpeg::Error>) -> Result<bool, CodecError> {
    match result {
        Ok(()) => Ok(true),
        Err(ffmpeg::Error::Eof) => Ok(false),
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => Ok(false),
        Err(e) => Err(CodecError::DecodingFailed(e.to_string())),
    }
}

impl Decoder for FfmpegDecoder {
    fn send_packet(&mut self, packet: &CompressedPacket) -> Result<(), CodecError> {
        let mut native = ffmpeg::Packet::copy(&packet.data);
        native.set_pts(packet.pts);
        native.set_dts(packet.dts);
        native.set_duration(packet.duration);
        if packet.flags.key {
            native.set_flags(ffmpeg::packet::Flags::KEY);
        }
        let result = match &mut self.inner {
            Inner::Video { decoder, .. } => decoder.send_packet(&native),
            Inner::Audio { decoder, .. } => decoder.send_packet(&native),
        };
        result.map_err(|e| CodecError::DecodingFailed(e.to_string()))
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        match &mut self.inner {
            Inner::Video { decoder, scaler } => {
                let mut decoded = ffmpeg::util::frame::video::Video::empty();
                if !received(decoder.receive_frame(&mut decoded))? {
                    return Ok(None);
                }
                let (format, width, height) = (decoded.format(), decoded.width(), decoded.height());
                if scaler.as_ref().map_or(true, |(f, w, h, _)| (*f, *w, *h) != (format, width, height)) {
                    let context = SwsContext::get(format, width, height, Pixel::BGRA, width, height, Flags::BILINEAR)
                        .map_err(|e| CodecError::DecodingFailed(format!("scaler: {}", e)))?;
                    *scaler = Some((format, width, height, context));
                }
                let mut bgra = ffmpeg::util::frame::video::Video::empty();
                if let Some((_, _, _, context)) = scaler {
                    context.run(&decoded, &mut bgra).map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
                }

                // copy visible pixels only, not stride padding
                let stride = bgra.stride(0);
                let row_bytes = width as usize * 4;
                let raw = bgra.data(0);
                let mut data = Vec::with_capacity(VideoFrame::byte_size(width, height));
                for row in 0..height as usize {
                    data.extend_from_slice(&raw[row * stride..row * stride + row_bytes]);
                }

                let timestamp = decoded.timestamp().or(decoded.pts());
                let timestamp_us = self.timestamp_us(timestamp);
                Ok(Some(DecodedFrame::Video(VideoFrame { width, height, timestamp_us, data })))
            }
            Inner::Audio { decoder, resampler } => {
                let mut decoded = ffmpeg::util::frame::audio::Audio::empty();
                if !received(decoder.receive_frame(&mut decoded))? {
                    return Ok(None);
                }
                let channels = decoded.ch_layout().channels() as u16;
                let sample_rate = decoded.rate();

                let mut data = Vec::new();
                if decoded.format() == OUTPUT_SAMPLE {
                    let len = decoded.samples() * channels as usize * AudioFrame::BYTES_PER_SAMPLE;
                    data.extend_from_slice(&decoded.data(0)[..len]);
                } else {
                    if resampler.is_none() {
                        // mono sources must be declared as MONO or swr misreads the channel count
                        let layout = || if channels >= 2 { decoded.ch_layout() } else { ChannelLayout::MONO };
                        let context = resampling::Context::get2(
                            decoded.format(),
                            layout(),
                            sample_rate,
                            OUTPUT_SAMPLE,
                            layout(),
                            sample_rate,
                        )
                        .map_err(|e| CodecError::DecodingFailed(format!("resampler: {}", e)))?;
                        *resampler = Some(context);
                    }
                    let mut resampled = ffmpeg::util::frame::audio::Audio::empty();
                    if let Some(context) = resampler {
                        context.run(&decoded, &mut resampled).map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
                    }
                    let len = resampled.samples() * channels as usize * AudioFrame::BYTES_PER_SAMPLE;
                    data.extend_from_slice(&resampled.data(0)[..len]);
                }

                let timestamp = decoded.timestamp().or(decoded.pts());
                let timestamp_us = self.timestamp_us(timestamp);
                let samples = data.len() / (channels.max(1) as usize * AudioFrame::BYTES_PER_SAMPLE);
                Ok(Some(DecodedFrame::Audio(AudioFrame { samples, channels, sample_rate, timestamp_us, data })))
            }
        }
    }

    fn flush(&mut self) {
        match &mut self.inner {
            Inner::Video { decoder, .. } => decoder.flush(),
            Inner::Audio { decoder, .. } => decoder.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testsrc::TestPattern;
    use crate::codec::TestPatternBackend;
    use crate::media::US_PER_SEC;

    fn fallback() -> Arc<dyn CodecBackend> {
        let backend = TestPatternBackend::shared();
        backend.register("clip", TestPattern::new(2 * US_PER_SEC).with_video(16, 8, 25));
        backend
    }

    #[test]
    fn test_missing_sources_are_not_found() {
        let backend = FfmpegBackend::new().unwrap();
        assert!(matches!(
            backend.open_demuxer(&MediaSource::Named("clip".into())),
            Err(OpenError::NotFound(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let missing = MediaSource::Path(dir.path().join("absent.mkv"));
        assert!(matches!(backend.open_demuxer(&missing), Err(OpenError::NotFound(_))));
    }

    #[test]
    fn test_unreadable_container_is_a_container_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.bin");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let backend = FfmpegBackend::new().unwrap();
        assert!(matches!(backend.open_demuxer(&MediaSource::Path(path)), Err(OpenError::Container(_))));
    }

    #[test]
    fn test_fallback_handles_named_sources_and_unknown_codecs() {
        let backend = FfmpegBackend::new().unwrap().with_fallback(fallback());
        assert_eq!(backend.name(), "ffmpeg");
        let demuxer = backend.open_demuxer(&MediaSource::Named("clip".into())).unwrap();
        let video = demuxer.streams()[0].clone();
        assert!(backend.find_decoder(&video).is_ok());

        let bare = FfmpegBackend::new().unwrap();
        assert!(matches!(bare.find_decoder(&video), Err(CodecError::DecoderNotFound(_))));
    }
}
