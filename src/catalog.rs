//! Stream catalog
//!
//! Opens a container, picks the first usable video, audio and subtitle
//! stream, and fills in what the container headers leave out. Missing
//! durations and packet counts are estimated; missing picture size or sample
//! layout is learned by decoding the fewest packets that reveal it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::codec::{CodecBackend, Decoder, Demuxer, MediaSource};
use crate::config::CatalogConfig;
use crate::constants::DEFAULT_AUDIO_CHUNK_SAMPLES;
use crate::error::OpenError;
use crate::media::{
    AudioInfo, CodecParameters, DecodedFrame, MediaKind, Rational, StreamDescriptor, VideoInfo, US_PER_SEC,
};
use crate::protocol::StreamMetadata;

/// What a consumer learns about the producer's media during the handshake
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMedia {
    pub metadata: StreamMetadata,
    pub video: Option<(u32, CodecParameters)>,
    pub audio: Option<(u32, CodecParameters)>,
}

/// Printable view of a catalog
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSummary {
    pub source: String,
    pub backend: String,
    pub duration_us: Option<i64>,
    pub streams: Vec<StreamDescriptor>,
}

/// Selected streams of one media source
#[derive(Clone)]
pub struct Catalog {
    backend: Arc<dyn CodecBackend>,
    source: Option<MediaSource>,
    duration_us: Option<i64>,
    video: Option<StreamDescriptor>,
    audio: Option<StreamDescriptor>,
    subtitle: Option<StreamDescriptor>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("backend", &self.backend.name())
            .field("source", &self.source)
            .field("duration_us", &self.duration_us)
            .field("video", &self.video)
            .field("audio", &self.audio)
            .field("subtitle", &self.subtitle)
            .finish()
    }
}

impl Catalog {
    /// Open `source` and describe its streams
    pub fn open(
        backend: Arc<dyn CodecBackend>,
        source: MediaSource,
        config: &CatalogConfig,
    ) -> Result<Self, OpenError> {
        let mut demuxer = backend.open_demuxer(&source)?;
        let container_duration = demuxer.duration_us().filter(|d| *d > 0);

        let mut video = None;
        let mut audio = None;
        let mut subtitle = None;
        for stream in demuxer.streams() {
            match stream.kind {
                MediaKind::Video if video.is_none() => {
                    if usable(backend.as_ref(), stream) {
                        video = Some(stream.clone());
                    }
                }
                MediaKind::Audio if audio.is_none() => {
                    if usable(backend.as_ref(), stream) {
                        audio = Some(stream.clone());
                    }
                }
                MediaKind::Subtitle if subtitle.is_none() => subtitle = Some(stream.clone()),
                _ => {}
            }
        }

        if video.is_none() && audio.is_none() {
            return Err(OpenError::NoDecodableStreams(source.to_string()));
        }

        let mut catalog = Self { backend, source: Some(source), duration_us: container_duration, video, audio, subtitle };

        for stream in catalog.selected_mut() {
            if stream.duration.is_none() {
                if let Some(us) = container_duration {
                    stream.duration = Some(stream.time_base.from_micros(us));
                }
            }
        }

        if catalog.selected().any(|s| !s.is_resolved()) {
            catalog.scan_layout(demuxer.as_mut(), config.max_probe_packets);
        }

        for stream in catalog.selected_mut() {
            if stream.packet_count.is_none() {
                stream.packet_count = estimate_packet_count(stream);
            }
        }

        if catalog.duration_us.is_none() {
            catalog.duration_us = catalog.selected().filter_map(StreamDescriptor::duration_us).max();
        }

        tracing::info!(
            source = %catalog.source_name(),
            duration_us = ?catalog.duration_us,
            video = catalog.video.is_some(),
            audio = catalog.audio.is_some(),
            subtitle = catalog.subtitle.is_some(),
            "catalog opened"
        );
        Ok(catalog)
    }

    /// Build a catalog for a consumer from handshake data
    pub fn from_remote(backend: Arc<dyn CodecBackend>, remote: &RemoteMedia) -> Result<Self, OpenError> {
        let meta = &remote.metadata;

        let video = remote.video.as_ref().map(|(index, params)| StreamDescriptor {
            index: *index,
            kind: MediaKind::Video,
            time_base: meta.video_time_base,
            duration: Some(meta.video_time_base.from_micros(meta.duration_us)),
            packet_count: None,
            codec: params.clone(),
            video: Some(VideoInfo { width: params.width, height: params.height, frame_rate: meta.frame_rate }),
            audio: None,
        });
        let audio = remote.audio.as_ref().map(|(index, params)| StreamDescriptor {
            index: *index,
            kind: MediaKind::Audio,
            time_base: meta.audio_time_base,
            duration: Some(meta.audio_time_base.from_micros(meta.duration_us)),
            packet_count: None,
            codec: params.clone(),
            video: None,
            audio: Some(AudioInfo { channels: params.channels, sample_rate: params.sample_rate }),
        });

        let video = video.filter(|s| usable(backend.as_ref(), s));
        let audio = audio.filter(|s| usable(backend.as_ref(), s));
        if video.is_none() && audio.is_none() {
            return Err(OpenError::NoDecodableStreams("remote peer".into()));
        }

        let mut catalog = Self {
            backend,
            source: None,
            duration_us: Some(meta.duration_us),
            video,
            audio,
            subtitle: None,
        };
        for stream in catalog.selected_mut() {
            stream.packet_count = estimate_packet_count(stream);
        }
        Ok(catalog)
    }

    /// Handshake data describing this catalog to a consumer
    pub fn remote_media(&self) -> RemoteMedia {
        let metadata = StreamMetadata {
            duration_us: self.duration_us.unwrap_or(0),
            frame_rate: self.video.as_ref().and_then(StreamDescriptor::frame_rate).unwrap_or(Rational::new(0, 1)),
            video_time_base: self.video.as_ref().map_or(Rational::MICROS, |s| s.time_base),
            audio_time_base: self.audio.as_ref().map_or(Rational::MICROS, |s| s.time_base),
        };
        RemoteMedia {
            metadata,
            video: self.video.as_ref().map(|s| (s.index, s.codec.clone())),
            audio: self.audio.as_ref().map(|s| (s.index, s.codec.clone())),
        }
    }

    /// Open a fresh demuxer positioned at the start
    pub fn open_demuxer(&self) -> Result<Box<dyn Demuxer>, OpenError> {
        match &self.source {
            Some(source) => self.backend.open_demuxer(source),
            None => Err(OpenError::NotFound("catalog has no local source".into())),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CodecBackend> {
        &self.backend
    }

    pub fn source(&self) -> Option<&MediaSource> {
        self.source.as_ref()
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    pub fn video(&self) -> Option<&StreamDescriptor> {
        self.video.as_ref()
    }

    pub fn audio(&self) -> Option<&StreamDescriptor> {
        self.audio.as_ref()
    }

    pub fn subtitle(&self) -> Option<&StreamDescriptor> {
        self.subtitle.as_ref()
    }

    /// All described streams, decodable ones first
    pub fn streams(&self) -> Vec<&StreamDescriptor> {
        self.video.iter().chain(self.audio.iter()).chain(self.subtitle.iter()).collect()
    }

    pub fn summary(&self) -> CatalogSummary {
        CatalogSummary {
            source: self.source_name(),
            backend: self.backend.name().to_string(),
            duration_us: self.duration_us,
            streams: self.streams().into_iter().cloned().collect(),
        }
    }

    fn source_name(&self) -> String {
        self.source.as_ref().map_or_else(|| "remote".to_string(), ToString::to_string)
    }

    fn selected(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.video.iter().chain(self.audio.iter())
    }

    fn selected_mut(&mut self) -> impl Iterator<Item = &mut StreamDescriptor> {
        self.video.iter_mut().chain(self.audio.iter_mut())
    }

    /// Decode just enough packets to learn missing picture sizes / sample layouts
    fn scan_layout(&mut self, demuxer: &mut dyn Demuxer, max_packets: usize) {
        let mut pending: HashMap<u32, Box<dyn Decoder>> = HashMap::new();
        for stream in self.selected().filter(|s| !s.is_resolved()) {
            match self.backend.find_decoder(stream) {
                Ok(decoder) => {
                    pending.insert(stream.index, decoder);
                }
                Err(e) => tracing::warn!(stream = stream.index, "cannot scan {} stream: {}", stream.kind, e),
            }
        }

        let mut read = 0usize;
        while !pending.is_empty() && read < max_packets {
            let packet = match demuxer.read_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("scan stopped: {}", e);
                    break;
                }
            };
            read += 1;

            let Some(decoder) = pending.get_mut(&packet.stream_index) else {
                continue;
            };
            if let Err(e) = decoder.send_packet(&packet) {
                tracing::debug!(stream = packet.stream_index, "scan decode error: {}", e);
                continue;
            }
            let frame = match decoder.receive_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(stream = packet.stream_index, "scan decode error: {}", e);
                    continue;
                }
            };
            if self.apply_layout(packet.stream_index, &frame) {
                pending.remove(&packet.stream_index);
            }
        }

        tracing::debug!(packets = read, unresolved = pending.len(), "layout scan finished");
    }

    fn apply_layout(&mut self, index: u32, frame: &DecodedFrame) -> bool {
        let Some(stream) = self.selected_mut().find(|s| s.index == index) else {
            return false;
        };
        match frame {
            DecodedFrame::Video(f) => {
                let frame_rate = stream.video.map_or(Rational::new(0, 1), |v| v.frame_rate);
                stream.video = Some(VideoInfo { width: f.width, height: f.height, frame_rate });
                stream.codec.width = f.width;
                stream.codec.height = f.height;
            }
            DecodedFrame::Audio(f) => {
                stream.audio = Some(AudioInfo { channels: f.channels, sample_rate: f.sample_rate });
                stream.codec.channels = f.channels;
                stream.codec.sample_rate = f.sample_rate;
                if stream.codec.frame_size == 0 {
                    stream.codec.frame_size = f.samples as u32;
                }
            }
        }
        stream.is_resolved()
    }
}

fn usable(backend: &dyn CodecBackend, stream: &StreamDescriptor) -> bool {
    match backend.find_decoder(stream) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(stream = stream.index, "skipping {} stream: {}", stream.kind, e);
            false
        }
    }
}

/// Estimate the packet count of a stream from its duration
fn estimate_packet_count(stream: &StreamDescriptor) -> Option<u64> {
    let duration_us = stream.duration_us().filter(|d| *d > 0)? as i128;
    let count = match stream.kind {
        MediaKind::Video => {
            let rate = stream.frame_rate()?;
            duration_us * rate.num as i128 / (rate.den as i128 * US_PER_SEC as i128)
        }
        MediaKind::Audio => {
            let sample_rate = stream.audio.map(|a| a.sample_rate).filter(|r| *r > 0)? as i128;
            let chunk = i128::from(if stream.codec.frame_size == 0 {
                DEFAULT_AUDIO_CHUNK_SAMPLES
            } else {
                stream.codec.frame_size
            });
            duration_us * sample_rate / (chunk * US_PER_SEC as i128)
        }
        MediaKind::Subtitle => return None,
    };
    u64::try_from(count).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testsrc::{TestPattern, TestPatternBackend};

    fn backend_with(name: &str, pattern: TestPattern) -> Arc<dyn CodecBackend> {
        let backend = TestPatternBackend::new();
        backend.register(name, pattern);
        Arc::new(backend)
    }

    fn open(backend: Arc<dyn CodecBackend>, name: &str) -> Result<Catalog, OpenError> {
        Catalog::open(backend, MediaSource::Named(name.into()), &CatalogConfig::default())
    }

    #[test]
    fn test_summary_serializes() {
        let pattern = TestPattern::new(2 * US_PER_SEC).with_video(16, 16, 25);
        let catalog = open(backend_with("tiny", pattern), "tiny").unwrap();
        let json = serde_json::to_value(catalog.summary()).unwrap();
        assert_eq!(json["source"], "tiny");
        assert_eq!(json["duration_us"], 2_000_000);
        assert_eq!(json["streams"].as_array().map(Vec::len), Some(1));
        assert_eq!(json["streams"][0]["video"]["width"], 16);
    }

    #[test]
    fn test_open_declared_streams() {
        let pattern = TestPattern::new(10 * US_PER_SEC)
            .with_video(32, 18, 30)
            .with_audio(48_000, 2, 1600)
            .with_subtitles();
        let catalog = open(backend_with("clip", pattern), "clip").unwrap();

        let video = catalog.video().unwrap();
        assert_eq!(video.packet_count, Some(300));
        assert_eq!(video.video.unwrap().width, 32);
        let audio = catalog.audio().unwrap();
        assert_eq!(audio.audio.unwrap().sample_rate, 48_000);
        assert!(catalog.subtitle().is_some());
        assert_eq!(catalog.duration_us(), Some(10 * US_PER_SEC));
        assert_eq!(catalog.streams().len(), 3);
    }

    #[test]
    fn test_not_found() {
        let err = open(TestPatternBackend::shared(), "nope").unwrap_err();
        assert!(matches!(err, OpenError::NotFound(_)));
    }

    #[test]
    fn test_no_decodable_streams() {
        let mut pattern = TestPattern::new(US_PER_SEC).with_video(16, 16, 25).with_subtitles();
        if let Some(v) = pattern.video.as_mut() {
            v.codec = "vp99".into();
        }
        let err = open(backend_with("odd", pattern), "odd").unwrap_err();
        assert!(matches!(err, OpenError::NoDecodableStreams(_)));
    }

    #[test]
    fn test_backfill_from_scan_and_estimates() {
        let pattern = TestPattern::new(4 * US_PER_SEC)
            .with_video(48, 24, 25)
            .with_audio(44_100, 1, 1470)
            .without_lengths()
            .without_layout();
        let catalog = open(backend_with("bare", pattern), "bare").unwrap();

        let video = catalog.video().unwrap();
        let info = video.video.unwrap();
        assert_eq!((info.width, info.height), (48, 24));
        assert_eq!((video.codec.width, video.codec.height), (48, 24));
        assert_eq!(video.duration_us(), Some(4 * US_PER_SEC));
        assert_eq!(video.packet_count, Some(100));

        let audio = catalog.audio().unwrap();
        assert_eq!(audio.audio, Some(AudioInfo { channels: 1, sample_rate: 44_100 }));
        assert_eq!(audio.packet_count, Some(120));
    }

    #[test]
    fn test_scan_respects_budget() {
        let pattern = TestPattern::new(4 * US_PER_SEC)
            .with_video(48, 24, 25)
            .without_layout();
        let config = CatalogConfig { max_probe_packets: 0 };
        let catalog =
            Catalog::open(backend_with("bare", pattern), MediaSource::Named("bare".into()), &config).unwrap();
        assert!(!catalog.video().unwrap().is_resolved());
    }

    #[test]
    fn test_remote_roundtrip() {
        let pattern = TestPattern::new(10 * US_PER_SEC).with_video(32, 18, 30).with_audio(48_000, 2, 1600);
        let backend = backend_with("clip", pattern);
        let local = open(backend.clone(), "clip").unwrap();
        let remote = local.remote_media();
        assert_eq!(remote.metadata.frame_rate, Rational::new(30, 1));

        let rebuilt = Catalog::from_remote(backend, &remote).unwrap();
        assert_eq!(rebuilt.video().unwrap().video, local.video().unwrap().video);
        assert_eq!(rebuilt.audio().unwrap().audio, local.audio().unwrap().audio);
        assert_eq!(rebuilt.video().unwrap().packet_count, Some(300));
        assert!(rebuilt.open_demuxer().is_err());
    }
}
