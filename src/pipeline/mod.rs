//! Decode pipeline
//!
//! One extractor thread reads compressed packets from the demuxer and routes
//! them to per-stream packet queues; one worker thread per stream decodes them
//! into a bounded frame queue. In the consumer role there is no demuxer and
//! packets are injected by the streaming session instead.
//!
//! Seek and flush are coordinated through [`ControlState`]: the extractor
//! clears every packet queue, raises a flush flag per worker and waits until
//! each worker has reset its decoder and emptied its frame queue.

mod buffering;
mod clock;
mod control;
mod extractor;
mod worker;

pub use buffering::BufferingTracker;
pub use clock::PlaybackClock;
pub use control::ControlState;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::catalog::Catalog;
use crate::codec::{Decoder, Demuxer};
use crate::config::PipelineConfig;
use crate::constants::DEFAULT_AUDIO_CHUNK_SAMPLES;
use crate::error::PipelineError;
use crate::media::{AudioFrame, CompressedPacket, DecodedFrame, MediaKind, StreamDescriptor, VideoFrame};
use crate::queue::SharedQueue;

use extractor::Extractor;
use worker::DecodeWorker;

/// Fallback picture size for sizing the video queue
const FALLBACK_WIDTH: u32 = 1280;
const FALLBACK_HEIGHT: u32 = 720;

/// Where a pipeline gets its packets and whether it forwards them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackRole {
    /// Local playback from a container
    Offline,
    /// Local playback that also mirrors packets to a consumer
    Producer,
    /// Packets arrive from a producer
    Consumer,
}

impl PlaybackRole {
    pub fn reads_container(self) -> bool {
        !matches!(self, PlaybackRole::Consumer)
    }
}

/// Lifecycle of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Decoding,
    Seeking,
    Stopped,
}

/// Packet and frame queues of one selected stream
pub(crate) struct StreamChannel {
    pub(crate) descriptor: StreamDescriptor,
    pub(crate) packets: SharedQueue<CompressedPacket>,
    pub(crate) frames: SharedQueue<DecodedFrame>,
}

impl StreamChannel {
    fn new(descriptor: StreamDescriptor, packet_capacity: usize, frame_capacity: usize) -> Self {
        Self {
            descriptor,
            packets: SharedQueue::bounded(packet_capacity),
            frames: SharedQueue::bounded(frame_capacity),
        }
    }

    fn kind(&self) -> MediaKind {
        self.descriptor.kind
    }

    /// Newest queued timestamp in microseconds, packets before frames
    fn tail_us(&self) -> Option<i64> {
        let time_base = self.descriptor.time_base;
        self.packets
            .with_back(|p| p.timestamp().map(|ts| time_base.to_micros(ts)))
            .flatten()
            .or_else(|| self.frames.with_back(DecodedFrame::timestamp_us))
    }

    fn clear(&self) -> usize {
        self.packets.clear()
    }

    fn wake(&self) {
        self.packets.wake_all();
        self.frames.wake_all();
    }
}

/// Counters updated by the pipeline threads
#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub(crate) packets_read: AtomicU64,
    pub(crate) packets_injected: AtomicU64,
    pub(crate) packets_decoded: AtomicU64,
    pub(crate) video_frames: AtomicU64,
    pub(crate) audio_frames: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) seeks: AtomicU64,
}

impl PipelineCounters {
    pub(crate) fn frame_produced(&self, kind: MediaKind) {
        match kind {
            MediaKind::Video => self.video_frames.fetch_add(1, Ordering::Relaxed),
            _ => self.audio_frames.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// Pipeline statistics snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub packets_read: u64,
    pub packets_injected: u64,
    pub packets_decoded: u64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub decode_errors: u64,
    pub seeks: u64,
    pub video_packets_queued: usize,
    pub audio_packets_queued: usize,
    pub video_frames_queued: usize,
    pub audio_frames_queued: usize,
    pub outbound_queued: usize,
}

/// Resources handed to the threads on start
struct Pending {
    demuxer: Option<Box<dyn Demuxer>>,
    decoders: Vec<(Arc<StreamChannel>, Box<dyn Decoder>)>,
}

/// Extractor plus per-stream decode workers
pub struct DecodePipeline {
    role: PlaybackRole,
    config: PipelineConfig,
    duration_us: Option<i64>,
    control: Arc<ControlState>,
    clock: Arc<PlaybackClock>,
    video: Option<Arc<StreamChannel>>,
    audio: Option<Arc<StreamChannel>>,
    outbound: Arc<SharedQueue<CompressedPacket>>,
    mirror: Arc<AtomicBool>,
    tracker: Mutex<BufferingTracker>,
    counters: Arc<PipelineCounters>,
    pending: Mutex<Option<Pending>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DecodePipeline {
    /// Create a pipeline over the selected streams of `catalog`
    pub fn new(role: PlaybackRole, catalog: &Catalog, config: PipelineConfig) -> Result<Self, PipelineError> {
        if catalog.video().is_none() && catalog.audio().is_none() {
            return Err(PipelineError::NoStreams);
        }

        let video = catalog.video().map(|stream| {
            let (width, height) = stream
                .video
                .as_ref()
                .filter(|v| v.width > 0 && v.height > 0)
                .map_or((FALLBACK_WIDTH, FALLBACK_HEIGHT), |v| (v.width, v.height));
            Arc::new(StreamChannel::new(
                stream.clone(),
                config.packet_queue_capacity,
                config.video_frame_capacity(width, height),
            ))
        });
        let audio = catalog.audio().map(|stream| {
            let channels = stream.audio.as_ref().map_or(2, |a| a.channels);
            let samples = match stream.codec.frame_size {
                0 => DEFAULT_AUDIO_CHUNK_SAMPLES,
                n => n,
            };
            Arc::new(StreamChannel::new(
                stream.clone(),
                config.packet_queue_capacity,
                config.audio_frame_capacity(channels, samples),
            ))
        });

        let mut decoders = Vec::new();
        for channel in video.iter().chain(audio.iter()) {
            let decoder = catalog.backend().find_decoder(&channel.descriptor)?;
            decoders.push((Arc::clone(channel), decoder));
        }
        let demuxer = if role.reads_container() { Some(catalog.open_demuxer()?) } else { None };

        tracing::info!(
            ?role,
            video_capacity = ?video.as_ref().map(|c| c.frames.capacity()),
            audio_capacity = ?audio.as_ref().map(|c| c.frames.capacity()),
            "decode pipeline created"
        );

        Ok(Self {
            role,
            tracker: Mutex::new(BufferingTracker::new(config.low_watermark_us(), config.high_watermark_us())),
            outbound: Arc::new(SharedQueue::bounded(config.outbound_queue_capacity)),
            mirror: Arc::new(AtomicBool::new(role == PlaybackRole::Producer)),
            config,
            duration_us: catalog.duration_us(),
            control: Arc::new(ControlState::new()),
            clock: Arc::new(PlaybackClock::new()),
            video,
            audio,
            counters: Arc::new(PipelineCounters::default()),
            pending: Mutex::new(Some(Pending { demuxer, decoders })),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the worker threads (and the extractor when reading a container)
    pub fn start(&self) -> Result<(), PipelineError> {
        if self.control.is_stopped() {
            return Err(PipelineError::Stopped);
        }
        let Some(pending) = self.pending.lock().take() else {
            return Ok(());
        };

        let mut threads = self.threads.lock();
        for (channel, decoder) in pending.decoders {
            let worker = DecodeWorker::new(
                channel,
                decoder,
                Arc::clone(&self.control),
                Arc::clone(&self.counters),
                self.config.poll_interval(),
            );
            let name = format!("decode-{}", worker.kind());
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker.run())
                .map_err(|e| PipelineError::Spawn(e.to_string()))?;
            threads.push(handle);
        }

        if let Some(demuxer) = pending.demuxer {
            let extractor = Extractor::new(
                demuxer,
                self.channels().cloned().collect(),
                Arc::clone(&self.outbound),
                Arc::clone(&self.mirror),
                Arc::clone(&self.control),
                Arc::clone(&self.counters),
                self.config.poll_interval(),
            );
            let handle = thread::Builder::new()
                .name("packet-extractor".into())
                .spawn(move || extractor.run())
                .map_err(|e| PipelineError::Spawn(e.to_string()))?;
            threads.push(handle);
        }

        self.started.store(true, Ordering::SeqCst);
        tracing::info!(role = ?self.role, threads = threads.len(), "decode pipeline started");
        Ok(())
    }

    /// Stop and join every thread. Terminal.
    pub fn stop(&self) {
        self.control.stop();
        for channel in self.channels() {
            channel.wake();
        }
        self.outbound.wake_all();

        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("pipeline thread panicked");
            }
        }
        tracing::info!(role = ?self.role, "decode pipeline stopped");
    }

    pub fn state(&self) -> PipelineState {
        if self.control.is_stopped() {
            PipelineState::Stopped
        } else if !self.started.load(Ordering::SeqCst) {
            PipelineState::Idle
        } else if self.flushing() {
            PipelineState::Seeking
        } else {
            PipelineState::Decoding
        }
    }

    pub fn role(&self) -> PlaybackRole {
        self.role
    }

    /// Seek to `target_us`; the clock jumps immediately
    pub fn seek_to(&self, target_us: i64) {
        let target_us = match self.duration_us {
            Some(duration) if duration > 0 => target_us.clamp(0, duration),
            _ => target_us.max(0),
        };
        self.clock.set(target_us);

        if self.role.reads_container() {
            self.control.request_seek(target_us);
            for channel in self.channels() {
                channel.wake();
            }
            tracing::debug!(target_us, "seek requested");
            return;
        }

        // no extractor in the consumer role: flush directly
        let dropped: usize = self.channels().map(|c| c.clear()).sum();
        for channel in self.channels() {
            self.control.request_flush(channel.kind());
        }
        self.counters.seeks.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target_us, dropped, "consumer flush requested");
    }

    /// A seek or flush is still in progress
    pub fn flushing(&self) -> bool {
        self.control.any_flush_requested()
            || (self.role.reads_container() && self.control.seek_target().is_some())
    }

    /// Queue a packet received from the producer
    pub fn inject_packet(&self, packet: CompressedPacket) -> Result<(), PipelineError> {
        if self.role != PlaybackRole::Consumer {
            return Err(PipelineError::WrongRole { expected: PlaybackRole::Consumer, actual: self.role });
        }
        if self.control.is_stopped() {
            return Err(PipelineError::Stopped);
        }
        match self.channel_for(&packet) {
            Some(channel) => {
                channel.packets.force_push(packet);
                self.counters.packets_injected.fetch_add(1, Ordering::Relaxed);
            }
            None => tracing::trace!(stream = packet.stream_index, "dropping packet for unselected stream"),
        }
        Ok(())
    }

    /// Take up to `max` mirrored packets for the network
    pub fn drain_outbound(&self, max: usize) -> Vec<CompressedPacket> {
        self.outbound.drain(max)
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Stop mirroring packets, e.g. after the consumer disconnected
    pub fn disable_outbound(&self) {
        if self.mirror.swap(false, Ordering::SeqCst) {
            let dropped = self.outbound.clear();
            tracing::info!(dropped, "outbound mirroring disabled");
        }
    }

    pub fn mirroring(&self) -> bool {
        self.mirror.load(Ordering::SeqCst)
    }

    pub fn pop_video_frame(&self) -> Option<VideoFrame> {
        match self.video.as_ref()?.frames.pop()? {
            DecodedFrame::Video(frame) => Some(frame),
            DecodedFrame::Audio(_) => None,
        }
    }

    pub fn pop_audio_frame(&self) -> Option<AudioFrame> {
        match self.audio.as_ref()?.frames.pop()? {
            DecodedFrame::Audio(frame) => Some(frame),
            DecodedFrame::Video(_) => None,
        }
    }

    /// Pop the oldest video frame if it is due at `now_us`
    pub fn pop_video_frame_due(&self, now_us: i64) -> Option<VideoFrame> {
        let frame = self.video.as_ref()?.frames.pop_if(|f| f.timestamp_us() <= now_us)?;
        match frame {
            DecodedFrame::Video(frame) => Some(frame),
            DecodedFrame::Audio(_) => None,
        }
    }

    /// Pop the oldest audio chunk if it is due at `now_us`
    pub fn pop_audio_frame_due(&self, now_us: i64) -> Option<AudioFrame> {
        let frame = self.audio.as_ref()?.frames.pop_if(|f| f.timestamp_us() <= now_us)?;
        match frame {
            DecodedFrame::Audio(frame) => Some(frame),
            DecodedFrame::Video(_) => None,
        }
    }

    pub fn peek_video_timestamp(&self) -> Option<i64> {
        self.video.as_ref()?.frames.with_front(DecodedFrame::timestamp_us)
    }

    pub fn peek_audio_timestamp(&self) -> Option<i64> {
        self.audio.as_ref()?.frames.with_front(DecodedFrame::timestamp_us)
    }

    /// Whether playback should hold to let the queues refill
    pub fn buffering(&self) -> bool {
        let mut tracker = self.tracker.lock();
        if self.control.eof() {
            tracker.reset(false);
            return false;
        }

        let now = self.clock.now_us();
        let high = self.config.high_watermark_us();
        let leads: Vec<Option<i64>> = self
            .channels()
            .map(|channel| {
                let tail = channel.tail_us()?;
                // everything up to the end of the media is already queued
                match self.duration_us {
                    Some(duration) if duration > 0 && tail + self.config.low_watermark_us() >= duration => {
                        Some(high.max(tail - now))
                    }
                    _ => Some(tail - now),
                }
            })
            .collect();

        let was = tracker.is_buffering();
        let now_buffering = tracker.update(&leads);
        if was != now_buffering {
            tracing::debug!(buffering = now_buffering, ?leads, clock_us = now, "buffering changed");
        }
        now_buffering
    }

    pub fn clock(&self) -> &Arc<PlaybackClock> {
        &self.clock
    }

    /// The demuxer reached the end of the media
    pub fn eof(&self) -> bool {
        self.control.eof()
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        let packets = |ch: &Option<Arc<StreamChannel>>| ch.as_ref().map_or(0, |c| c.packets.len());
        let frames = |ch: &Option<Arc<StreamChannel>>| ch.as_ref().map_or(0, |c| c.frames.len());
        PipelineStats {
            packets_read: c.packets_read.load(Ordering::Relaxed),
            packets_injected: c.packets_injected.load(Ordering::Relaxed),
            packets_decoded: c.packets_decoded.load(Ordering::Relaxed),
            video_frames: c.video_frames.load(Ordering::Relaxed),
            audio_frames: c.audio_frames.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            seeks: c.seeks.load(Ordering::Relaxed),
            video_packets_queued: packets(&self.video),
            audio_packets_queued: packets(&self.audio),
            video_frames_queued: frames(&self.video),
            audio_frames_queued: frames(&self.audio),
            outbound_queued: self.outbound.len(),
        }
    }

    fn channels(&self) -> impl Iterator<Item = &Arc<StreamChannel>> {
        self.video.iter().chain(self.audio.iter())
    }

    fn channel_for(&self, packet: &CompressedPacket) -> Option<&Arc<StreamChannel>> {
        self.channels().find(|c| c.descriptor.index == packet.stream_index && c.kind() == packet.kind)
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RemoteMedia;
    use crate::codec::testsrc::{packets_for, TestPattern};
    use crate::codec::{MediaSource, TestPatternBackend};
    use crate::config::CatalogConfig;
    use crate::media::US_PER_SEC;
    use std::time::{Duration, Instant};

    fn pattern() -> TestPattern {
        TestPattern::new(10 * US_PER_SEC).with_video(32, 16, 30).with_audio(48_000, 2, 1600)
    }

    fn catalog_for(pattern: TestPattern) -> Catalog {
        let backend = TestPatternBackend::shared();
        backend.register("clip", pattern);
        Catalog::open(backend, MediaSource::Named("clip".into()), &CatalogConfig::default()).unwrap()
    }

    fn small_queues() -> PipelineConfig {
        PipelineConfig { packet_queue_capacity: 16, poll_interval_ms: 2, ..PipelineConfig::default() }
    }

    fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn collect_video(pipeline: &DecodePipeline, expected: usize) -> Vec<i64> {
        let mut timestamps = Vec::new();
        wait_for("video frames", || {
            while let Some(frame) = pipeline.pop_video_frame() {
                timestamps.push(frame.timestamp_us);
            }
            timestamps.len() >= expected
        });
        timestamps
    }

    #[test]
    fn test_offline_decode_preserves_order() {
        let pipeline = DecodePipeline::new(PlaybackRole::Offline, &catalog_for(pattern()), small_queues()).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Decoding);

        let video = collect_video(&pipeline, 300);
        assert_eq!(video.len(), 300);
        assert!(video.windows(2).all(|w| w[0] < w[1]));

        let mut audio = Vec::new();
        wait_for("audio chunks", || {
            while let Some(chunk) = pipeline.pop_audio_frame() {
                audio.push(chunk.timestamp_us);
            }
            audio.len() >= 300
        });
        assert!(audio.windows(2).all(|w| w[0] < w[1]));

        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(matches!(pipeline.start(), Err(PipelineError::Stopped)));
    }

    #[test]
    fn test_seek_lands_on_preceding_keyframe() {
        let pipeline = DecodePipeline::new(PlaybackRole::Offline, &catalog_for(pattern()), small_queues()).unwrap();
        pipeline.start().unwrap();
        wait_for("first frames", || pipeline.peek_video_timestamp().is_some());

        pipeline.seek_to(5_000_000);
        assert!(pipeline.flushing());
        wait_for("seek to finish", || !pipeline.flushing());
        assert_eq!(pipeline.stats().seeks, 1);
        assert_eq!(pipeline.clock().now_us(), 5_000_000);

        let video = collect_video(&pipeline, 30);
        let first = video[0];
        assert!(first <= 5_000_000, "first frame {} after target", first);
        assert!(first > 4_000_000, "first frame {} before the preceding keyframe", first);
        assert!(video.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_corrupt_packets_are_skipped() {
        let pattern = pattern().with_corrupt_video([3, 4]);
        let pipeline = DecodePipeline::new(PlaybackRole::Offline, &catalog_for(pattern), small_queues()).unwrap();
        pipeline.start().unwrap();

        let video = collect_video(&pipeline, 298);
        assert_eq!(video.len(), 298);
        assert_eq!(pipeline.stats().decode_errors, 2);
    }

    #[test]
    fn test_consumer_decodes_injected_packets() {
        let source = catalog_for(pattern());
        let remote: RemoteMedia = source.remote_media();
        let catalog = Catalog::from_remote(Arc::clone(source.backend()), &remote).unwrap();
        let pipeline = DecodePipeline::new(PlaybackRole::Consumer, &catalog, small_queues()).unwrap();
        pipeline.start().unwrap();

        for packet in packets_for(&pattern()).into_iter().take(40) {
            pipeline.inject_packet(packet).unwrap();
        }
        let mut frames = 0;
        wait_for("decoded frames", || {
            while pipeline.pop_video_frame().is_some() {
                frames += 1;
            }
            frames == 20
        });
        assert!(!pipeline.eof());
        assert!(pipeline.drain_outbound(10).is_empty());
    }

    #[test]
    fn test_consumer_seek_flushes_queues() {
        let source = catalog_for(pattern());
        let catalog = Catalog::from_remote(Arc::clone(source.backend()), &source.remote_media()).unwrap();
        let pipeline = DecodePipeline::new(PlaybackRole::Consumer, &catalog, small_queues()).unwrap();
        pipeline.start().unwrap();
        for packet in packets_for(&pattern()).into_iter().take(20) {
            pipeline.inject_packet(packet).unwrap();
        }
        wait_for("decoded frames", || pipeline.peek_video_timestamp().is_some());

        pipeline.seek_to(2_000_000);
        wait_for("flush", || !pipeline.flushing());
        assert_eq!(pipeline.peek_video_timestamp(), None);
        assert_eq!(pipeline.stats().video_packets_queued, 0);
    }

    #[test]
    fn test_role_checks() {
        let catalog = catalog_for(pattern());
        let offline = DecodePipeline::new(PlaybackRole::Offline, &catalog, small_queues()).unwrap();
        let packet = packets_for(&pattern()).remove(0);
        assert!(matches!(
            offline.inject_packet(packet),
            Err(PipelineError::WrongRole { expected: PlaybackRole::Consumer, actual: PlaybackRole::Offline })
        ));
        assert!(!offline.mirroring());
    }

    #[test]
    fn test_producer_mirrors_packets() {
        let pipeline = DecodePipeline::new(PlaybackRole::Producer, &catalog_for(pattern()), small_queues()).unwrap();
        pipeline.start().unwrap();

        let mut mirrored = Vec::new();
        wait_for("outbound packets", || {
            mirrored.extend(pipeline.drain_outbound(64));
            mirrored.len() >= 100
        });
        let video: Vec<i64> =
            mirrored.iter().filter(|p| p.kind == MediaKind::Video).filter_map(|p| p.timestamp()).collect();
        assert!(video.windows(2).all(|w| w[0] < w[1]));

        pipeline.disable_outbound();
        assert!(!pipeline.mirroring());
        assert_eq!(pipeline.outbound_len(), 0);
    }

    #[test]
    fn test_buffering_until_queues_fill_then_clear_at_eof() {
        let config = PipelineConfig { low_watermark_ms: 1_000, high_watermark_ms: 5_000, ..small_queues() };
        let pipeline = DecodePipeline::new(PlaybackRole::Offline, &catalog_for(pattern()), config).unwrap();
        assert!(pipeline.buffering());

        pipeline.start().unwrap();
        // nothing is consumed, so the demuxer runs to the end of the clip
        wait_for("eof", || {
            while pipeline.pop_audio_frame().is_some() {}
            while pipeline.pop_video_frame().is_some() {}
            pipeline.eof()
        });
        assert!(!pipeline.buffering());
    }
}
