//! Playback facade
//!
//! What an output adapter talks to: due video frames and audio chunks paced
//! by the playback clock, buffering state, and transport controls that are
//! echoed to the peer when a session is active.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::codec::CodecBackend;
use crate::config::AppConfig;
use crate::media::{AudioFrame, VideoFrame};
use crate::network::{PacketTransport, SessionEvent, StreamingSession};
use crate::pipeline::{DecodePipeline, PlaybackRole};

/// Paced access to one pipeline, local or streamed
pub struct Player {
    pipeline: Option<Arc<DecodePipeline>>,
    session: Option<StreamingSession>,
    dropped_frames: AtomicU64,
}

impl Player {
    /// Play `catalog` locally
    pub fn offline(catalog: &Catalog, config: &AppConfig) -> crate::Result<Self> {
        let pipeline = Arc::new(DecodePipeline::new(PlaybackRole::Offline, catalog, config.pipeline.clone())?);
        pipeline.start()?;
        Ok(Self::new(Some(pipeline), None))
    }

    /// Play `catalog` locally and stream it to the consumer on `transport`
    pub fn producer(catalog: &Catalog, transport: Arc<PacketTransport>, config: &AppConfig) -> crate::Result<Self> {
        let pipeline = Arc::new(DecodePipeline::new(PlaybackRole::Producer, catalog, config.pipeline.clone())?);
        pipeline.start()?;
        let session = StreamingSession::producer(
            transport,
            Arc::clone(&pipeline),
            catalog.remote_media(),
            config.session.clone(),
        )?;
        Ok(Self::new(Some(pipeline), Some(session)))
    }

    /// Play what the producer on `transport` streams
    pub fn consumer(
        transport: Arc<PacketTransport>,
        backend: Arc<dyn CodecBackend>,
        config: &AppConfig,
    ) -> crate::Result<Self> {
        let session =
            StreamingSession::consumer(transport, backend, config.pipeline.clone(), config.session.clone())?;
        Ok(Self::new(None, Some(session)))
    }

    fn new(pipeline: Option<Arc<DecodePipeline>>, session: Option<StreamingSession>) -> Self {
        Self { pipeline, session, dropped_frames: AtomicU64::new(0) }
    }

    /// The active pipeline; a consumer has none until the handshake completes
    pub fn pipeline(&self) -> Option<Arc<DecodePipeline>> {
        match &self.session {
            Some(session) => session.pipeline(),
            None => self.pipeline.clone(),
        }
    }

    pub fn session(&self) -> Option<&StreamingSession> {
        self.session.as_ref()
    }

    pub fn role(&self) -> PlaybackRole {
        self.session.as_ref().map_or(PlaybackRole::Offline, StreamingSession::role)
    }

    /// Latest video frame due on the clock; older due frames are skipped
    pub fn video_frame(&self) -> Option<VideoFrame> {
        let pipeline = self.pipeline()?;
        self.update_buffering(&pipeline);
        let now = pipeline.clock().now_us();

        let mut latest = None;
        while let Some(frame) = pipeline.pop_video_frame_due(now) {
            if latest.replace(frame).is_some() {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
        latest
    }

    /// Next audio chunk due on the clock
    pub fn audio_frame(&self) -> Option<AudioFrame> {
        let pipeline = self.pipeline()?;
        self.update_buffering(&pipeline);
        pipeline.pop_audio_frame_due(pipeline.clock().now_us())
    }

    /// Whether output should hold while the queues refill. The clock is held meanwhile.
    pub fn buffering(&self) -> bool {
        match self.pipeline() {
            Some(pipeline) => self.update_buffering(&pipeline),
            None => true,
        }
    }

    fn update_buffering(&self, pipeline: &DecodePipeline) -> bool {
        let remote = self.role() == PlaybackRole::Producer
            && self.session.as_ref().is_some_and(StreamingSession::remote_buffering);
        let buffering = pipeline.buffering() || remote;
        let clock = pipeline.clock();
        if clock.is_stalled() != buffering {
            clock.set_stalled(buffering);
        }
        buffering
    }

    pub fn play(&self) {
        match &self.session {
            Some(session) => session.play(),
            None => {
                if let Some(pipeline) = &self.pipeline {
                    pipeline.clock().play();
                }
            }
        }
    }

    pub fn pause(&self) {
        match &self.session {
            Some(session) => session.pause(),
            None => {
                if let Some(pipeline) = &self.pipeline {
                    pipeline.clock().pause();
                }
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.pipeline().is_some_and(|p| p.clock().is_playing())
    }

    pub fn seek_to(&self, target_us: i64) {
        match &self.session {
            Some(session) => session.seek_to(target_us),
            None => {
                if let Some(pipeline) = &self.pipeline {
                    pipeline.seek_to(target_us);
                }
            }
        }
    }

    pub fn position_us(&self) -> i64 {
        self.pipeline().map_or(0, |p| p.clock().now_us())
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.pipeline().and_then(|p| p.duration_us())
    }

    /// Video frames skipped because a newer one was already due
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn poll_event(&self) -> Option<SessionEvent> {
        self.session.as_ref()?.poll_event()
    }

    /// Close the session and stop decoding
    pub fn stop(&self) {
        if let Some(session) = &self.session {
            session.close();
        }
        if let Some(pipeline) = self.pipeline() {
            pipeline.stop();
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testsrc::TestPattern;
    use crate::codec::{MediaSource, TestPatternBackend};
    use crate::config::{CatalogConfig, NetworkConfig, PipelineConfig};
    use crate::media::US_PER_SEC;
    use crate::network::listen;
    use std::thread;
    use std::time::{Duration, Instant};

    fn config() -> AppConfig {
        AppConfig {
            pipeline: PipelineConfig {
                packet_queue_capacity: 32,
                poll_interval_ms: 2,
                low_watermark_ms: 200,
                high_watermark_ms: 1_000,
                ..PipelineConfig::default()
            },
            ..AppConfig::default()
        }
    }

    fn backend() -> Arc<TestPatternBackend> {
        let backend = TestPatternBackend::shared();
        backend.register("clip", TestPattern::new(10 * US_PER_SEC).with_video(32, 16, 30).with_audio(48_000, 2, 1600));
        backend
    }

    fn catalog() -> Catalog {
        Catalog::open(backend(), MediaSource::Named("clip".into()), &CatalogConfig::default()).unwrap()
    }

    fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_offline_frames_follow_the_clock() {
        let player = Player::offline(&catalog(), &config()).unwrap();
        assert_eq!(player.role(), PlaybackRole::Offline);
        wait_for("buffer", || !player.buffering());

        // paused at zero only the first frame is due
        let first = player.video_frame().expect("first frame");
        assert_eq!(first.timestamp_us, 0);
        assert!(player.video_frame().is_none());

        // jumping the clock makes every earlier frame due; only the latest is returned
        player.pipeline().unwrap().clock().set(1_000_000);
        let frame = player.video_frame().expect("due frame");
        assert_eq!(frame.timestamp_us, 1_000_000);
        assert_eq!(player.dropped_frames(), 29);

        let chunk = player.audio_frame().expect("due chunk");
        assert_eq!(chunk.timestamp_us, 0);
    }

    #[test]
    fn test_offline_play_and_seek() {
        let player = Player::offline(&catalog(), &config()).unwrap();
        wait_for("buffer", || !player.buffering());
        player.play();
        assert!(player.is_playing());

        player.seek_to(4_000_000);
        assert_eq!(player.position_us() / 100_000, 40);
        wait_for("post-seek frame", || player.video_frame().is_some_and(|f| f.timestamp_us >= 4_000_000));
        player.pause();
        assert!(!player.is_playing());
        assert_eq!(player.poll_event(), None);
    }

    fn connected_pair() -> (Arc<PacketTransport>, Arc<PacketTransport>) {
        let net = NetworkConfig::default();
        let listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn({
            let net = net.clone();
            move || PacketTransport::accept(&listener, &net, None).unwrap()
        });
        let consumer_side = Arc::new(PacketTransport::connect(addr, &net, None).unwrap());
        (Arc::new(accept.join().unwrap()), consumer_side)
    }

    #[test]
    fn test_consumer_buffers_until_handshake() {
        let (_silent_peer, consumer_side) = connected_pair();
        let consumer = Player::consumer(consumer_side, backend(), &config()).unwrap();
        assert_eq!(consumer.role(), PlaybackRole::Consumer);
        assert!(consumer.pipeline().is_none());
        assert!(consumer.buffering());
        assert!(consumer.video_frame().is_none());
        assert_eq!(consumer.position_us(), 0);
    }

    #[test]
    fn test_consumer_follows_producer() {
        let (producer_side, consumer_side) = connected_pair();

        let producer = Player::producer(&catalog(), producer_side, &config()).unwrap();
        let consumer = Player::consumer(consumer_side, backend(), &config()).unwrap();

        wait_for("handshake", || consumer.poll_event() == Some(SessionEvent::HandshakeComplete));
        assert_eq!(consumer.duration_us(), Some(10 * US_PER_SEC));
        assert_eq!(producer.role(), PlaybackRole::Producer);
        assert_eq!(consumer.role(), PlaybackRole::Consumer);

        consumer.play();
        wait_for("remote play", || producer.poll_event() == Some(SessionEvent::RemotePlay));
        assert!(producer.is_playing());
        wait_for("consumer frame", || consumer.video_frame().is_some());

        producer.stop();
        wait_for("disconnect", || consumer.poll_event() == Some(SessionEvent::Disconnected));
        assert_eq!(consumer.role(), PlaybackRole::Offline);
    }
}
