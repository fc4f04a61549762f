//! Streaming session between a producer and a consumer
//!
//! A single pump thread per session dispatches inbound messages, answers
//! every message with a BYTE_ACK, and (on the producer) moves mirrored
//! packets from the pipeline into the send queue as the flow window allows.
//!
//! Seeks: whoever initiates purges its unsent packets. A consumer flushes its
//! pipeline and discards every packet until the matching SEEK_ACK arrives; a
//! producer seeks its pipeline and sends SEEK_ACK once the seek is done,
//! ahead of any post-seek packet.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::flow::FlowWindow;
use super::transport::{PacketTransport, TransportStats};
use crate::catalog::{Catalog, RemoteMedia};
use crate::codec::CodecBackend;
use crate::config::{PipelineConfig, SessionConfig};
use crate::error::{PipelineError, ProtocolError};
use crate::media::{CodecParameters, CompressedPacket, MediaKind};
use crate::pipeline::{DecodePipeline, PlaybackRole};
use crate::protocol::{
    decode_byte_ack, decode_timestamp, encode_byte_ack, encode_timestamp, CodecParamsMessage, MessageKind, PeerId,
    Payload, StreamMetadata, WireMessage,
};

/// Inbound messages handled per pump iteration before servicing the send side
const MAX_INBOUND_PER_TICK: usize = 256;

/// Notifications for the playback layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The consumer pipeline is built and running
    HandshakeComplete,
    RemotePlay,
    RemotePause,
    RemoteSeek(i64),
    Disconnected,
}

/// Handshake data collected by a consumer
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    video: Option<Option<(u32, CodecParameters)>>,
    audio: Option<Option<(u32, CodecParameters)>>,
    metadata: Option<StreamMetadata>,
}

impl Handshake {
    pub fn apply_codec_params(&mut self, message: CodecParamsMessage) {
        let entry = message.params.map(|params| (message.stream_index, params));
        match message.kind {
            MediaKind::Video => self.video = Some(entry),
            MediaKind::Audio => self.audio = Some(entry),
            MediaKind::Subtitle => {}
        }
    }

    pub fn apply_metadata(&mut self, metadata: StreamMetadata) {
        self.metadata = Some(metadata);
    }

    fn has_video_params(&self) -> bool {
        self.video.is_some()
    }

    fn has_audio_params(&self) -> bool {
        self.audio.is_some()
    }

    fn has_duration(&self) -> bool {
        self.metadata.is_some_and(|m| m.duration_us >= 0)
    }

    fn has_frame_rate(&self) -> bool {
        self.metadata.is_some_and(|m| m.frame_rate.is_valid() || matches!(self.video, Some(None)))
    }

    fn has_time_bases(&self) -> bool {
        self.metadata.is_some_and(|m| {
            (m.video_time_base.is_valid() || matches!(self.video, Some(None)))
                && (m.audio_time_base.is_valid() || matches!(self.audio, Some(None)))
        })
    }

    /// Every piece of the handshake has arrived
    pub fn metadata_received(&self) -> bool {
        self.has_video_params()
            && self.has_audio_params()
            && self.has_duration()
            && self.has_frame_rate()
            && self.has_time_bases()
    }

    pub fn remote_media(&self) -> Option<RemoteMedia> {
        if !self.metadata_received() {
            return None;
        }
        Some(RemoteMedia {
            metadata: self.metadata?,
            video: self.video.clone().flatten(),
            audio: self.audio.clone().flatten(),
        })
    }
}

/// The producer's handshake: CODEC_PARAMS(video), CODEC_PARAMS(audio), METADATA
pub fn handshake_batch(remote: &RemoteMedia) -> Result<Vec<(MessageKind, Bytes)>, ProtocolError> {
    let params = |kind, stream: &Option<(u32, CodecParameters)>| CodecParamsMessage {
        kind,
        stream_index: stream.as_ref().map_or(0, |(index, _)| *index),
        params: stream.as_ref().map(|(_, params)| params.clone()),
    };
    Ok(vec![
        (MessageKind::CodecParams, params(MediaKind::Video, &remote.video).encode()?),
        (MessageKind::CodecParams, params(MediaKind::Audio, &remote.audio).encode()?),
        (MessageKind::Metadata, remote.metadata.encode()?),
    ])
}

#[derive(Debug, Default)]
struct SeekState {
    /// Consumer: target of the SEEK_ACK still expected
    awaiting_ack: Option<i64>,
    /// Producer: target to acknowledge once the pipeline finishes seeking
    pending_ack: Option<i64>,
}

#[derive(Debug, Default)]
struct SessionCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_injected: AtomicU64,
    packets_discarded: AtomicU64,
}

/// Session statistics
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub role: PlaybackRole,
    pub peer: PeerId,
    pub connected_at: DateTime<Utc>,
    pub handshake_complete: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub packets_sent: u64,
    pub packets_injected: u64,
    pub packets_discarded: u64,
    pub bytes_in_flight: u64,
    pub send_queue_len: usize,
    pub remote_buffering: bool,
    pub transport: TransportStats,
}

/// What a consumer needs to build its pipeline after the handshake
struct ConsumerSetup {
    backend: Arc<dyn CodecBackend>,
    pipeline_config: PipelineConfig,
}

struct Shared {
    transport: Arc<PacketTransport>,
    config: SessionConfig,
    role: Mutex<PlaybackRole>,
    pipeline: RwLock<Option<Arc<DecodePipeline>>>,
    remote: Option<RemoteMedia>,
    consumer: Option<ConsumerSetup>,
    handshake: Mutex<Handshake>,
    handshake_complete: AtomicBool,
    send_queue: Mutex<VecDeque<WireMessage>>,
    flow: Mutex<FlowWindow>,
    seek: Mutex<SeekState>,
    remote_buffering: AtomicBool,
    reported_buffering: AtomicBool,
    /// Set by the transport's disconnect callback
    link_lost: Arc<AtomicBool>,
    stop: AtomicBool,
    events: Sender<SessionEvent>,
    counters: SessionCounters,
    connected_at: DateTime<Utc>,
}

/// One peer connection with its protocol state
pub struct StreamingSession {
    shared: Arc<Shared>,
    events: Receiver<SessionEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingSession {
    /// Serve `pipeline`'s mirrored packets to the consumer on `transport`
    pub fn producer(
        transport: Arc<PacketTransport>,
        pipeline: Arc<DecodePipeline>,
        remote: RemoteMedia,
        config: SessionConfig,
    ) -> crate::Result<Self> {
        if pipeline.role() != PlaybackRole::Producer {
            return Err(PipelineError::WrongRole { expected: PlaybackRole::Producer, actual: pipeline.role() }.into());
        }
        Self::spawn(transport, PlaybackRole::Producer, Some(pipeline), Some(remote), None, config)
    }

    /// Receive media from the producer on `transport`; the pipeline is built once the handshake completes
    pub fn consumer(
        transport: Arc<PacketTransport>,
        backend: Arc<dyn CodecBackend>,
        pipeline_config: PipelineConfig,
        config: SessionConfig,
    ) -> crate::Result<Self> {
        let setup = ConsumerSetup { backend, pipeline_config };
        Self::spawn(transport, PlaybackRole::Consumer, None, None, Some(setup), config)
    }

    fn spawn(
        transport: Arc<PacketTransport>,
        role: PlaybackRole,
        pipeline: Option<Arc<DecodePipeline>>,
        remote: Option<RemoteMedia>,
        consumer: Option<ConsumerSetup>,
        config: SessionConfig,
    ) -> crate::Result<Self> {
        let (tx, rx) = unbounded();
        let link_lost = Arc::new(AtomicBool::new(false));
        transport.on_disconnect(Box::new({
            let link_lost = Arc::clone(&link_lost);
            move |peer| {
                tracing::debug!(%peer, "transport reported disconnect");
                link_lost.store(true, Ordering::SeqCst);
            }
        }));
        let shared = Arc::new(Shared {
            flow: Mutex::new(FlowWindow::new(config.flow_window_bytes)),
            transport,
            config,
            role: Mutex::new(role),
            pipeline: RwLock::new(pipeline),
            remote,
            consumer,
            handshake: Mutex::new(Handshake::default()),
            handshake_complete: AtomicBool::new(false),
            send_queue: Mutex::new(VecDeque::new()),
            seek: Mutex::new(SeekState::default()),
            remote_buffering: AtomicBool::new(false),
            reported_buffering: AtomicBool::new(false),
            link_lost,
            stop: AtomicBool::new(false),
            events: tx,
            counters: SessionCounters::default(),
            connected_at: Utc::now(),
        });

        let pump = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("session-{}", role_name(role)))
            .spawn(move || pump.run())
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;

        tracing::info!(?role, peer = %shared.transport.peer(), "streaming session started");
        Ok(Self { shared, events: rx, pump: Mutex::new(Some(handle)) })
    }

    pub fn role(&self) -> PlaybackRole {
        *self.shared.role.lock()
    }

    pub fn peer(&self) -> PeerId {
        self.shared.transport.peer()
    }

    /// The session's pipeline; a consumer has one once the handshake completed
    pub fn pipeline(&self) -> Option<Arc<DecodePipeline>> {
        self.shared.pipeline.read().clone()
    }

    pub fn handshake_complete(&self) -> bool {
        self.shared.handshake_complete.load(Ordering::SeqCst)
    }

    pub fn play(&self) {
        if let Some(pipeline) = self.pipeline() {
            pipeline.clock().play();
        }
        if self.role() != PlaybackRole::Offline {
            self.shared.send_control(MessageKind::Play, Bytes::new());
        }
    }

    pub fn pause(&self) {
        if let Some(pipeline) = self.pipeline() {
            pipeline.clock().pause();
        }
        if self.role() != PlaybackRole::Offline {
            self.shared.send_control(MessageKind::Pause, Bytes::new());
        }
    }

    /// Seek locally and tell the peer
    pub fn seek_to(&self, target_us: i64) {
        let shared = &self.shared;
        let pipeline = self.pipeline();
        let mut seek = shared.seek.lock();
        let role = self.role();
        match role {
            PlaybackRole::Offline => {
                if let Some(pipeline) = pipeline {
                    pipeline.seek_to(target_us);
                }
                return;
            }
            PlaybackRole::Producer => seek.pending_ack = Some(target_us),
            PlaybackRole::Consumer => seek.awaiting_ack = Some(target_us),
        }
        let purged = shared.purge_packets();
        if let Some(pipeline) = pipeline {
            pipeline.seek_to(target_us);
        }
        // SEEK goes out before the pump can acknowledge it
        shared.send_control(MessageKind::Seek, encode_timestamp(target_us));
        drop(seek);
        tracing::info!(?role, target_us, purged, "seek sent");
    }

    /// The consumer reported that it is buffering
    pub fn remote_buffering(&self) -> bool {
        self.shared.remote_buffering.load(Ordering::SeqCst)
    }

    pub fn awaiting_seek_ack(&self) -> bool {
        self.shared.seek.lock().awaiting_ack.is_some()
    }

    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    pub fn poll_event(&self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    pub fn stats(&self) -> SessionStats {
        let shared = &self.shared;
        let c = &shared.counters;
        SessionStats {
            role: self.role(),
            peer: self.peer(),
            connected_at: shared.connected_at,
            handshake_complete: self.handshake_complete(),
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_injected: c.packets_injected.load(Ordering::Relaxed),
            packets_discarded: c.packets_discarded.load(Ordering::Relaxed),
            bytes_in_flight: shared.flow.lock().in_flight(),
            send_queue_len: shared.send_queue.lock().len(),
            remote_buffering: self.remote_buffering(),
            transport: shared.transport.stats(),
        }
    }

    /// Stop the pump and close the connection
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        // unblocks a pump stuck in a socket write
        self.shared.transport.shutdown();
        let handle = self.pump.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("session pump panicked");
            }
        }
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn role(&self) -> PlaybackRole {
        *self.role.lock()
    }

    fn pipeline(&self) -> Option<Arc<DecodePipeline>> {
        self.pipeline.read().clone()
    }

    fn emit(&self, event: SessionEvent) {
        // the receiver lives as long as the session handle
        let _ = self.events.send(event);
    }

    fn run(self: Arc<Self>) {
        let role = self.role();
        if role == PlaybackRole::Producer && !self.send_handshake() {
            tracing::warn!("handshake could not be sent");
        }
        let poll = self.config.poll_interval();
        let position_interval = self.config.position_interval();
        let mut last_position: Option<Instant> = None;

        while !self.stop.load(Ordering::SeqCst) {
            // drain what arrived before the link dropped
            if self.link_lost.load(Ordering::SeqCst) && self.transport.inbound_len() == 0 {
                self.handle_disconnect();
                break;
            }

            let wait = if self.has_sendable() { Duration::ZERO } else { poll };
            if let Some(message) = self.transport.recv_timeout(wait) {
                self.handle_inbound(message);
                for _ in 1..MAX_INBOUND_PER_TICK {
                    let Some(message) = self.transport.try_recv() else { break };
                    self.handle_inbound(message);
                }
            }

            match self.role() {
                PlaybackRole::Producer => {
                    self.service_producer();
                    if last_position.map_or(true, |at| at.elapsed() >= position_interval) {
                        self.send_position();
                        last_position = Some(Instant::now());
                    }
                }
                PlaybackRole::Consumer => self.report_buffering(),
                PlaybackRole::Offline => {}
            }
        }
        tracing::debug!("session pump exiting");
    }

    fn send_handshake(&self) -> bool {
        let Some(remote) = &self.remote else { return false };
        let batch = match handshake_batch(remote) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("failed to encode handshake: {}", e);
                return false;
            }
        };
        let bytes: u64 = batch.iter().map(|(_, payload)| payload.len() as u64).sum();
        self.flow.lock().force_reserve(bytes);
        if !self.transport.send_batch(&batch) {
            return false;
        }
        self.counters.messages_sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.handshake_complete.store(true, Ordering::SeqCst);
        tracing::info!(bytes, "handshake sent");

        if self.pipeline().is_some_and(|p| p.clock().is_playing()) {
            self.send_control(MessageKind::Play, Bytes::new());
        }
        true
    }

    /// Send a message that is never held back by the flow window
    fn send_control(&self, kind: MessageKind, payload: Bytes) -> bool {
        if kind != MessageKind::ByteAck {
            self.flow.lock().force_reserve(payload.len() as u64);
        }
        let sent = self.transport.send(&payload, kind);
        if sent {
            self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    fn handle_inbound(&self, message: WireMessage) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        if message.kind != MessageKind::ByteAck {
            self.send_control(MessageKind::ByteAck, encode_byte_ack(message.len() as u64));
        }

        let result = match message.kind {
            MessageKind::ByteAck => decode_byte_ack(&message.payload).map(|bytes| self.flow.lock().confirm(bytes)),
            MessageKind::CompressedPacket => {
                self.on_packet(&message.payload);
                Ok(())
            }
            MessageKind::CodecParams => {
                CodecParamsMessage::decode(&message.payload).map(|m| self.on_handshake(|h| h.apply_codec_params(m)))
            }
            MessageKind::Metadata => {
                StreamMetadata::decode(&message.payload).map(|m| self.on_handshake(|h| h.apply_metadata(m)))
            }
            MessageKind::Play => {
                if let Some(pipeline) = self.pipeline() {
                    pipeline.clock().play();
                }
                self.emit(SessionEvent::RemotePlay);
                Ok(())
            }
            MessageKind::Pause => {
                if let Some(pipeline) = self.pipeline() {
                    pipeline.clock().pause();
                }
                self.emit(SessionEvent::RemotePause);
                Ok(())
            }
            MessageKind::Seek => decode_timestamp(&message.payload).map(|target| self.on_remote_seek(target)),
            MessageKind::SeekAck => decode_timestamp(&message.payload).map(|target| self.on_seek_ack(target)),
            MessageKind::BufferingStart | MessageKind::BufferingEnd => {
                let buffering = message.kind == MessageKind::BufferingStart;
                self.remote_buffering.store(buffering, Ordering::SeqCst);
                tracing::debug!(buffering, "peer buffering changed");
                Ok(())
            }
            MessageKind::Position => decode_timestamp(&message.payload).map(|position| {
                if self.role() != PlaybackRole::Consumer {
                    return;
                }
                // positions sent before the producer saw our seek are stale
                let seek = self.seek.lock();
                if let Some(target) = seek.awaiting_ack {
                    tracing::trace!(position, target, "ignoring POSITION before SEEK_ACK");
                    return;
                }
                if let Some(pipeline) = self.pipeline() {
                    pipeline.clock().set(position);
                }
            }),
            MessageKind::Custom(tag) => {
                tracing::debug!(tag, len = message.len(), "ignoring custom message");
                Ok(())
            }
        };

        if let Err(e) = result {
            tracing::warn!(kind = ?message.kind, "bad payload: {}", e);
        }
    }

    fn on_packet(&self, payload: &[u8]) {
        let seek = self.seek.lock();
        if seek.awaiting_ack.is_some() {
            self.counters.packets_discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("discarding packet received before SEEK_ACK");
            return;
        }
        let Some(pipeline) = self.pipeline() else {
            tracing::debug!("discarding packet received before the handshake");
            return;
        };
        let packet = match CompressedPacket::decode(payload) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("bad packet payload: {}", e);
                return;
            }
        };
        match pipeline.inject_packet(packet) {
            Ok(()) => {
                self.counters.packets_injected.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::debug!("packet not injected: {}", e),
        }
        drop(seek);
    }

    fn on_handshake(&self, apply: impl FnOnce(&mut Handshake)) {
        if self.role() != PlaybackRole::Consumer || self.handshake_complete.load(Ordering::SeqCst) {
            return;
        }
        let remote = {
            let mut handshake = self.handshake.lock();
            apply(&mut handshake);
            handshake.remote_media()
        };
        let Some(remote) = remote else { return };

        match self.build_consumer_pipeline(&remote) {
            Ok(pipeline) => {
                *self.pipeline.write() = Some(pipeline);
                self.handshake_complete.store(true, Ordering::SeqCst);
                tracing::info!(duration_us = remote.metadata.duration_us, "handshake complete");
                self.emit(SessionEvent::HandshakeComplete);
            }
            Err(e) => {
                tracing::error!("cannot play remote media: {}", e);
                self.transport.shutdown();
            }
        }
    }

    fn build_consumer_pipeline(&self, remote: &RemoteMedia) -> crate::Result<Arc<DecodePipeline>> {
        let Some(setup) = &self.consumer else {
            return Err(PipelineError::WrongRole { expected: PlaybackRole::Consumer, actual: self.role() }.into());
        };
        let catalog = Catalog::from_remote(Arc::clone(&setup.backend), remote)?;
        let pipeline = Arc::new(DecodePipeline::new(PlaybackRole::Consumer, &catalog, setup.pipeline_config.clone())?);
        pipeline.start()?;
        Ok(pipeline)
    }

    fn on_remote_seek(&self, target_us: i64) {
        let role = self.role();
        let mut seek = self.seek.lock();
        match role {
            PlaybackRole::Producer => seek.pending_ack = Some(target_us),
            PlaybackRole::Consumer => seek.awaiting_ack = Some(target_us),
            PlaybackRole::Offline => return,
        }
        let purged = self.purge_packets();
        if let Some(pipeline) = self.pipeline() {
            pipeline.seek_to(target_us);
        }
        drop(seek);
        tracing::info!(?role, target_us, purged, "peer requested seek");
        self.emit(SessionEvent::RemoteSeek(target_us));
    }

    fn on_seek_ack(&self, target_us: i64) {
        let mut seek = self.seek.lock();
        if seek.awaiting_ack == Some(target_us) {
            seek.awaiting_ack = None;
            tracing::debug!(target_us, "seek acknowledged");
        } else {
            tracing::debug!(target_us, expected = ?seek.awaiting_ack, "ignoring stale SEEK_ACK");
        }
    }

    /// Drop queued but unsent packets
    fn purge_packets(&self) -> usize {
        let mut queue = self.send_queue.lock();
        let before = queue.len();
        queue.retain(|m| !m.kind.is_media());
        before - queue.len()
    }

    fn has_sendable(&self) -> bool {
        let queue = self.send_queue.lock();
        queue.front().is_some_and(|m| self.flow.lock().can_send(m.len() as u64))
    }

    /// Acknowledge a finished seek, then move packets from the pipeline into the window
    fn service_producer(&self) {
        let Some(pipeline) = self.pipeline() else { return };
        {
            let mut seek = self.seek.lock();
            if let Some(target) = seek.pending_ack {
                if pipeline.flushing() {
                    return;
                }
                self.send_control(MessageKind::SeekAck, encode_timestamp(target));
                seek.pending_ack = None;
                tracing::debug!(target, "seek acknowledged to peer");
            }
            self.refill(&pipeline);
        }
        self.flush_send_queue();
    }

    fn refill(&self, pipeline: &DecodePipeline) {
        let mut queue = self.send_queue.lock();
        let room = self.config.refill_batch.saturating_sub(queue.len());
        if room == 0 {
            return;
        }
        let peer = self.transport.peer();
        for packet in pipeline.drain_outbound(room) {
            match packet.encode() {
                Ok(payload) => queue.push_back(WireMessage::new(MessageKind::CompressedPacket, payload, peer)),
                Err(e) => tracing::warn!(stream = packet.stream_index, "cannot encode packet: {}", e),
            }
        }
    }

    fn flush_send_queue(&self) {
        loop {
            let message = {
                let mut queue = self.send_queue.lock();
                let Some(front) = queue.front() else { return };
                if !self.flow.lock().try_reserve(front.len() as u64) {
                    return;
                }
                match queue.pop_front() {
                    Some(message) => message,
                    None => return,
                }
            };
            if !self.transport.send(&message.payload, message.kind) {
                return;
            }
            self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn send_position(&self) {
        if let Some(pipeline) = self.pipeline() {
            self.send_control(MessageKind::Position, encode_timestamp(pipeline.clock().now_us()));
        }
    }

    fn report_buffering(&self) {
        let Some(pipeline) = self.pipeline() else { return };
        let buffering = pipeline.buffering();
        if self.reported_buffering.swap(buffering, Ordering::SeqCst) != buffering {
            let kind = if buffering { MessageKind::BufferingStart } else { MessageKind::BufferingEnd };
            self.send_control(kind, Bytes::new());
        }
    }

    fn handle_disconnect(&self) {
        let previous = std::mem::replace(&mut *self.role.lock(), PlaybackRole::Offline);
        let dropped = {
            let mut queue = self.send_queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        self.flow.lock().reset();
        *self.seek.lock() = SeekState::default();
        self.remote_buffering.store(false, Ordering::SeqCst);
        if let Some(pipeline) = self.pipeline() {
            pipeline.disable_outbound();
        }
        tracing::info!(?previous, dropped, "peer disconnected, continuing offline");
        self.emit(SessionEvent::Disconnected);
    }
}

fn role_name(role: PlaybackRole) -> &'static str {
    match role {
        PlaybackRole::Offline => "offline",
        PlaybackRole::Producer => "producer",
        PlaybackRole::Consumer => "consumer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testsrc::{packets_for, TestPattern, TestPatternDemuxer};
    use crate::codec::{Demuxer, MediaSource, TestPatternBackend};
    use crate::config::{CatalogConfig, NetworkConfig};
    use crate::media::{Rational, US_PER_SEC};
    use crate::network::transport::listen;

    fn pattern() -> TestPattern {
        TestPattern::new(10 * US_PER_SEC).with_video(32, 16, 30).with_audio(48_000, 2, 1600)
    }

    fn backend() -> Arc<TestPatternBackend> {
        let backend = TestPatternBackend::shared();
        backend.register("clip", pattern());
        backend
    }

    fn catalog(backend: Arc<TestPatternBackend>) -> Catalog {
        Catalog::open(backend, MediaSource::Named("clip".into()), &CatalogConfig::default()).unwrap()
    }

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig { packet_queue_capacity: 32, poll_interval_ms: 2, ..PipelineConfig::default() }
    }

    fn session_config() -> SessionConfig {
        SessionConfig { poll_interval_ms: 2, ..SessionConfig::default() }
    }

    /// Connected transports over loopback: (producer side, consumer side)
    fn transports() -> (Arc<PacketTransport>, Arc<PacketTransport>) {
        let cfg = NetworkConfig::default();
        let listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn({
            let cfg = cfg.clone();
            move || PacketTransport::accept(&listener, &cfg, None).unwrap()
        });
        let consumer = PacketTransport::connect(addr, &cfg, None).unwrap();
        (Arc::new(accept.join().unwrap()), Arc::new(consumer))
    }

    fn producer_session(transport: Arc<PacketTransport>, config: SessionConfig) -> StreamingSession {
        let catalog = catalog(backend());
        let pipeline = Arc::new(DecodePipeline::new(PlaybackRole::Producer, &catalog, pipeline_config()).unwrap());
        pipeline.start().unwrap();
        StreamingSession::producer(transport, pipeline, catalog.remote_media(), config).unwrap()
    }

    fn consumer_session(transport: Arc<PacketTransport>) -> StreamingSession {
        StreamingSession::consumer(transport, backend(), pipeline_config(), session_config()).unwrap()
    }

    fn wait_event(session: &StreamingSession, wanted: SessionEvent) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match session.events().recv_timeout(left) {
                Ok(event) if event == wanted => return,
                Ok(_) => continue,
                Err(_) => panic!("timed out waiting for {:?}", wanted),
            }
        }
    }

    fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Next message of `kind` from a raw transport, skipping everything else
    fn next_of(transport: &PacketTransport, kind: MessageKind) -> WireMessage {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            assert!(Instant::now() < deadline, "timed out waiting for {:?}", kind);
            if let Some(message) = transport.recv_timeout(Duration::from_millis(10)) {
                if message.kind == kind {
                    return message;
                }
            }
        }
    }

    fn send_packets(transport: &PacketTransport, packets: impl IntoIterator<Item = CompressedPacket>) -> usize {
        let mut sent = 0;
        for packet in packets {
            assert!(transport.send(&packet.encode().unwrap(), MessageKind::CompressedPacket));
            sent += 1;
        }
        sent
    }

    #[test]
    fn test_handshake_presence_checks() {
        let remote = catalog(backend()).remote_media();
        let mut handshake = Handshake::default();
        assert!(!handshake.metadata_received());

        handshake.apply_codec_params(CodecParamsMessage {
            kind: MediaKind::Video,
            stream_index: 0,
            params: remote.video.clone().map(|(_, p)| p),
        });
        handshake.apply_metadata(remote.metadata);
        assert!(!handshake.metadata_received());

        // an absent audio stream still counts as received
        handshake.apply_codec_params(CodecParamsMessage { kind: MediaKind::Audio, stream_index: 0, params: None });
        assert!(handshake.metadata_received());
        assert!(handshake.remote_media().unwrap().audio.is_none());

        let mut broken = handshake.clone();
        broken.apply_metadata(StreamMetadata { video_time_base: Rational::new(0, 0), ..remote.metadata });
        assert!(!broken.metadata_received());
    }

    #[test]
    fn test_handshake_builds_consumer_pipeline() {
        let (producer_side, consumer_side) = transports();
        let producer = producer_session(producer_side, session_config());
        let consumer = consumer_session(consumer_side);

        wait_event(&consumer, SessionEvent::HandshakeComplete);
        let pipeline = consumer.pipeline().expect("consumer pipeline");
        assert_eq!(pipeline.role(), PlaybackRole::Consumer);
        assert_eq!(pipeline.duration_us(), Some(10 * US_PER_SEC));

        wait_for("remote frames", || pipeline.peek_video_timestamp().is_some());
        assert!(consumer.stats().packets_injected > 0);
        assert!(producer.stats().packets_sent > 0);
        assert_eq!(producer.role(), PlaybackRole::Producer);
    }

    #[test]
    fn test_packets_before_seek_ack_are_discarded() {
        let (raw, consumer_side) = transports();
        let consumer = consumer_session(consumer_side);

        let remote = catalog(backend()).remote_media();
        assert!(raw.send_batch(&handshake_batch(&remote).unwrap()));
        wait_event(&consumer, SessionEvent::HandshakeComplete);
        let pipeline = consumer.pipeline().unwrap();

        let pre_seek = packets_for(&pattern());
        send_packets(&raw, pre_seek.iter().take(10).cloned());
        wait_for("pre-seek packets", || consumer.stats().packets_injected == 10);

        consumer.seek_to(5_000_000);
        assert!(consumer.awaiting_seek_ack());
        let seek = next_of(&raw, MessageKind::Seek);
        assert_eq!(decode_timestamp(&seek.payload).unwrap(), 5_000_000);

        // in flight before the producer saw the seek
        let stale = send_packets(&raw, pre_seek.iter().skip(10).take(10).cloned());
        assert!(raw.send(&encode_timestamp(5_000_000), MessageKind::SeekAck));

        let mut demuxer = TestPatternDemuxer::new(pattern());
        demuxer.seek(5_000_000).unwrap();
        let post_seek: Vec<_> = (0..20).filter_map(|_| demuxer.read_packet().unwrap()).collect();
        send_packets(&raw, post_seek);

        wait_for("post-seek frames", || !consumer.awaiting_seek_ack() && pipeline.stats().video_frames_queued >= 10);
        assert_eq!(consumer.stats().packets_discarded, stale as u64);

        let mut timestamps = Vec::new();
        while let Some(frame) = pipeline.pop_video_frame() {
            timestamps.push(frame.timestamp_us);
        }
        assert_eq!(timestamps.first(), Some(&5_000_000));
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_position_ignored_until_seek_ack() {
        let (raw, consumer_side) = transports();
        let consumer = consumer_session(consumer_side);

        let remote = catalog(backend()).remote_media();
        assert!(raw.send_batch(&handshake_batch(&remote).unwrap()));
        wait_event(&consumer, SessionEvent::HandshakeComplete);
        let clock = consumer.pipeline().unwrap().clock().clone();

        consumer.seek_to(5_000_000);
        next_of(&raw, MessageKind::Seek);
        assert_eq!(clock.now_us(), 5_000_000);

        // the buffering notice only shows the POSITION ahead of it was handled
        assert!(raw.send(&encode_timestamp(1_000_000), MessageKind::Position));
        assert!(raw.send(&[], MessageKind::BufferingStart));
        wait_for("buffering notice", || consumer.remote_buffering());
        assert_eq!(clock.now_us(), 5_000_000);

        assert!(raw.send(&encode_timestamp(5_000_000), MessageKind::SeekAck));
        assert!(raw.send(&encode_timestamp(6_000_000), MessageKind::Position));
        wait_for("position applied", || clock.now_us() == 6_000_000);
        assert!(!consumer.awaiting_seek_ack());
    }

    #[test]
    fn test_flow_window_bounds_unacknowledged_bytes() {
        let (producer_side, raw) = transports();
        let window = 4096;
        let producer = producer_session(producer_side, SessionConfig { flow_window_bytes: window, ..session_config() });

        // never acknowledge anything: the producer must stop within the window
        thread::sleep(Duration::from_millis(200));
        let mut packet_bytes = 0u64;
        let mut packets = 0;
        while let Some(message) = raw.try_recv() {
            if message.kind == MessageKind::CompressedPacket {
                packet_bytes += message.len() as u64;
                packets += 1;
            }
        }
        assert!(packets > 0);
        // control messages are counted but not held back; only data is bounded
        assert!(packet_bytes <= window, "{} packet bytes unacknowledged", packet_bytes);
        assert!(producer.stats().send_queue_len > 0);

        // acknowledging reopens the window
        assert!(raw.send(&encode_byte_ack(producer.stats().bytes_in_flight), MessageKind::ByteAck));
        next_of(&raw, MessageKind::CompressedPacket);
    }

    #[test]
    fn test_play_pause_are_echoed() {
        let (producer_side, consumer_side) = transports();
        let producer = producer_session(producer_side, session_config());
        let consumer = consumer_session(consumer_side);
        wait_event(&consumer, SessionEvent::HandshakeComplete);

        consumer.play();
        wait_event(&producer, SessionEvent::RemotePlay);
        assert!(producer.pipeline().unwrap().clock().is_playing());

        producer.pause();
        wait_event(&consumer, SessionEvent::RemotePause);
        assert!(!consumer.pipeline().unwrap().clock().is_playing());
    }

    #[test]
    fn test_producer_seek_is_acknowledged() {
        let (producer_side, raw) = transports();
        let producer = producer_session(producer_side, session_config());
        next_of(&raw, MessageKind::Metadata);

        producer.seek_to(3_000_000);
        let seek = next_of(&raw, MessageKind::Seek);
        assert_eq!(decode_timestamp(&seek.payload).unwrap(), 3_000_000);
        let ack = next_of(&raw, MessageKind::SeekAck);
        assert_eq!(decode_timestamp(&ack.payload).unwrap(), 3_000_000);

        // acknowledge everything so post-seek packets flow
        assert!(raw.send(&encode_byte_ack(u64::MAX / 2), MessageKind::ByteAck));
        let packet = CompressedPacket::decode(&next_of(&raw, MessageKind::CompressedPacket).payload).unwrap();
        let time_base = if packet.kind == MediaKind::Video { Rational::MICROS } else { Rational::new(1, 48_000) };
        assert!(time_base.to_micros(packet.timestamp().unwrap()) >= 3_000_000);
    }

    #[test]
    fn test_disconnect_falls_back_to_offline() {
        let (producer_side, consumer_side) = transports();
        let producer = producer_session(producer_side, session_config());

        consumer_side.shutdown();
        wait_event(&producer, SessionEvent::Disconnected);
        assert_eq!(producer.role(), PlaybackRole::Offline);
        let pipeline = producer.pipeline().unwrap();
        assert!(!pipeline.mirroring());
        assert_eq!(pipeline.outbound_len(), 0);
        assert_eq!(producer.stats().send_queue_len, 0);
    }
}
