//! Per-stream decode thread

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{ControlState, PipelineCounters, StreamChannel};
use crate::codec::Decoder;
use crate::media::{CompressedPacket, MediaKind};
use crate::queue::PushOutcome;

pub(super) struct DecodeWorker {
    channel: Arc<StreamChannel>,
    decoder: Box<dyn Decoder>,
    control: Arc<ControlState>,
    counters: Arc<PipelineCounters>,
    poll: Duration,
}

impl DecodeWorker {
    pub(super) fn new(
        channel: Arc<StreamChannel>,
        decoder: Box<dyn Decoder>,
        control: Arc<ControlState>,
        counters: Arc<PipelineCounters>,
        poll: Duration,
    ) -> Self {
        Self { channel, decoder, control, counters, poll }
    }

    pub(super) fn kind(&self) -> MediaKind {
        self.channel.descriptor.kind
    }

    pub(super) fn run(mut self) {
        let kind = self.kind();
        tracing::debug!(%kind, "decode worker running");

        while !self.control.is_stopped() {
            if self.control.flush_requested(kind) {
                self.flush();
                continue;
            }
            let Some(packet) = self.channel.packets.pop_timeout(self.poll) else {
                continue;
            };
            self.decode(&packet);
        }

        tracing::debug!(%kind, "decode worker exiting");
    }

    fn flush(&mut self) {
        let kind = self.kind();
        self.decoder.flush();
        let dropped = self.channel.frames.clear();
        self.control.acknowledge_flush(kind);
        tracing::debug!(%kind, dropped, "decoder flushed");
    }

    fn decode(&mut self, packet: &CompressedPacket) {
        let kind = self.kind();
        if let Err(e) = self.decoder.send_packet(packet) {
            self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%kind, pts = ?packet.pts, "skipping packet: {}", e);
            return;
        }
        self.counters.packets_decoded.fetch_add(1, Ordering::Relaxed);

        loop {
            match self.decoder.receive_frame() {
                Ok(Some(frame)) => {
                    let control = &self.control;
                    let outcome = self.channel.frames.push_wait(frame, self.poll, || {
                        control.is_stopped() || control.flush_requested(kind)
                    });
                    if outcome == PushOutcome::Cancelled {
                        return;
                    }
                    self.counters.frame_produced(kind);
                }
                Ok(None) => return,
                Err(e) => {
                    self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(%kind, pts = ?packet.pts, "decoder failed: {}", e);
                    return;
                }
            }
        }
    }
}
