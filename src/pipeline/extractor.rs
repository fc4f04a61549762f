//! Packet extraction thread

use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{ControlState, PipelineCounters, StreamChannel};
use crate::codec::Demuxer;
use crate::media::CompressedPacket;
use crate::queue::{PushOutcome, SharedQueue};

/// Reads the container and feeds the per-stream packet queues
pub(super) struct Extractor {
    demuxer: Box<dyn Demuxer>,
    channels: Vec<Arc<StreamChannel>>,
    outbound: Arc<SharedQueue<CompressedPacket>>,
    mirror: Arc<AtomicBool>,
    control: Arc<ControlState>,
    counters: Arc<PipelineCounters>,
    poll: Duration,
}

impl Extractor {
    pub(super) fn new(
        demuxer: Box<dyn Demuxer>,
        channels: Vec<Arc<StreamChannel>>,
        outbound: Arc<SharedQueue<CompressedPacket>>,
        mirror: Arc<AtomicBool>,
        control: Arc<ControlState>,
        counters: Arc<PipelineCounters>,
        poll: Duration,
    ) -> Self {
        Self { demuxer, channels, outbound, mirror, control, counters, poll }
    }

    pub(super) fn run(mut self) {
        tracing::debug!("packet extractor running");

        while !self.control.is_stopped() {
            if let Some(target) = self.control.seek_target() {
                self.seek(target);
                continue;
            }
            if self.control.eof() {
                thread::sleep(self.poll);
                continue;
            }

            match self.demuxer.read_packet() {
                Ok(Some(packet)) => {
                    self.counters.packets_read.fetch_add(1, Ordering::Relaxed);
                    self.route(packet);
                }
                Ok(None) => {
                    tracing::info!(packets = self.counters.packets_read.load(Ordering::Relaxed), "end of stream");
                    self.control.set_eof(true);
                }
                Err(e) => {
                    tracing::warn!("demuxer read failed, treating as end of stream: {}", e);
                    self.control.set_eof(true);
                }
            }
        }

        tracing::debug!("packet extractor exiting");
    }

    fn route(&self, packet: CompressedPacket) {
        let Some(channel) = self
            .channels
            .iter()
            .find(|c| c.descriptor.index == packet.stream_index && c.descriptor.kind == packet.kind)
        else {
            return;
        };

        let control = &self.control;
        let interrupted = || control.is_stopped() || control.seek_target().is_some();

        if self.mirror.load(Ordering::Relaxed) {
            let mirror = &self.mirror;
            let outcome = self
                .outbound
                .push_wait(packet.clone(), self.poll, || interrupted() || !mirror.load(Ordering::Relaxed));
            if outcome == PushOutcome::Cancelled && interrupted() {
                return;
            }
        }

        if channel.packets.push_wait(packet, self.poll, interrupted) == PushOutcome::Cancelled {
            tracing::trace!("packet dropped by stop or seek");
        }
    }

    /// Backward-keyframe seek followed by a flush of every downstream queue
    fn seek(&mut self, target_us: i64) {
        tracing::info!(target_us, "seeking");
        if let Err(e) = self.demuxer.seek(target_us) {
            tracing::warn!(target_us, "seek failed, continuing from current position: {}", e);
        }

        let mut dropped = self.outbound.clear();
        for channel in &self.channels {
            dropped += channel.packets.clear();
            self.control.request_flush(channel.descriptor.kind);
        }

        let backoff = Backoff::new();
        while self.control.any_flush_requested() && !self.control.is_stopped() {
            if backoff.is_completed() {
                thread::sleep(self.poll);
            } else {
                backoff.snooze();
            }
        }

        self.control.set_eof(false);
        self.counters.seeks.fetch_add(1, Ordering::Relaxed);
        if !self.control.complete_seek(target_us) {
            tracing::debug!(target_us, "seek superseded by a newer request");
        }
        tracing::debug!(target_us, dropped, "seek complete");
    }
}
