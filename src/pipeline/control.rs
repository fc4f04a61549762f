//! Control flags shared between the pipeline owner and its worker threads

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::media::MediaKind;

const NO_SEEK: i64 = i64::MIN;

/// Typed stop / seek / flush / end-of-stream state
#[derive(Debug)]
pub struct ControlState {
    stop: AtomicBool,
    seek_target: AtomicI64,
    video_flush: AtomicBool,
    audio_flush: AtomicBool,
    eof: AtomicBool,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            seek_target: AtomicI64::new(NO_SEEK),
            video_flush: AtomicBool::new(false),
            audio_flush: AtomicBool::new(false),
            eof: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Request a seek; a newer request replaces a pending one
    pub fn request_seek(&self, target_us: i64) {
        // i64::MIN is the "none" sentinel
        self.seek_target.store(target_us.max(NO_SEEK + 1), Ordering::SeqCst);
    }

    pub fn seek_target(&self) -> Option<i64> {
        match self.seek_target.load(Ordering::SeqCst) {
            NO_SEEK => None,
            target => Some(target),
        }
    }

    /// Clear the pending seek only if it is still `target`, so a newer request survives
    pub fn complete_seek(&self, target_us: i64) -> bool {
        self.seek_target
            .compare_exchange(target_us, NO_SEEK, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn flush_flag(&self, kind: MediaKind) -> Option<&AtomicBool> {
        match kind {
            MediaKind::Video => Some(&self.video_flush),
            MediaKind::Audio => Some(&self.audio_flush),
            MediaKind::Subtitle => None,
        }
    }

    pub fn request_flush(&self, kind: MediaKind) {
        if let Some(flag) = self.flush_flag(kind) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn flush_requested(&self, kind: MediaKind) -> bool {
        self.flush_flag(kind).is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Called by a worker once its decoder and frame queue are reset
    pub fn acknowledge_flush(&self, kind: MediaKind) {
        if let Some(flag) = self.flush_flag(kind) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    pub fn any_flush_requested(&self) -> bool {
        self.video_flush.load(Ordering::SeqCst) || self.audio_flush.load(Ordering::SeqCst)
    }

    pub fn set_eof(&self, eof: bool) {
        self.eof.store(eof, Ordering::SeqCst);
    }

    pub fn eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_target_lifecycle() {
        let control = ControlState::new();
        assert_eq!(control.seek_target(), None);
        control.request_seek(5_000_000);
        assert_eq!(control.seek_target(), Some(5_000_000));

        // a newer request is not lost when the older one completes
        control.request_seek(7_000_000);
        assert!(!control.complete_seek(5_000_000));
        assert_eq!(control.seek_target(), Some(7_000_000));
        assert!(control.complete_seek(7_000_000));
        assert_eq!(control.seek_target(), None);
    }

    #[test]
    fn test_flush_flags_are_independent() {
        let control = ControlState::new();
        control.request_flush(MediaKind::Video);
        control.request_flush(MediaKind::Audio);
        control.acknowledge_flush(MediaKind::Audio);
        assert!(control.flush_requested(MediaKind::Video));
        assert!(!control.flush_requested(MediaKind::Audio));
        assert!(control.any_flush_requested());
        control.acknowledge_flush(MediaKind::Video);
        assert!(!control.any_flush_requested());
        assert!(!control.flush_requested(MediaKind::Subtitle));
    }
}
