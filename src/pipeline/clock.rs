//! Playback clock
//!
//! Advances with wall time while playing and not stalled. A consumer keeps
//! its clock slaved to the producer by syncing it on every POSITION echo.

use parking_lot::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct ClockState {
    /// Position at `anchor`
    base_us: i64,
    /// Set while the clock is running
    anchor: Option<Instant>,
    playing: bool,
    stalled: bool,
}

impl ClockState {
    fn now_us(&self) -> i64 {
        match self.anchor {
            Some(anchor) => self.base_us + anchor.elapsed().as_micros() as i64,
            None => self.base_us,
        }
    }

    fn rearm(&mut self) {
        let running = self.playing && !self.stalled;
        match (running, self.anchor) {
            (true, None) => self.anchor = Some(Instant::now()),
            (false, Some(_)) => {
                self.base_us = self.now_us();
                self.anchor = None;
            }
            _ => {}
        }
    }
}

/// Shared playback position in microseconds
#[derive(Debug)]
pub struct PlaybackClock {
    state: Mutex<ClockState>,
}

impl PlaybackClock {
    /// A paused clock at zero
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState { base_us: 0, anchor: None, playing: false, stalled: false }),
        }
    }

    pub fn now_us(&self) -> i64 {
        self.state.lock().now_us()
    }

    pub fn play(&self) {
        let mut state = self.state.lock();
        state.playing = true;
        state.rearm();
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        state.playing = false;
        state.rearm();
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// Hold the clock while buffering without changing the play/pause state
    pub fn set_stalled(&self, stalled: bool) {
        let mut state = self.state.lock();
        state.stalled = stalled;
        state.rearm();
    }

    pub fn is_stalled(&self) -> bool {
        self.state.lock().stalled
    }

    /// Jump to `position_us`, keeping the running state
    pub fn set(&self, position_us: i64) {
        let mut state = self.state.lock();
        state.base_us = position_us;
        if state.anchor.is_some() {
            state.anchor = Some(Instant::now());
        }
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_paused_clock_does_not_advance() {
        let clock = PlaybackClock::new();
        clock.set(1_000);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.now_us(), 1_000);
    }

    #[test]
    fn test_playing_clock_advances() {
        let clock = PlaybackClock::new();
        clock.play();
        thread::sleep(Duration::from_millis(20));
        assert!(clock.now_us() >= 20_000);
        clock.pause();
        let held = clock.now_us();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.now_us(), held);
    }

    #[test]
    fn test_stall_holds_position() {
        let clock = PlaybackClock::new();
        clock.play();
        clock.set_stalled(true);
        let held = clock.now_us();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(clock.now_us(), held);
        assert!(clock.is_playing());
        clock.set_stalled(false);
        thread::sleep(Duration::from_millis(10));
        assert!(clock.now_us() > held);
    }
}
