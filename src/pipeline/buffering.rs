//! Buffering readiness with a two-watermark hysteresis band
//!
//! Enter buffering when any stream has less than the low watermark queued
//! ahead of the clock; leave only once every stream has at least the high
//! watermark. A stream with nothing queued counts as buffering.

/// Hysteresis state machine over per-stream buffered-ahead durations
#[derive(Debug, Clone)]
pub struct BufferingTracker {
    low_us: i64,
    high_us: i64,
    buffering: bool,
}

impl BufferingTracker {
    pub fn new(low_us: i64, high_us: i64) -> Self {
        Self { low_us, high_us: high_us.max(low_us), buffering: false }
    }

    /// Feed the current lead of every selected stream (`None` = no data queued)
    pub fn update(&mut self, leads: &[Option<i64>]) -> bool {
        if leads.iter().any(Option::is_none) {
            self.buffering = true;
            return true;
        }
        let leads = leads.iter().flatten();
        if self.buffering {
            if leads.into_iter().all(|lead| *lead >= self.high_us) {
                self.buffering = false;
            }
        } else if leads.into_iter().any(|lead| *lead < self.low_us) {
            self.buffering = true;
        }
        self.buffering
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Force a state, e.g. after end of stream
    pub fn reset(&mut self, buffering: bool) {
        self.buffering = buffering;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: i64 = 1_000_000;

    fn tracker() -> BufferingTracker {
        BufferingTracker::new(S, 5 * S)
    }

    #[test]
    fn test_enters_below_low_watermark() {
        let mut t = tracker();
        assert!(!t.update(&[Some(3 * S), Some(3 * S)]));
        assert!(!t.update(&[Some(S), Some(3 * S)]));
        assert!(t.update(&[Some(S - 1), Some(3 * S)]));
    }

    #[test]
    fn test_exits_only_when_all_streams_reach_high_watermark() {
        let mut t = tracker();
        assert!(t.update(&[Some(0), Some(0)]));
        assert!(t.update(&[Some(6 * S), Some(4 * S)]));
        assert!(t.update(&[Some(5 * S - 1), Some(9 * S)]));
        assert!(!t.update(&[Some(5 * S), Some(5 * S)]));
    }

    #[test]
    fn test_oscillation_inside_band_never_toggles() {
        let mut t = tracker();
        assert!(t.update(&[Some(S / 2), Some(S / 2)]));
        for step in 0..100 {
            let lead = if step % 2 == 0 { 2 * S } else { 4 * S };
            assert!(t.update(&[Some(lead), Some(6 * S - lead)]));
        }

        // and the same band never engages buffering from the other side
        let mut t = tracker();
        for step in 0..100 {
            let lead = if step % 2 == 0 { 2 * S } else { 4 * S };
            assert!(!t.update(&[Some(lead), Some(lead)]));
        }
    }

    #[test]
    fn test_missing_stream_data_forces_buffering() {
        let mut t = tracker();
        assert!(t.update(&[Some(10 * S), None]));
        assert!(!t.update(&[Some(10 * S), Some(10 * S)]));
    }

    #[test]
    fn test_synthetic_timeline() {
        // lead drains from 3s to 0, then refills to 6s
        let mut t = tracker();
        let mut transitions = Vec::new();
        let mut last = false;
        let timeline = (0..=30).rev().chain(0..=60).map(|tenths| tenths as i64 * S / 10);
        for lead in timeline {
            let now = t.update(&[Some(lead), Some(lead + S)]);
            if now != last {
                transitions.push((lead, now));
                last = now;
            }
        }
        assert_eq!(transitions, vec![(9 * S / 10, true), (5 * S, false)]);
    }
}
