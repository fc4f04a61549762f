//! Byte-based flow window
//!
//! The receiver acknowledges every message with a BYTE_ACK carrying its
//! payload size. Control messages are counted in `sent - confirmed` but
//! never held back, so the bound that holds is on data: the data bytes in
//! flight stay within the window, except for a single oversize message
//! sent into an empty pipe. Total bytes in flight may briefly exceed the
//! window by the control messages sent meanwhile.

/// Sender-side accounting of unacknowledged bytes
#[derive(Debug, Clone)]
pub struct FlowWindow {
    window: u64,
    sent: u64,
    confirmed: u64,
}

impl FlowWindow {
    pub fn new(window: u64) -> Self {
        Self { window: window.max(1), sent: 0, confirmed: 0 }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn in_flight(&self) -> u64 {
        self.sent - self.confirmed
    }

    /// Whether a message of `size` bytes may go out now. A message larger
    /// than the whole window is allowed only once nothing is in flight.
    pub fn can_send(&self, size: u64) -> bool {
        let in_flight = self.in_flight();
        in_flight == 0 || in_flight.saturating_add(size) <= self.window
    }

    /// Account for a data message if the window allows it
    pub fn try_reserve(&mut self, size: u64) -> bool {
        if !self.can_send(size) {
            return false;
        }
        self.sent += size;
        true
    }

    /// Account for a control message, which is never held back
    pub fn force_reserve(&mut self, size: u64) {
        self.sent += size;
    }

    /// Apply a BYTE_ACK
    pub fn confirm(&mut self, bytes: u64) {
        self.confirmed = self.confirmed.saturating_add(bytes).min(self.sent);
    }

    pub fn reset(&mut self) {
        self.sent = 0;
        self.confirmed = 0;
    }
}
