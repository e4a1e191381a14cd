//! Test-support fakes: a manually-advanced [`MockTimer`] and an in-memory [`MockChannel`].
//!
//! Exercises the hardware-facing `Timer`/`Channel` traits against in-memory fakes rather than
//! real radios. Used by this crate's own unit tests and by the scenario tests under `tests/`.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::channel::Channel;
use crate::time::{Duration, Instant, Timer};

/// A clock that only advances when told to. Shared via `Rc<Cell<_>>` so a test can hold a handle
/// to advance it while a [`Session`](crate::session::Session) holds its own clone.
#[derive(Clone)]
pub struct MockTimer {
    now: Rc<Cell<Instant>>,
}

impl MockTimer {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::from_ticks(0))),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn set(&self, at: Instant) {
        self.now.set(at);
    }
}

impl Default for MockTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for MockTimer {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// An in-memory channel that records every submitted frame and can simulate being busy or
/// dropping frames, for exercising back-pressure and retry paths.
pub struct MockChannel {
    pub submitted: Vec<Vec<u8>>,
    pub free: bool,
    /// If `true`, the next `n` submissions are silently dropped (not recorded, not delivered) to
    /// simulate a transport that accepted a submission and then lost it.
    drop_next: usize,
    pub inbox: VecDeque<Vec<u8>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            submitted: Vec::new(),
            free: true,
            drop_next: 0,
            inbox: VecDeque::new(),
        }
    }

    pub fn set_busy(&mut self, busy: bool) {
        self.free = !busy;
    }

    pub fn drop_next_n(&mut self, n: usize) {
        self.drop_next = n;
    }

    /// Pops the next frame a test peer should process, if any.
    pub fn take_submitted(&mut self) -> Option<Vec<u8>> {
        if self.submitted.is_empty() {
            None
        } else {
            Some(self.submitted.remove(0))
        }
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MockChannel {
    fn submit(&mut self, frame_bytes: &[u8]) {
        if self.drop_next > 0 {
            self.drop_next -= 1;
            return;
        }
        self.submitted.push(frame_bytes.to_vec());
    }

    fn is_free(&self) -> bool {
        self.free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_timer_advances_monotonically() {
        let t = MockTimer::new();
        let a = t.now();
        t.advance(Duration::millis(100));
        let b = t.now();
        assert!(b > a);
    }

    #[test]
    fn mock_channel_honors_busy_flag() {
        let mut c = MockChannel::new();
        c.set_busy(true);
        assert!(!c.is_free());
        c.submit(&[1, 2, 3]);
        assert_eq!(c.submitted.len(), 1);
    }

    #[test]
    fn mock_channel_drops_as_requested() {
        let mut c = MockChannel::new();
        c.drop_next_n(1);
        c.submit(&[1]);
        c.submit(&[2]);
        assert_eq!(c.submitted, vec![vec![2]]);
    }
}
