//! Single-fire timers with attempt counters.
//!
//! A timer's attempt counter is kept separate from the timer handle's lifetime: starting or
//! restarting a timer does not reset how many times it has already fired, because T1 retry
//! accounting must survive across retransmits. Only explicit progress (an ACK that advances
//! `va`, or a state transition) resets the counter.

use crate::time::{Duration, Instant};

/// A single-fire deadline with an attempt counter that outlives individual `start`/`stop` calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryTimer {
    deadline: Option<Instant>,
    attempts: u8,
}

impl RetryTimer {
    pub fn new() -> Self {
        Self {
            deadline: None,
            attempts: 0,
        }
    }

    /// Arms the timer for `duration` from `now`. Does not touch the attempt counter.
    pub fn start(&mut self, now: Instant, duration: Duration) {
        self.deadline = Some(now + duration);
    }

    /// Disarms the timer without consuming an attempt.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    pub fn increment_attempts(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Resets the attempt counter. Called on forward progress.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// If armed and `now` has reached the deadline, disarms the timer and returns `true`.
    /// The caller is responsible for incrementing `attempts` and re-arming if a retry follows.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_does_not_reset_attempts() {
        let mut t = RetryTimer::new();
        t.increment_attempts();
        t.increment_attempts();
        t.start(Instant::from_ticks(0), Duration::millis(10));
        assert_eq!(t.attempts(), 2);
    }

    #[test]
    fn poll_fires_once_at_deadline() {
        let mut t = RetryTimer::new();
        t.start(Instant::from_ticks(0), Duration::millis(10));
        assert!(!t.poll(Instant::from_ticks(5)));
        assert!(t.poll(Instant::from_ticks(10)));
        // Once fired, the timer is disarmed and won't fire again without a new start().
        assert!(!t.poll(Instant::from_ticks(20)));
    }
}
