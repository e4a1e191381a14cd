//! Session configuration.
//!
//! A `Config` is a plain value the host constructs once per session (or shares across sessions
//! with identical link parameters). There is no file or CLI loading here — that's a host-level
//! concern.

use crate::frame::Modulus;
use crate::time::Duration;

/// Tunable parameters for a [`crate::session::Session`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Sequence-number modulus negotiated for this session (SABM selects modulo-8, SABME selects
    /// modulo-128).
    pub modulus: Modulus,
    /// Maximum number of unacknowledged I-frames in flight (the sliding window), default 4.
    pub max_frames: u8,
    /// Number of retransmit attempts for T1 before declaring link failure, default 3.
    pub retries: u8,
    /// Maximum I-frame information field size in bytes; outbound `send()` data is split into
    /// chunks no larger than this. 128 for classical AX.25, 256 is common with modulo-128.
    pub packet_length: usize,
    /// Whether to answer out-of-sequence frames with SREJ (selective reject) instead of REJ.
    /// A conforming peer may always use REJ instead; this defaults to `false`.
    pub use_srej: bool,
    /// Whether to generate FRMR frames for sequence errors and unknown control fields. Defaults
    /// to `false` (silent drop).
    pub send_frmr: bool,
    /// Base packet transmission time, used to derive default T1/T2/T3 durations.
    pub packet_time: Duration,
    /// T2 (delayed ACK) duration. Must stay below `t1_base`.
    pub t2: Duration,
    /// T1 (retry) base duration, before the per-unacked-frame backoff term is added.
    pub t1_base: Duration,
    /// T3 (idle poll) duration. Must stay above `t1_base`.
    pub t3: Duration,
    /// Number of consecutive T3 expiries tolerated before the session initiates a graceful
    /// disconnect.
    pub t3_retries: u8,
}

impl Config {
    /// Derives a T1 duration from `t1_base`, scaled by hop count and backed off by how many
    /// frames are currently unacked.
    pub fn t1_for_hops_and_unacked(&self, hops: u8, unacked: u8) -> Duration {
        let hop_factor = hops.max(1) as u32;
        let base_ticks = self.t1_base.ticks().saturating_mul(hop_factor);
        let backoff_ticks = self
            .packet_time
            .ticks()
            .saturating_mul(2)
            .saturating_mul(unacked as u32);
        Duration::from_ticks(base_ticks.saturating_add(backoff_ticks))
    }
}

impl Default for Config {
    fn default() -> Self {
        let packet_time = crate::time::DEFAULT_PACKET_TIME;
        let pt = packet_time.ticks();
        Self {
            modulus: Modulus::Eight,
            max_frames: 4,
            retries: 3,
            packet_length: 128,
            use_srej: false,
            send_frmr: false,
            packet_time,
            t2: Duration::from_ticks(pt.saturating_mul(3)),
            t1_base: Duration::from_ticks(pt.saturating_mul(6)),
            t3: Duration::from_ticks(pt.saturating_mul(6).saturating_mul(7)),
            t3_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ordering_holds_t2_lt_t1_lt_t3() {
        let c = Config::default();
        assert!(c.t2 < c.t1_base);
        assert!(c.t1_base < c.t3);
    }

    #[test]
    fn t1_backoff_grows_with_unacked_count() {
        let c = Config::default();
        let a = c.t1_for_hops_and_unacked(1, 0);
        let b = c.t1_for_hops_and_unacked(1, 3);
        assert!(b > a);
    }

    #[test]
    fn t1_base_actually_scales_t1_duration() {
        let mut c = Config::default();
        let default_t1 = c.t1_for_hops_and_unacked(1, 0);
        c.t1_base = Duration::from_ticks(c.t1_base.ticks() * 2);
        let doubled_t1 = c.t1_for_hops_and_unacked(1, 0);
        assert!(doubled_t1 > default_t1);
    }
}
