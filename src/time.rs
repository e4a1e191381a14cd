//! Time APIs for obtaining the current time and calculating with points in time and durations.
//!
//! These APIs are made for the AX.25 data-link engine and are not meant to be general-purpose.
//! The APIs here have millisecond resolution and use 32-bit arithmetic wherever possible, which
//! gives about 49.7 days before wraparound — enough range for T1/T2/T3 timers that run from
//! hundreds of milliseconds to several minutes.

use fugit;

// Export aliases for fugit types
pub type Instant = fugit::Instant::<u32, 1, 1_000>;
pub type Duration = fugit::Duration<u32, 1, 1_000>;

/// A reasonable default packet time for a 1200 baud, 128-byte-payload AX.25 frame, including
/// address/control/PID overhead and a 1.5x slack factor. Used to derive default T1/T2/T3
/// constants when a host does not override them via [`crate::config::Config`].
pub const DEFAULT_PACKET_TIME: Duration = Duration::millis(1200);

/// Trait for time providers.
///
/// The host has to provide an implementation of `Timer` to the engine. The implementation must
/// have millisecond accuracy.
///
/// This trait can also be implemented by a mock timer for testing (see [`crate::sim::MockTimer`]).
pub trait Timer {
    /// Obtain the current time as an [`Instant`].
    ///
    /// The [`Instant`]s returned by this function must never move backwards in time, except when
    /// the underlying value wraps around.
    fn now(&self) -> Instant;
}
