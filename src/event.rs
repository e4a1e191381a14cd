//! Observable events surfaced to the host.
//!
//! The engine is a pure event transducer: it never calls back into host code directly. Instead,
//! each host-visible API call and each [`crate::session::Session::poll`] returns a list of
//! [`Event`]s for the host to act on. This keeps the core single-threaded-cooperative without
//! requiring a callback/trait-object surface the way an interrupt-driven embedded host would
//! need.

use crate::session::State;

/// Something the host should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The session moved to a new state.
    StateChanged(State),
    /// In-order bytes of application payload are ready; delivered in the exact concatenation
    /// order the peer's `send()` calls produced.
    DataReceived(Vec<u8>),
    /// The peer answered a `TEST` frame, or sent one that was echoed back.
    TestReceived(Vec<u8>),
    /// A trace-level diagnostic the host may log; never required for correctness.
    Trace(Trace),
}

/// Diagnostic detail for hosts that want more insight than bare state changes, without forcing
/// every host to parse `log` crate records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trace {
    FrameSent(&'static str),
    FrameReceived(&'static str),
    RetransmitAttempt { attempt: u8 },
    LinkFailure,
    IdleTimeout,
}
