//! Error types shared by the codec and session layers.
//!
//! The engine never panics on malformed wire input; every fallible path returns one of these
//! enums instead.

use thiserror::Error;

/// Failures the address codec can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    /// No address octet in the chain had its end-of-address bit set within 10 addresses.
    #[error("no end-of-address marker found within 10 addresses")]
    MalformedAddress,
    /// Fewer than 7 octets remained while decoding an address.
    #[error("address chain truncated")]
    Truncated,
}

/// Failures the frame codec can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The byte buffer ended before a complete frame (addresses, control, PID, payload) was read.
    #[error("frame truncated before a complete control/PID/payload was read")]
    TruncatedFrame,
    /// The control octet(s) did not match any known I/S/U pattern.
    #[error("control field {0:#04x} did not match any known frame encoding")]
    UnknownControl(u8),
    /// An address field failed to decode.
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    /// A modulus other than 8 or 128 was requested.
    #[error("unsupported sequence modulus: {0}")]
    UnsupportedModulus(u16),
}
