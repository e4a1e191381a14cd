//! A sans-I/O AX.25 v2.2 connection-oriented data-link engine.
//!
//! This crate implements the connection-oriented ("ABM"/balanced) half of AX.25 v2.2: the address
//! and frame codec, the per-peer session state machine (connection setup/teardown, sequenced
//! I-frame transfer with sliding-window flow control, supervisory frame handling, T1/T2/T3
//! timers, piggyback and delayed ACKs), and the outbound transmit queue.
//!
//! # What this crate does not do
//!
//! The engine never touches hardware. It only sees an abstract [`Channel`](channel::Channel) that
//! accepts encoded frame bytes and an abstract [`Timer`](time::Timer) that reports the current
//! time. A host process — the physical radio driver, a BBS, an APRS parser, a web dashboard — is
//! responsible for everything outside that boundary; none of it is implemented here. See
//! `DESIGN.md` for the full list of collaborators this crate expects but does not provide.
//!
//! # Usage
//!
//! ```no_run
//! use ax25_link::address::Address;
//! use ax25_link::config::Config;
//! use ax25_link::session::Session;
//! use ax25_link::sim::{MockChannel, MockTimer};
//!
//! let local = Address::new("N0CALL", 1);
//! let peer = Address::new("KJ7XYZ", 2);
//! let mut session = Session::new(local, peer, MockChannel::new(), MockTimer::new(), Config::default());
//!
//! for event in session.connect() {
//!     // react to Event::StateChanged, etc.
//!     let _ = event;
//! }
//! ```

pub mod address;
pub mod bytes;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod queue;
pub mod session;
pub mod sim;
pub mod time;
pub mod timers;

pub use address::{Address, AddressChain, CommandResponse};
pub use channel::Channel;
pub use config::Config;
pub use error::{AddressError, FrameError};
pub use event::{Event, Trace};
pub use frame::{Control, Frame, FrameType, FrmrReason, Modulus, SKind, UKind, XidParams};
pub use session::{Session, State, Stats};
pub use time::Timer;
