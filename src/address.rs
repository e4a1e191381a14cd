//! AX.25 address field codec.
//!
//! An AX.25 address is a 7-octet structure: six ASCII callsign characters, each left-shifted by
//! one bit, followed by an SSID octet that also carries the command/response (or has-been-repeated,
//! for digipeaters) bit, two reserved bits, and the end-of-address marker. A frame's address
//! field is a chain of one or more of these, terminated by the first (and only) octet with its
//! end-of-address bit set.

use crate::bytes::{ByteReader, ByteWriter};
use crate::error::AddressError;

/// Maximum number of addresses (destination + source + up to 8 digipeaters) accepted in a chain
/// before decoding gives up and reports [`AddressError::MalformedAddress`].
const MAX_ADDRESSES: usize = 10;

/// A single AX.25 address: a callsign, an SSID, and the command/response (or repeated) bit.
///
/// Equality and hashing consider only the callsign and SSID — the C/H bits are wire-level policy
/// metadata, not part of a station's identity.
#[derive(Debug, Clone, Eq)]
pub struct Address {
    /// Up to 6 uppercase ASCII characters, trimmed of trailing padding.
    callsign: [u8; 6],
    callsign_len: u8,
    ssid: u8,
    /// Command bit for source/destination addresses; has-been-repeated bit for digipeaters.
    c_or_h: bool,
}

impl Address {
    /// Builds an address from a callsign and SSID, defaulting the C/H bit to `false`.
    ///
    /// The callsign is uppercased and truncated to 6 characters; callers that need exact
    /// callsign/SSID validation should do so before constructing an `Address`.
    pub fn new(callsign: &str, ssid: u8) -> Self {
        Self::with_bit(callsign, ssid, false)
    }

    pub fn with_bit(callsign: &str, ssid: u8, c_or_h: bool) -> Self {
        let mut buf = [b' '; 6];
        let upper = callsign.to_ascii_uppercase();
        let bytes = upper.as_bytes();
        let len = bytes.len().min(6);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            callsign: buf,
            callsign_len: len as u8,
            ssid: ssid & 0x0F,
            c_or_h,
        }
    }

    pub fn callsign(&self) -> &str {
        core::str::from_utf8(&self.callsign[..self.callsign_len as usize]).unwrap_or("")
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Command bit (destination/source addresses) or has-been-repeated bit (digipeaters).
    pub fn bit(&self) -> bool {
        self.c_or_h
    }

    pub fn set_bit(&mut self, value: bool) {
        self.c_or_h = value;
    }

    /// Encodes this address into `out`, setting the end-of-address bit iff `last` is true.
    pub fn encode(&self, out: &mut ByteWriter, last: bool) {
        for i in 0..6 {
            let ch = if (i as u8) < self.callsign_len {
                self.callsign[i]
            } else {
                b' '
            };
            out.write_u8(ch << 1);
        }
        let mut ssid_octet: u8 = 0b0110_0000; // reserved bits 6-5 set to 1 on encode
        ssid_octet |= (self.ssid & 0x0F) << 1;
        if self.c_or_h {
            ssid_octet |= 0b1000_0000;
        }
        if last {
            ssid_octet |= 0b0000_0001;
        }
        out.write_u8(ssid_octet);
    }

    /// Decodes a single 7-octet address, returning the address and whether it was marked as the
    /// last address in the chain.
    fn decode_one(r: &mut ByteReader) -> Result<(Self, bool), AddressError> {
        let mut callsign = [0u8; 6];
        for slot in callsign.iter_mut() {
            let b = r.read_u8().ok_or(AddressError::Truncated)?;
            *slot = b >> 1;
        }
        let ssid_octet = r.read_u8().ok_or(AddressError::Truncated)?;

        let mut len = 6usize;
        while len > 0 && callsign[len - 1] == b' ' {
            len -= 1;
        }

        let addr = Self {
            callsign,
            callsign_len: len as u8,
            ssid: (ssid_octet >> 1) & 0x0F,
            c_or_h: ssid_octet & 0b1000_0000 != 0,
        };
        let last = ssid_octet & 0x01 != 0;
        Ok((addr, last))
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.callsign() == other.callsign() && self.ssid == other.ssid
    }
}

impl core::hash::Hash for Address {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.callsign().hash(state);
        self.ssid.hash(state);
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.callsign())
        } else {
            write!(f, "{}-{}", self.callsign(), self.ssid)
        }
    }
}

/// An AX.25 address chain: destination, source, and zero or more digipeaters, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressChain {
    pub destination: Address,
    pub source: Address,
    pub digipeaters: Vec<Address>,
}

impl AddressChain {
    pub fn new(destination: Address, source: Address) -> Self {
        Self {
            destination,
            source,
            digipeaters: Vec::new(),
        }
    }

    pub fn with_digipeaters(mut self, digis: Vec<Address>) -> Self {
        self.digipeaters = digis;
        self
    }

    /// Derives the command/response sense from the destination and source C bits.
    ///
    /// `(dest.C, src.C) = (1,0)` is a command, `(0,1)` is a response; other combinations are
    /// legacy/unknown and reported as `None`.
    pub fn command_response(&self) -> Option<CommandResponse> {
        match (self.destination.bit(), self.source.bit()) {
            (true, false) => Some(CommandResponse::Command),
            (false, true) => Some(CommandResponse::Response),
            _ => None,
        }
    }

    pub fn encode(&self, out: &mut ByteWriter) {
        let no_digis = self.digipeaters.is_empty();
        self.destination.encode(out, false);
        self.source.encode(out, no_digis);
        for (i, digi) in self.digipeaters.iter().enumerate() {
            let is_last = i + 1 == self.digipeaters.len();
            digi.encode(out, is_last);
        }
    }

    pub fn decode(r: &mut ByteReader) -> Result<Self, AddressError> {
        let (destination, dest_last) = Address::decode_one(r)?;
        if dest_last {
            // A lone destination with no source is not a valid AX.25 chain, but the codec only
            // enforces the end-of-address invariant here; callers building a frame will fail
            // later for missing a source when one is structurally required.
            return Err(AddressError::MalformedAddress);
        }
        let (source, src_last) = Address::decode_one(r)?;
        let mut digipeaters = Vec::new();
        let mut last = src_last;
        let mut count = 2;
        while !last {
            if count >= MAX_ADDRESSES {
                return Err(AddressError::MalformedAddress);
            }
            let (digi, digi_last) = Address::decode_one(r)?;
            digipeaters.push(digi);
            last = digi_last;
            count += 1;
        }
        Ok(Self {
            destination,
            source,
            digipeaters,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResponse {
    Command,
    Response,
}
