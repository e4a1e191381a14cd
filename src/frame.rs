//! AX.25 frame codec: control-octet layouts for I/S/U frames in both modulo-8 and modulo-128
//! (extended) form, PID handling, and the closed `Control` sum type frames are built from.

use bitflags::bitflags;

use crate::address::AddressChain;
use crate::bytes::{ByteReader, ByteWriter};
use crate::error::FrameError;

bitflags! {
    /// FRMR rejection-reason flags, carried in the low nibble of the third FRMR information octet
    /// per AX.25 v2.2.
    pub struct FrmrReason: u8 {
        /// W: the control field received was invalid or not implemented.
        const INVALID_CONTROL = 0b0001;
        /// X: the information field of an I-frame exceeded the maximum permitted length.
        const FIELD_TOO_LONG = 0b0010;
        /// Y: the frame carried an invalid N(r) (outside the current window).
        const INVALID_NR = 0b0100;
        /// Z: the frame carried an invalid N(s) (a sequencing error beyond the window).
        const INVALID_NS = 0b1000;
    }
}

impl FrmrReason {
    /// Builds the 3-octet FRMR information field: the rejected control octet, then V(R)/V(S)
    /// packed into the second octet, then this reason nibble in the third.
    pub fn to_payload(self, rejected_control: u8, vr: u8, vs: u8) -> Vec<u8> {
        vec![rejected_control, (vr << 5) | (vs << 1), self.bits()]
    }
}

/// The subset of XID-negotiable session parameters this crate varies per session: sequence
/// modulus, window size, and I-field length. Full AX.25 v2.2 XID also carries HDLC
/// class-of-procedure and optional-function bitfields for multi-vendor interop; those have no
/// counterpart here since this crate only ever talks to its own peer implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XidParams {
    pub modulus: Modulus,
    pub max_frames: u8,
    pub packet_length: u16,
}

impl XidParams {
    pub fn to_payload(self) -> Vec<u8> {
        let modulus_byte = match self.modulus {
            Modulus::Eight => 8u8,
            Modulus::Extended128 => 128u8,
        };
        vec![
            modulus_byte,
            self.max_frames,
            (self.packet_length >> 8) as u8,
            (self.packet_length & 0xFF) as u8,
        ]
    }

    pub fn from_payload(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let modulus = match bytes[0] {
            128 => Modulus::Extended128,
            _ => Modulus::Eight,
        };
        let packet_length = ((bytes[2] as u16) << 8) | bytes[3] as u16;
        Some(Self {
            modulus,
            max_frames: bytes[1],
            packet_length,
        })
    }
}

/// PID value meaning "no layer 3 protocol" — the default for I- and UI-frame payloads that carry
/// raw application bytes.
pub const PID_NO_LAYER3: u8 = 0xF0;
/// PID reserved for NET/ROM.
pub const PID_NETROM: u8 = 0xCF;

/// Sequence-number modulus for a session. Modulo-128 uses a 16-bit extended control field for I-
/// and S-frames and raises the window ceiling to 127; U-frames are always a single control octet
/// regardless of modulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulus {
    Eight,
    Extended128,
}

impl Modulus {
    pub fn value(self) -> u16 {
        match self {
            Modulus::Eight => 8,
            Modulus::Extended128 => 128,
        }
    }
}

/// Supervisory frame subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SKind {
    Rr,
    Rnr,
    Rej,
    Srej,
}

/// Unnumbered frame payload, keyed by type. Each variant carries exactly the fields that type's
/// wire encoding has room for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UKind {
    Sabm { poll: bool },
    Sabme { poll: bool },
    Disc { poll: bool },
    Dm { final_: bool },
    Ua { final_: bool },
    Ui { poll: bool, pid: u8, payload: Vec<u8> },
    Frmr { final_: bool, payload: Vec<u8> },
    Xid { poll_final: bool, payload: Vec<u8> },
    Test { poll_final: bool, payload: Vec<u8> },
}

/// The control-field payload of a frame, independent of its address chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    I {
        ns: u8,
        nr: u8,
        poll: bool,
        pid: u8,
        payload: Vec<u8>,
    },
    S {
        kind: SKind,
        nr: u8,
        poll_final: bool,
    },
    U(UKind),
}

/// The frame-type tag derived from a decoded [`Control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I,
    Rr,
    Rnr,
    Rej,
    Srej,
    Sabm,
    Sabme,
    Disc,
    Dm,
    Ua,
    Ui,
    Frmr,
    Xid,
    Test,
}

impl Control {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Control::I { .. } => FrameType::I,
            Control::S { kind, .. } => match kind {
                SKind::Rr => FrameType::Rr,
                SKind::Rnr => FrameType::Rnr,
                SKind::Rej => FrameType::Rej,
                SKind::Srej => FrameType::Srej,
            },
            Control::U(u) => match u {
                UKind::Sabm { .. } => FrameType::Sabm,
                UKind::Sabme { .. } => FrameType::Sabme,
                UKind::Disc { .. } => FrameType::Disc,
                UKind::Dm { .. } => FrameType::Dm,
                UKind::Ua { .. } => FrameType::Ua,
                UKind::Ui { .. } => FrameType::Ui,
                UKind::Frmr { .. } => FrameType::Frmr,
                UKind::Xid { .. } => FrameType::Xid,
                UKind::Test { .. } => FrameType::Test,
            },
        }
    }

    /// The poll/final bit carried by this control field, if any (I- and S-frames always carry
    /// one; U-frames carry one on every variant this crate implements).
    pub fn poll_final(&self) -> bool {
        match self {
            Control::I { poll, .. } => *poll,
            Control::S { poll_final, .. } => *poll_final,
            Control::U(u) => match u {
                UKind::Sabm { poll } | UKind::Sabme { poll } | UKind::Disc { poll } | UKind::Ui { poll, .. } => *poll,
                UKind::Dm { final_ } | UKind::Ua { final_ } | UKind::Frmr { final_ } => *final_,
                UKind::Xid { poll_final, .. } | UKind::Test { poll_final, .. } => *poll_final,
            },
        }
    }

    pub fn nr(&self) -> Option<u8> {
        match self {
            Control::I { nr, .. } => Some(*nr),
            Control::S { nr, .. } => Some(*nr),
            Control::U(_) => None,
        }
    }

    fn encode(&self, out: &mut ByteWriter, modulus: Modulus) {
        match self {
            Control::I { ns, nr, poll, pid, payload } => {
                match modulus {
                    Modulus::Eight => {
                        let byte = ((nr & 0x07) << 5) | ((*poll as u8) << 4) | ((ns & 0x07) << 1);
                        out.write_u8(byte);
                    }
                    Modulus::Extended128 => {
                        out.write_u8(ns << 1);
                        out.write_u8((nr << 1) | (*poll as u8));
                    }
                }
                out.write_u8(*pid);
                out.write_slice(payload);
            }
            Control::S { kind, nr, poll_final } => {
                let subtype = skind_to_bits(*kind);
                match modulus {
                    Modulus::Eight => {
                        let byte = ((nr & 0x07) << 5) | ((*poll_final as u8) << 4) | (subtype << 2) | 0b01;
                        out.write_u8(byte);
                    }
                    Modulus::Extended128 => {
                        out.write_u8((subtype << 2) | 0b01);
                        out.write_u8((nr << 1) | (*poll_final as u8));
                    }
                }
            }
            Control::U(u) => {
                out.write_u8(encode_u(u));
                match u {
                    UKind::Ui { pid, payload, .. } => {
                        out.write_u8(*pid);
                        out.write_slice(payload);
                    }
                    UKind::Frmr { payload, .. }
                    | UKind::Xid { payload, .. }
                    | UKind::Test { payload, .. } => {
                        out.write_slice(payload);
                    }
                    _ => {}
                }
            }
        }
    }

    fn decode(r: &mut ByteReader, modulus: Modulus) -> Result<Self, FrameError> {
        let first = r.peek_u8().ok_or(FrameError::TruncatedFrame)?;
        if first & 0x01 == 0 {
            // I-frame
            r.read_u8();
            let (ns, nr, poll) = match modulus {
                Modulus::Eight => {
                    let nr = (first >> 5) & 0x07;
                    let poll = (first >> 4) & 0x01 != 0;
                    let ns = (first >> 1) & 0x07;
                    (ns, nr, poll)
                }
                Modulus::Extended128 => {
                    let ns = first >> 1;
                    let second = r.read_u8().ok_or(FrameError::TruncatedFrame)?;
                    let nr = second >> 1;
                    let poll = second & 0x01 != 0;
                    (ns, nr, poll)
                }
            };
            let pid = r.read_u8().ok_or(FrameError::TruncatedFrame)?;
            let payload = r.rest().to_vec();
            Ok(Control::I { ns, nr, poll, pid, payload })
        } else if first & 0x03 == 0x01 {
            // S-frame
            r.read_u8();
            let subtype_bits = (first >> 2) & 0x03;
            let kind = bits_to_skind(subtype_bits);
            let (nr, poll_final) = match modulus {
                Modulus::Eight => {
                    let nr = (first >> 5) & 0x07;
                    let pf = (first >> 4) & 0x01 != 0;
                    (nr, pf)
                }
                Modulus::Extended128 => {
                    let second = r.read_u8().ok_or(FrameError::TruncatedFrame)?;
                    (second >> 1, second & 0x01 != 0)
                }
            };
            Ok(Control::S { kind, nr, poll_final })
        } else {
            // U-frame: bits pattern xxxxxx11
            r.read_u8();
            decode_u(first, r)
        }
    }
}

fn skind_to_bits(kind: SKind) -> u8 {
    match kind {
        SKind::Rr => 0b00,
        SKind::Rnr => 0b01,
        SKind::Rej => 0b10,
        SKind::Srej => 0b11,
    }
}

fn bits_to_skind(bits: u8) -> SKind {
    match bits & 0x03 {
        0b00 => SKind::Rr,
        0b01 => SKind::Rnr,
        0b10 => SKind::Rej,
        _ => SKind::Srej,
    }
}

const U_SABM: u8 = 0x2F;
const U_SABME: u8 = 0x6F;
const U_DISC: u8 = 0x43;
const U_DM: u8 = 0x0F;
const U_UA: u8 = 0x63;
const U_UI: u8 = 0x03;
const U_FRMR: u8 = 0x87;
const U_XID: u8 = 0xAF;
const U_TEST: u8 = 0xE3;
/// The poll/final bit lives at bit 4 in every U-frame template above; masking it out yields the
/// type tag to match against.
const U_PF_MASK: u8 = 0x10;

fn encode_u(u: &UKind) -> u8 {
    let (template, pf) = match u {
        UKind::Sabm { poll } => (U_SABM, *poll),
        UKind::Sabme { poll } => (U_SABME, *poll),
        UKind::Disc { poll } => (U_DISC, *poll),
        UKind::Dm { final_ } => (U_DM, *final_),
        UKind::Ua { final_ } => (U_UA, *final_),
        UKind::Ui { poll, .. } => (U_UI, *poll),
        UKind::Frmr { final_, .. } => (U_FRMR, *final_),
        UKind::Xid { poll_final, .. } => (U_XID, *poll_final),
        UKind::Test { poll_final, .. } => (U_TEST, *poll_final),
    };
    let base = template & !U_PF_MASK;
    if pf {
        base | U_PF_MASK
    } else {
        base
    }
}

fn decode_u(first: u8, r: &mut ByteReader) -> Result<Control, FrameError> {
    let masked = first & !U_PF_MASK;
    let pf = first & U_PF_MASK != 0;
    let kind = match masked {
        x if x == U_SABM & !U_PF_MASK => UKind::Sabm { poll: pf },
        x if x == U_SABME & !U_PF_MASK => UKind::Sabme { poll: pf },
        x if x == U_DISC & !U_PF_MASK => UKind::Disc { poll: pf },
        x if x == U_DM & !U_PF_MASK => UKind::Dm { final_: pf },
        x if x == U_UA & !U_PF_MASK => UKind::Ua { final_: pf },
        x if x == U_UI & !U_PF_MASK => {
            let pid = r.read_u8().ok_or(FrameError::TruncatedFrame)?;
            let payload = r.rest().to_vec();
            UKind::Ui { poll: pf, pid, payload }
        }
        x if x == U_FRMR & !U_PF_MASK => {
            let payload = r.rest().to_vec();
            UKind::Frmr { final_: pf, payload }
        }
        x if x == U_XID & !U_PF_MASK => {
            let payload = r.rest().to_vec();
            UKind::Xid { poll_final: pf, payload }
        }
        x if x == U_TEST & !U_PF_MASK => {
            let payload = r.rest().to_vec();
            UKind::Test { poll_final: pf, payload }
        }
        _ => return Err(FrameError::UnknownControl(first)),
    };
    Ok(Control::U(kind))
}

/// A complete AX.25 frame: address chain plus control field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub addresses: AddressChain,
    pub control: Control,
}

impl Frame {
    pub fn new(addresses: AddressChain, control: Control) -> Self {
        Self { addresses, control }
    }

    pub fn frame_type(&self) -> FrameType {
        self.control.frame_type()
    }

    pub fn encode(&self, modulus: Modulus) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.addresses.encode(&mut w);
        self.control.encode(&mut w, modulus);
        w.into_vec()
    }

    pub fn decode(bytes: &[u8], modulus: Modulus) -> Result<Self, FrameError> {
        let mut r = ByteReader::new(bytes);
        let addresses = AddressChain::decode(&mut r)?;
        let control = Control::decode(&mut r, modulus)?;
        Ok(Self { addresses, control })
    }
}
