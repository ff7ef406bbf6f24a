// SPDX-License-Identifier: MIT

use thiserror::Error;
pub use traffic_limitd_core::FailReason;

pub const HEADER_LEN: usize = 8;

const TYPE_REQ: u32 = 0;
const TYPE_FAIL: u32 = 1;
const TYPE_LOG: u32 = 2;
const TYPE_PROCEED: u32 = 3;

/// Bit 0 of `ReqAttr::flags`: fail immediately rather than wait for a
/// resource slot (spec.md §6).
pub const FLAG_NOWAIT: u64 = 1 << 0;

/// Wire value meaning "unlimited in this dimension" (spec.md §3/§6).
pub const RATE_UNLIMITED: u64 = u64::MAX;

/// The 8-byte frame header: full frame length (including itself) and a
/// type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u32,
    pub ty: u32,
}

/// `REQ` attributes (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqAttr {
    pub byte_rate: u64,
    pub packet_rate: u64,
    pub flags: u64,
}

impl ReqAttr {
    pub fn nowait(self) -> bool {
        self.flags & FLAG_NOWAIT != 0
    }

    /// Fold the wire's "unlimited" sentinel into the same "no contribution"
    /// semantics as `0` (SPEC_FULL.md §9 open-question resolution), so
    /// exactly one code path reaches the kernel table.
    pub fn normalized_byte_rate(&self) -> u64 {
        if self.byte_rate == RATE_UNLIMITED {
            0
        } else {
            self.byte_rate
        }
    }

    pub fn normalized_packet_rate(&self) -> u64 {
        if self.packet_rate == RATE_UNLIMITED {
            0
        } else {
            self.packet_rate
        }
    }
}

/// One complete client<->daemon message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Req(ReqAttr),
    Fail { reason: FailReason },
    Log(Vec<u8>),
    Proceed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame shorter than header ({0} bytes)")]
    TooShortForHeader(usize),
    #[error("header declares length {declared} but frame is {actual} bytes")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("frame too short for type {ty} payload")]
    TooShortForPayload { ty: u32 },
    #[error("unknown message type {0}")]
    UnknownType(u32),
    #[error("unknown FAIL reason {0}")]
    UnknownFailReason(u32),
}

/// Serialize a message into a single frame buffer, header included.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut body = Vec::new();
    let ty = match msg {
        Message::Req(attr) => {
            body.extend_from_slice(&attr.byte_rate.to_ne_bytes());
            body.extend_from_slice(&attr.packet_rate.to_ne_bytes());
            body.extend_from_slice(&attr.flags.to_ne_bytes());
            TYPE_REQ
        }
        Message::Fail { reason } => {
            body.extend_from_slice(&(*reason as u32).to_ne_bytes());
            TYPE_FAIL
        }
        Message::Log(text) => {
            body.extend_from_slice(text);
            TYPE_LOG
        }
        Message::Proceed => TYPE_PROCEED,
    };

    let length = (HEADER_LEN + body.len()) as u32;
    let mut frame = Vec::with_capacity(length as usize);
    frame.extend_from_slice(&length.to_ne_bytes());
    frame.extend_from_slice(&ty.to_ne_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Parse a single received frame (exactly what one SEQPACKET `recv` yields).
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    if frame.len() < HEADER_LEN {
        return Err(DecodeError::TooShortForHeader(frame.len()));
    }
    let header = read_header(frame);
    if header.length as usize != frame.len() {
        return Err(DecodeError::LengthMismatch {
            declared: header.length,
            actual: frame.len(),
        });
    }
    let body = &frame[HEADER_LEN..];

    match header.ty {
        TYPE_REQ => {
            if body.len() < 24 {
                return Err(DecodeError::TooShortForPayload { ty: TYPE_REQ });
            }
            let byte_rate = read_u64(&body[0..8]);
            let packet_rate = read_u64(&body[8..16]);
            let flags = read_u64(&body[16..24]);
            Ok(Message::Req(ReqAttr { byte_rate, packet_rate, flags }))
        }
        TYPE_FAIL => {
            if body.len() < 4 {
                return Err(DecodeError::TooShortForPayload { ty: TYPE_FAIL });
            }
            let raw = read_u32(&body[0..4]);
            let reason = fail_reason_from_u32(raw).ok_or(DecodeError::UnknownFailReason(raw))?;
            Ok(Message::Fail { reason })
        }
        TYPE_LOG => Ok(Message::Log(body.to_vec())),
        TYPE_PROCEED => Ok(Message::Proceed),
        other => Err(DecodeError::UnknownType(other)),
    }
}

fn read_header(frame: &[u8]) -> Header {
    let length = read_u32(&frame[0..4]);
    let ty = read_u32(&frame[4..8]);
    Header { length, ty }
}

/// Both slices are fixed-length views the caller has already bounds-checked;
/// `unwrap_or` rather than `expect` keeps this non-panicking even so.
fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_ne_bytes(bytes.try_into().unwrap_or([0; 8]))
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_ne_bytes(bytes.try_into().unwrap_or([0; 4]))
}

fn fail_reason_from_u32(raw: u32) -> Option<FailReason> {
    match raw {
        0 => Some(FailReason::Unknown),
        1 => Some(FailReason::WillWait),
        2 => Some(FailReason::Internal),
        3 => Some(FailReason::NoResource),
        4 => Some(FailReason::YourError),
        _ => None,
    }
}

/// Minimum byte count the daemon must receive before it can interpret a
/// `REQ` frame (header + `ReqAttr`) — used for the 300ms-timeout read in
/// spec.md §4.H step 8.
pub const REQ_FRAME_LEN: usize = HEADER_LEN + 24;
