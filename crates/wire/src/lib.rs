// SPDX-License-Identifier: MIT

//! Client/daemon wire protocol (spec.md §6).
//!
//! Wire format: a fixed `Header { length, type }` (both `u32`, host-endian —
//! see the open question recorded in SPEC_FULL.md §9) followed by a
//! type-specific attribute struct, the whole thing written as a single
//! `SOCK_SEQPACKET` frame so one `recv` on the daemon side always yields
//! exactly one message.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod message;

pub use message::{
    decode, encode, DecodeError, FailReason, Header, Message, ReqAttr, FLAG_NOWAIT, HEADER_LEN,
    RATE_UNLIMITED, REQ_FRAME_LEN,
};

#[cfg(test)]
mod wire_tests;
