// SPDX-License-Identifier: MIT

use super::*;
use traffic_limitd_core::FailReason;

#[test]
fn round_trips_req() {
    let msg = Message::Req(ReqAttr { byte_rate: 125_000, packet_rate: 0, flags: 0 });
    let frame = encode(&msg);
    assert_eq!(decode(&frame).unwrap(), msg);
}

#[test]
fn round_trips_req_with_nowait_flag() {
    let attr = ReqAttr { byte_rate: 1, packet_rate: 2, flags: FLAG_NOWAIT };
    assert!(attr.nowait());
    let frame = encode(&Message::Req(attr));
    let Message::Req(decoded) = decode(&frame).unwrap() else { panic!("expected Req") };
    assert!(decoded.nowait());
}

#[test]
fn round_trips_fail() {
    for reason in
        [FailReason::Unknown, FailReason::WillWait, FailReason::Internal, FailReason::NoResource, FailReason::YourError]
    {
        let msg = Message::Fail { reason };
        let frame = encode(&msg);
        assert_eq!(decode(&frame).unwrap(), msg);
    }
}

#[test]
fn round_trips_log() {
    let msg = Message::Log(b"Start task with ratelimit bps=125000, pps=0".to_vec());
    let frame = encode(&msg);
    assert_eq!(decode(&frame).unwrap(), msg);
}

#[test]
fn round_trips_proceed() {
    let frame = encode(&Message::Proceed);
    assert_eq!(decode(&frame).unwrap(), Message::Proceed);
    assert_eq!(frame.len(), HEADER_LEN);
}

#[test]
fn rejects_header_only_frame_as_too_short_for_req() {
    // Simulates spec.md §8 scenario 2: client writes only the 8-byte header.
    let header_only = encode(&Message::Proceed); // same 8 bytes, different type tag is irrelevant here
    let mut truncated_req = header_only.clone();
    truncated_req[4..8].copy_from_slice(&0u32.to_ne_bytes()); // pretend it's a REQ type
    truncated_req[0..4].copy_from_slice(&(REQ_FRAME_LEN as u32).to_ne_bytes());
    // Length field lies about a REQ payload that was never sent.
    assert!(matches!(decode(&truncated_req), Err(DecodeError::LengthMismatch { .. })));
}

#[test]
fn rejects_length_mismatch() {
    let mut frame = encode(&Message::Req(ReqAttr { byte_rate: 1, packet_rate: 1, flags: 0 }));
    frame[0..4].copy_from_slice(&999u32.to_ne_bytes());
    assert_eq!(
        decode(&frame),
        Err(DecodeError::LengthMismatch { declared: 999, actual: frame.len() })
    );
}

#[test]
fn rejects_frame_shorter_than_header() {
    assert_eq!(decode(&[0u8; 3]), Err(DecodeError::TooShortForHeader(3)));
}

#[test]
fn rejects_unknown_type() {
    let mut frame = encode(&Message::Proceed);
    frame[4..8].copy_from_slice(&77u32.to_ne_bytes());
    assert_eq!(decode(&frame), Err(DecodeError::UnknownType(77)));
}

#[test]
fn normalizes_unlimited_rate_to_zero_contribution() {
    let attr = ReqAttr { byte_rate: RATE_UNLIMITED, packet_rate: RATE_UNLIMITED, flags: 0 };
    assert_eq!(attr.normalized_byte_rate(), 0);
    assert_eq!(attr.normalized_packet_rate(), 0);
}
