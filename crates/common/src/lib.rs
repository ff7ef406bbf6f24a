// SPDX-License-Identifier: MIT

//! Types and pure pacing math shared by the daemon (`crates/daemon`) and the
//! in-kernel classifier (`crates/ebpf`).
//!
//! `#![no_std]` because the eBPF crate links this directly; the daemon uses
//! it from ordinary std code without any feature gate, the way `aya`-based
//! projects in the corpus (`hud-common`) share one POD-types crate both
//! ways.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

/// Value of `rate_limit_map[cgroup_id]` (spec.md §3 "Rate-limit entry").
/// `0` in either field means "no contribution from that dimension".
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimit {
    pub byte_rate: u64,
    pub packet_rate: u64,
}

impl RateLimit {
    pub const UNLIMITED: RateLimit = RateLimit { byte_rate: 0, packet_rate: 0 };

    pub fn is_unlimited(&self) -> bool {
        self.byte_rate == 0 && self.packet_rate == 0
    }
}

/// Hard cap on simultaneously-installed rate-limit entries (spec.md §3).
/// Must exceed `MAX_NR_TASKS` by at least 12.5%; we size the map at exactly
/// that margin.
pub const MAX_NR_TASKS: u32 = 1000;

/// `MAX_NR_TASKS` scaled by the required >=12.5% margin, rounded up, used to
/// size both kernel hash maps (spec.md §4.G).
pub const MAX_TASKS: u32 = MAX_NR_TASKS + (MAX_NR_TASKS + 7) / 8;

/// Packets whose computed send time would be this far in the future are
/// dropped instead of paced (spec.md §4.G), in nanoseconds.
pub const DROP_HORIZON_NS: u64 = 2_000_000_000;

/// The outcome of feeding one packet through the classifier for a cgroup
/// that has an active rate-limit entry (spec.md §4.G steps 2-3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingDecision {
    /// Send at `send_at_ns`, and leave `next_avail_ts` at `next_avail_ns`.
    Pass { send_at_ns: u64, next_avail_ns: u64 },
    /// `next_avail_ts` would be more than `DROP_HORIZON_NS` in the future.
    Drop,
}

/// `delay_bytes = round(len * 1e9 / byte_rate)`, `0` if `byte_rate == 0`.
pub fn delay_for_bytes_ns(len: u64, byte_rate: u64) -> u64 {
    if byte_rate == 0 {
        return 0;
    }
    (len.saturating_mul(1_000_000_000) + byte_rate / 2) / byte_rate
}

/// `delay_pkt = round(1e9 / packet_rate)`, `0` if `packet_rate == 0`.
pub fn delay_for_packets_ns(packet_rate: u64) -> u64 {
    if packet_rate == 0 {
        return 0;
    }
    (1_000_000_000 + packet_rate / 2) / packet_rate
}

pub fn delay_ns(len: u64, limit: RateLimit) -> u64 {
    delay_for_bytes_ns(len, limit.byte_rate).max(delay_for_packets_ns(limit.packet_rate))
}

/// Port of spec.md §4.G step 3, taking the previous `next_avail_ts` (`None`
/// if the cgroup has no entry in `rate_limit_priv_map` yet) and the current
/// monotonic time. Pure function so it can run identically inside the
/// `#[classifier]` program and in host-side unit tests.
pub fn pace(now_ns: u64, prev: Option<u64>, delay: u64) -> PacingDecision {
    match prev {
        None => {
            let next = now_ns.saturating_add(delay);
            PacingDecision::Pass { send_at_ns: now_ns, next_avail_ns: next }
        }
        Some(prev) if prev < now_ns => {
            let next = now_ns.saturating_add(delay);
            PacingDecision::Pass { send_at_ns: now_ns, next_avail_ns: next }
        }
        Some(prev) if prev > now_ns.saturating_add(DROP_HORIZON_NS) => PacingDecision::Drop,
        Some(prev) => {
            let next = prev.saturating_add(delay);
            PacingDecision::Pass { send_at_ns: prev, next_avail_ns: next }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_is_sized_with_required_margin() {
        assert!(MAX_TASKS as f64 >= MAX_NR_TASKS as f64 * 1.125);
    }

    #[test]
    fn delay_matches_byte_rate_formula() {
        // 1500-byte packet at 125000 B/s (1 Mbps) => ~12ms.
        let delay = delay_for_bytes_ns(1500, 125_000);
        assert_eq!(delay, (1500u64 * 1_000_000_000 + 62_500) / 125_000);
    }

    #[test]
    fn zero_rate_means_no_contribution() {
        assert_eq!(delay_for_bytes_ns(1500, 0), 0);
        assert_eq!(delay_for_packets_ns(0), 0);
        assert_eq!(delay_ns(1500, RateLimit::UNLIMITED), 0);
    }

    #[test]
    fn fresh_cgroup_passes_immediately() {
        let decision = pace(1_000, None, 10_000);
        assert_eq!(
            decision,
            PacingDecision::Pass { send_at_ns: 1_000, next_avail_ns: 11_000 }
        );
    }

    #[test]
    fn elapsed_prev_resets_to_now_plus_delay() {
        let decision = pace(10_000, Some(1_000), 500);
        assert_eq!(
            decision,
            PacingDecision::Pass { send_at_ns: 10_000, next_avail_ns: 10_500 }
        );
    }

    #[test]
    fn future_prev_within_horizon_queues_behind_it() {
        let decision = pace(1_000, Some(1_500), 200);
        assert_eq!(decision, PacingDecision::Pass { send_at_ns: 1_500, next_avail_ns: 1_700 });
    }

    #[test]
    fn prev_beyond_drop_horizon_drops() {
        let decision = pace(0, Some(DROP_HORIZON_NS + 1), 0);
        assert_eq!(decision, PacingDecision::Drop);
    }

    #[test]
    fn steady_stream_spaces_packets_by_one_over_byte_rate() {
        // Scenario 5 in spec.md §8: byte_rate = 1 => ~1e9 ns between 1-byte packets.
        let limit = RateLimit { byte_rate: 1, packet_rate: 0 };
        let delay = delay_ns(1, limit);
        assert_eq!(delay, 1_000_000_000);

        let mut prev = None;
        let mut spacing = Vec::new();
        let mut now = 0u64;
        for _ in 0..5 {
            match pace(now, prev, delay) {
                PacingDecision::Pass { send_at_ns, next_avail_ns } => {
                    spacing.push(send_at_ns);
                    prev = Some(next_avail_ns);
                }
                PacingDecision::Drop => panic!("unexpected drop"),
            }
            now += 1; // packets arrive back-to-back
        }
        for pair in spacing.windows(2) {
            assert_eq!(pair[1] - pair[0], delay);
        }
    }
}
