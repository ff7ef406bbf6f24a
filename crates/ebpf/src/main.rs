// SPDX-License-Identifier: MIT

//! In-kernel egress classifier (spec.md §4.G): looks up the calling
//! cgroup's rate-limit entry and either lets a packet through at its
//! computed send time or drops it outright.
//!
//! Pacing itself happens in the `fq` qdisc `netlink::configure_interfaces`
//! installs on each interface: this program only sets `skb->tstamp` to the
//! earliest departure time and returns `TC_ACT_OK`; `fq` holds the packet
//! until that time arrives. `rate_limit_map` is filled in by the daemon
//! (`ratelimit::AyaRateLimitTable`) and is read-only from here;
//! `rate_limit_priv_map` is this program's own pacing state and the daemon
//! never touches it.

#![no_std]
#![no_main]

use aya_ebpf::bindings::{TC_ACT_OK, TC_ACT_SHOT};
use aya_ebpf::helpers::{bpf_ktime_get_ns, bpf_skb_cgroup_id};
use aya_ebpf::macros::{classifier, map};
use aya_ebpf::maps::{HashMap, LruHashMap};
use aya_ebpf::programs::TcContext;
use traffic_limitd_ebpf_common::{delay_ns, pace, PacingDecision, RateLimit, MAX_TASKS};

/// Rate-limit entries installed and removed by the daemon, keyed by cgroup
/// id (spec.md §3 "Rate-limit entry"). Read-only from the program's side.
#[map]
static RATE_LIMIT_MAP: HashMap<u64, RateLimit> = HashMap::with_max_entries(MAX_TASKS, 0);

/// `next_avail_ts` per cgroup (spec.md §4.G step 3). LRU so a cgroup that
/// stops sending eventually falls out without the daemon having to clean up.
#[map]
static RATE_LIMIT_PRIV_MAP: LruHashMap<u64, u64> = LruHashMap::with_max_entries(MAX_TASKS, 0);

#[classifier]
pub fn classify_egress(ctx: TcContext) -> i32 {
    match try_classify_egress(&ctx) {
        Ok(action) => action,
        Err(_) => TC_ACT_OK,
    }
}

fn try_classify_egress(ctx: &TcContext) -> Result<i32, i64> {
    let cgroup_id = unsafe { bpf_skb_cgroup_id(ctx.skb.skb) };

    let limit = match unsafe { RATE_LIMIT_MAP.get(&cgroup_id) } {
        Some(limit) => *limit,
        None => return Ok(TC_ACT_OK),
    };

    let len = unsafe { (*ctx.skb.skb).len } as u64;
    let delay = delay_ns(len, limit);
    let now = unsafe { bpf_ktime_get_ns() };
    let prev = unsafe { RATE_LIMIT_PRIV_MAP.get(&cgroup_id) }.copied();

    match pace(now, prev, delay) {
        PacingDecision::Drop => Ok(TC_ACT_SHOT),
        PacingDecision::Pass { send_at_ns, next_avail_ns } => {
            unsafe {
                (*ctx.skb.skb).tstamp = send_at_ns;
                RATE_LIMIT_PRIV_MAP
                    .insert(&cgroup_id, &next_avail_ns, 0)
                    .map_err(|_| 1i64)?;
            }
            Ok(TC_ACT_OK)
        }
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
