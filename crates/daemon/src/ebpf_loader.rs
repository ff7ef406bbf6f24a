// SPDX-License-Identifier: MIT

//! Loads and attaches the in-kernel classifier (spec.md §4.G, §4.I "load
//! classifier program and size its maps per MAX_NR_TASKS"). The compiled
//! object is cross-built by `build.rs` and embedded with
//! `include_bytes_aligned!`, the way the pack's `hud`/`hud-ebpf` split keeps
//! userspace and kernel sides as a single Cargo build.

use std::os::fd::{AsFd, AsRawFd, RawFd};

use aya::maps::MapData;
use aya::programs::SchedClassifier;
use aya::Ebpf;
use traffic_limitd_core::DaemonError;
use traffic_limitd_ebpf_common::RateLimit;

const CLASSIFY_PROGRAM: &str = "classify_egress";
const RATE_LIMIT_MAP: &str = "RATE_LIMIT_MAP";

/// Owns the loaded BPF object for the daemon's lifetime; dropping it detaches
/// the program and tears down its maps.
pub struct LoadedClassifier {
    bpf: Ebpf,
}

impl LoadedClassifier {
    /// Load the embedded object and size `RATE_LIMIT_MAP` to `MAX_TASKS`
    /// entries. The program is not yet attached to any interface — callers
    /// pass the returned fd to `netlink::configure_interfaces`.
    pub fn load() -> Result<Self, DaemonError> {
        let data = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/traffic-limitd-ebpf"));
        let mut bpf = Ebpf::load(data).map_err(|e| DaemonError::Internal(format!("ebpf load: {e}")))?;
        if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
            tracing::warn!(error = %e, "eBPF log bridge did not initialize (no log statements in program?)");
        }
        Ok(Self { bpf })
    }

    /// Load the `classify_egress` TC classifier and return its raw fd, ready
    /// for `rtnetlink`'s `.bpf(prog_fd)` filter attach.
    pub fn program_fd(&mut self) -> Result<RawFd, DaemonError> {
        let program = self
            .bpf
            .program_mut(CLASSIFY_PROGRAM)
            .ok_or_else(|| DaemonError::Internal(format!("program {CLASSIFY_PROGRAM} missing from object")))?;
        let classifier: &mut SchedClassifier = program
            .try_into()
            .map_err(|e: aya::programs::ProgramError| DaemonError::Internal(e.to_string()))?;
        // `direct_action` classifiers are attached via the filter itself, not
        // `SchedClassifier::attach`; loading is still required to get an fd.
        classifier
            .load()
            .map_err(|e| DaemonError::Internal(format!("program load: {e}")))?;
        let fd = classifier.fd().map_err(|e| DaemonError::Internal(e.to_string()))?;
        Ok(fd.as_fd().as_raw_fd())
    }

    /// Hand off the typed `RATE_LIMIT_MAP` handle for `AyaRateLimitTable`.
    pub fn take_rate_limit_map(&mut self) -> Result<aya::maps::HashMap<MapData, u64, RateLimit>, DaemonError> {
        let map = self
            .bpf
            .take_map(RATE_LIMIT_MAP)
            .ok_or_else(|| DaemonError::Internal(format!("map {RATE_LIMIT_MAP} missing from object")))?;
        aya::maps::HashMap::try_from(map).map_err(|e| DaemonError::Internal(e.to_string()))
    }
}
