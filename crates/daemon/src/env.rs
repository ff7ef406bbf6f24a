// SPDX-License-Identifier: MIT

//! Centralized environment variable access for the daemon crate.

use std::time::Duration;

/// Comma-separated interface list the daemon configures egress qdiscs/filters
/// on (spec.md §6 "Environment"). Mandatory; startup fails if unset or empty.
pub fn interfaces() -> Result<Vec<String>, crate::lifecycle::LifecycleError> {
    let raw = std::env::var("IFACES")
        .map_err(|_| crate::lifecycle::LifecycleError::MissingIfaces)?;
    let ifaces: Vec<String> = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
    if ifaces.is_empty() {
        return Err(crate::lifecycle::LifecycleError::MissingIfaces);
    }
    Ok(ifaces)
}

/// `SYSTEMD=1` switches log formatting to service-manager-native level
/// prefixes (spec.md §6).
pub fn running_under_systemd() -> bool {
    std::env::var("SYSTEMD").ok().as_deref() == Some("1")
}

/// Path to the control socket (spec.md §6 "Control socket"). Only used for
/// diagnostics/logging — the real fd comes from socket activation (fd 3).
pub fn control_socket_path() -> std::path::PathBuf {
    std::env::var("TRAFFIC_LIMITD_SOCKET_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("/run/traffic-limitd.sock"))
}

/// Hard cap on simultaneously active orchestrator tasks (spec.md §3
/// `MAX_NR_TASKS`, default 1000).
pub fn max_nr_tasks() -> usize {
    std::env::var("TRAFFIC_LIMITD_MAX_TASKS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(traffic_limitd_ebpf_common::MAX_NR_TASKS as usize)
}

/// Per-read/write I/O timeout on the control stream (spec.md §4.H step 8:
/// `MAX_IO_USEC=300ms`).
pub fn io_timeout() -> Duration {
    std::env::var("TRAFFIC_LIMITD_IO_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(300))
}

/// Idle-exit timer duration (spec.md §4.I: "arm a one-shot 20ms idle-exit
/// timer").
pub fn idle_exit_timeout() -> Duration {
    std::env::var("TRAFFIC_LIMITD_IDLE_EXIT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(20))
}

/// Prefix for generated transient scope unit names (spec.md §3: `<prefix>-<hex>.scope`).
pub fn scope_prefix() -> String {
    std::env::var("TRAFFIC_LIMITD_SCOPE_PREFIX").unwrap_or_else(|_| "traffic-limitd-scope".to_string())
}
