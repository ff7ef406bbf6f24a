// SPDX-License-Identifier: MIT

//! Error taxonomy surfaced to clients (spec.md §7) plus the daemon-internal
//! error type every component returns, following the `thiserror`-enum-per-
//! subsystem convention used throughout this codebase.

use thiserror::Error;

use crate::interrupt::InterruptReason;

/// The wire-level reason code sent back to a client on failure (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum FailReason {
    Unknown = 0,
    /// Resource contention; reserved for future use, never emitted today.
    WillWait = 1,
    Internal = 2,
    NoResource = 3,
    YourError = 4,
}

/// Errors raised anywhere in the daemon's connection-handling path.
///
/// Every variant maps onto exactly one `FailReason` (spec.md §7's
/// propagation table), so handlers can `?`-propagate freely and only decide
/// the wire reason once, at the point where a `Response` is built.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("admission capacity exceeded")]
    NoResource,

    #[error("malformed or truncated request: {0}")]
    YourError(String),

    #[error("client I/O timed out")]
    Timeout,

    #[error("task interrupted: {0:?}")]
    Interrupted(InterruptReason),

    #[error("service manager RPC failed: {0}")]
    ServiceManager(String),

    #[error("netlink operation failed: {0}")]
    Netlink(String),

    #[error("cgroup lookup failed: {0}")]
    Cgroup(#[from] std::io::Error),

    #[error("rate-limit table is full")]
    TableFull,

    #[error("internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    /// Map this error onto the wire-level reason code (spec.md §7).
    pub fn to_fail_reason(&self) -> FailReason {
        match self {
            DaemonError::NoResource => FailReason::NoResource,
            DaemonError::YourError(_) => FailReason::YourError,
            // A timeout is the client's fault only if the client held the
            // last expected write; callers that know better construct
            // `YourError` directly instead of going through `Timeout`.
            DaemonError::Timeout => FailReason::Internal,
            DaemonError::Interrupted(InterruptReason::Shutdown) => FailReason::Internal,
            DaemonError::Interrupted(_) => FailReason::Internal,
            DaemonError::ServiceManager(_)
            | DaemonError::Netlink(_)
            | DaemonError::Cgroup(_)
            | DaemonError::TableFull
            | DaemonError::Internal(_) => FailReason::Internal,
        }
    }
}
