// SPDX-License-Identifier: MIT

//! Daemon configuration and startup/shutdown sequencing (spec.md §4.I).
//!
//! Startup order matters: the cgroup-v2 root and the classifier must be
//! ready before any interface is touched (the filter needs a loaded
//! program's fd), and the bus connection comes last since it's the one step
//! that talks to another long-running process.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use traffic_limitd_core::{DaemonError, TaskRegistry};

use crate::cgroup::CgroupRoot;
use crate::ebpf_loader::LoadedClassifier;
use crate::netlink;
use crate::orchestrator::UnitNameCache;
use crate::ratelimit::AyaRateLimitTable;
use crate::scope::SystemdServiceManager;

/// Resolved once at startup from environment variables (spec.md §6
/// "Environment") plus any CLI overrides `main.rs` layers on top.
#[derive(Debug, Clone)]
pub struct Config {
    pub ifaces: Vec<String>,
    pub socket_path: std::path::PathBuf,
    pub max_tasks: usize,
    pub io_timeout: Duration,
    pub idle_exit_timeout: Duration,
    pub scope_prefix: String,
    pub running_under_systemd: bool,
}

impl Config {
    pub fn load() -> Result<Self, LifecycleError> {
        Ok(Self {
            ifaces: crate::env::interfaces()?,
            socket_path: crate::env::control_socket_path(),
            max_tasks: crate::env::max_nr_tasks(),
            io_timeout: crate::env::io_timeout(),
            idle_exit_timeout: crate::env::idle_exit_timeout(),
            scope_prefix: crate::env::scope_prefix(),
            running_under_systemd: crate::env::running_under_systemd(),
        })
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("IFACES environment variable is unset or empty")]
    MissingIfaces,
    #[error("netlink setup failed: {0}")]
    Netlink(String),
    #[error("eBPF classifier load failed: {0}")]
    Ebpf(String),
    #[error("cgroup-v2 discovery failed: {0}")]
    Cgroup(String),
    #[error("systemd bus connection failed: {0}")]
    Bus(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LifecycleError> for DaemonError {
    fn from(e: LifecycleError) -> Self {
        DaemonError::Internal(e.to_string())
    }
}

/// Everything a connection orchestrator needs, assembled once at startup and
/// shared (via `Arc`) across every spawned connection task.
pub struct Daemon {
    pub config: Config,
    pub cgroup_root: Arc<CgroupRoot>,
    pub service_manager: Arc<SystemdServiceManager>,
    pub rate_limits: Arc<AyaRateLimitTable>,
    pub registry: Arc<TaskRegistry>,
    pub this_unit_name: Arc<UnitNameCache>,
    // Keeping this alive keeps the program and its maps loaded; nothing
    // reads it directly once `rate_limits`/the filter fd have been taken.
    _classifier: LoadedClassifier,
}

pub async fn startup(config: Config) -> Result<Daemon, LifecycleError> {
    info!(ifaces = ?config.ifaces, "starting up");

    let cgroup_root = CgroupRoot::discover().map_err(|e| LifecycleError::Cgroup(e.to_string()))?;

    let mut classifier = LoadedClassifier::load().map_err(|e| LifecycleError::Ebpf(e.to_string()))?;
    let prog_fd = classifier.program_fd().map_err(|e| LifecycleError::Ebpf(e.to_string()))?;
    let rate_limit_map =
        classifier.take_rate_limit_map().map_err(|e| LifecycleError::Ebpf(e.to_string()))?;

    let (connection, handle, _) =
        rtnetlink::new_connection().map_err(|e| LifecycleError::Netlink(e.to_string()))?;
    tokio::spawn(connection);
    netlink::configure_interfaces(&handle, &config.ifaces, prog_fd)
        .await
        .map_err(|e| LifecycleError::Netlink(e.to_string()))?;

    let service_manager = SystemdServiceManager::connect(config.scope_prefix.clone())
        .await
        .map_err(|e| LifecycleError::Bus(e.to_string()))?;

    let rate_limits = AyaRateLimitTable::new(rate_limit_map, traffic_limitd_ebpf_common::MAX_TASKS);
    let registry = TaskRegistry::new(config.max_tasks);

    info!("daemon ready");

    Ok(Daemon {
        config,
        cgroup_root: Arc::new(cgroup_root),
        service_manager: Arc::new(service_manager),
        rate_limits: Arc::new(rate_limits),
        registry,
        this_unit_name: Arc::new(UnitNameCache::new()),
        _classifier: classifier,
    })
}

/// Best-effort teardown: remove the control socket so a restart doesn't find
/// a stale file. Loaded interface qdiscs/filters outlive the daemon, same as
/// an `ip link set down` would — picking them back up at the next startup is
/// handled by `configure_interfaces`'s retry-once-after-delete-stale policy.
pub async fn shutdown(daemon: &Daemon) {
    info!("shutting down");
    if daemon.config.socket_path.exists() {
        let _ = std::fs::remove_file(&daemon.config.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_error_converts_to_internal_daemon_error() {
        let err = DaemonError::from(LifecycleError::MissingIfaces);
        assert!(matches!(err, DaemonError::Internal(_)));
    }
}
