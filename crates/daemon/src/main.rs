// SPDX-License-Identifier: MIT

//! `traffic-limitd` entrypoint (spec.md §4.I): startup, the connection-accept
//! loop, and graceful shutdown on SIGINT/SIGTERM or idle timeout.

use std::os::fd::{FromRawFd, RawFd};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use traffic_limitd::lifecycle::{self, Config};
use traffic_limitd::orchestrator::{self, OrchestratorDeps};
use traffic_limitd_core::InterruptReason;

/// Socket-activated fd (sd_listen_fds(3) with `LISTEN_FDS=1`); this daemon is
/// only ever started via systemd socket activation, never a bare listen().
const SD_LISTEN_FDS_START: RawFd = 3;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_tracing(config.running_under_systemd);

    let daemon = lifecycle::startup(config).await?;
    let deps = Arc::new(OrchestratorDeps {
        service_manager: daemon.service_manager.clone(),
        rate_limits: daemon.rate_limits.clone(),
        cgroup_root: daemon.cgroup_root.clone(),
        registry: daemon.registry.clone(),
        this_unit_name: daemon.this_unit_name.clone(),
        io_timeout: daemon.config.io_timeout,
    });

    // SAFETY: systemd guarantees fd 3 is the bound SEQPACKET socket when it
    // invoked us with `LISTEN_FDS=1`.
    let listener = unsafe { tokio_seqpacket::UnixSeqpacketListener::from_raw_fd(SD_LISTEN_FDS_START) };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let idle_exit = tokio::time::sleep(daemon.config.idle_exit_timeout);
    tokio::pin!(idle_exit);

    tracing::info!("READY");

    loop {
        tokio::select! {
            biased;
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(socket) => {
                        let deps = deps.clone();
                        tokio::spawn(orchestrator::handle_connection(socket, deps));
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
            () = &mut idle_exit, if daemon.registry.active_count() == 0 => {
                tracing::info!("idle-exit timer fired with no active connections");
                break;
            }
        }
    }

    daemon.registry.interrupter().interrupt_all(InterruptReason::Shutdown);
    tracing::info!("waiting for in-flight sessions to drain");
    daemon.registry.wait_drained().await;
    lifecycle::shutdown(&daemon).await;
    Ok(())
}

fn init_tracing(running_under_systemd: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if running_under_systemd {
        // journald already timestamps and tags by unit; a bare level prefix
        // avoids doubling up on both.
        builder.without_time().with_target(false).init();
    } else {
        builder.init();
    }
}
