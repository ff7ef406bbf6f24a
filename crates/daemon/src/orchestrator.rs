// SPDX-License-Identifier: MIT

//! Per-connection state machine (spec.md §4.H):
//!
//! ```text
//! init_stream -> admission -> learn_self_unit -> start_scope
//!   -> watch_child -> discover_cgroup_id -> install_placeholder_rule
//!   -> recv_request -> install_real_rule -> ack_proceed
//!   -> await_child_exit -> kill_scope -> done
//! ```
//!
//! One task per connection (spawned by the listener), cleanups registered in
//! LIFO order on a `CleanupStack` so any interrupt unwinds exactly as if the
//! session had run to completion.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use traffic_limitd_core::{
    random_hex_id, CleanupStack, DaemonError, FailReason, InterruptHandle, InterruptReason,
    TaskRegistry,
};
use traffic_limitd_ebpf_common::RateLimit;
use traffic_limitd_wire::Message;

use crate::cgroup::CgroupIdResolver;
use crate::pidfd::PidFd;
use crate::ratelimit::RateLimitTable;
use crate::scope::{ScopeExtras, ServiceManager};
use crate::stream::FramedStream;

/// Single-writer cache of the daemon's own unit name (spec.md §3 `Daemon`,
/// §4.H step 3). Multiple concurrent resolvers may race the lookup; the
/// first to store wins and the rest discard their (identical) result.
#[derive(Default)]
pub struct UnitNameCache(Mutex<Option<String>>);

impl UnitNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }

    /// Store `name` only if nobody has won yet. Returns whether this call won.
    pub fn store_if_empty(&self, name: String) -> bool {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(name);
            true
        } else {
            false
        }
    }
}

pub struct OrchestratorDeps<S, T, C> {
    pub service_manager: Arc<S>,
    pub rate_limits: Arc<T>,
    pub cgroup_root: Arc<C>,
    pub registry: Arc<TaskRegistry>,
    pub this_unit_name: Arc<UnitNameCache>,
    pub io_timeout: Duration,
}

/// Run one connection to completion. Never propagates an error — all
/// failures are logged with the task's id and, where possible, surfaced to
/// the client as a `FAIL` frame (spec.md §7 "All failures are logged with
/// level ERROR and a task-id tag... Connection-handling errors are not fatal
/// to the daemon").
pub async fn handle_connection<S, T, C>(
    socket: tokio_seqpacket::UnixSeqpacket,
    deps: Arc<OrchestratorDeps<S, T, C>>,
) where
    S: ServiceManager,
    T: RateLimitTable,
    C: CgroupIdResolver,
{
    let task_id = random_hex_id();
    let span = tracing::info_span!("connection", task_id = %task_id);
    let _enter = span.enter();

    let mut stream = match FramedStream::new(socket) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to initialize framed stream");
            return;
        }
    };
    let peer = stream.peer();
    info!(pid = peer.pid, uid = peer.uid, "connection accepted");

    // Step 2: admission.
    if !deps.registry.try_admit() {
        warn!("admission rejected: at MAX_NR_TASKS capacity");
        let _ = stream.send(&Message::Fail { reason: FailReason::NoResource }, deps.io_timeout).await;
        stream.shutdown().await;
        return;
    }

    let mut interrupt = deps.registry.handle();
    let mut cleanup = CleanupStack::new();
    cleanup.push({
        let registry = deps.registry.clone();
        move || registry.release()
    });

    if let Err(reason) = run_session(&mut stream, &deps, &mut interrupt, &mut cleanup, peer.pid).await {
        error!(error = %reason, "session ended");
    }

    stream.shutdown().await;
    // `cleanup` discharges LIFO on drop here: rule unset (if installed),
    // pidfd close, scope kill, admission release.
}

async fn run_session<S, T, C>(
    stream: &mut FramedStream,
    deps: &Arc<OrchestratorDeps<S, T, C>>,
    interrupt: &mut InterruptHandle,
    cleanup: &mut CleanupStack,
    peer_pid: u32,
) -> Result<(), DaemonError>
where
    S: ServiceManager,
    T: RateLimitTable,
    C: CgroupIdResolver,
{
    // Step 3: learn the daemon's own unit (best-effort; absence just means
    // the scope is created without After=/BindsTo=self).
    if deps.this_unit_name.get().is_none() {
        match race(deps.service_manager.get_unit_by_pid(std::process::id()), interrupt).await {
            Ok(Ok(unit_path)) => {
                deps.this_unit_name.store_if_empty(unit_path.as_str().to_string());
            }
            Ok(Err(e)) => warn!(error = %e, "could not resolve daemon's own unit name"),
            Err(reason) => return fail_and_interrupt(stream, reason).await,
        }
    }
    let self_unit = deps.this_unit_name.get();

    // Step 4: start the transient scope.
    let extras = ScopeExtras {
        after: self_unit.clone().into_iter().collect(),
        binds_to: self_unit.into_iter().collect(),
        send_sighup: true,
    };
    let (scope_name, scope_object) =
        match race(deps.service_manager.start_transient_scope(peer_pid, extras), interrupt).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => return Err(DaemonError::ServiceManager(e.to_string())),
            Err(reason) => return fail_and_interrupt(stream, reason).await,
        };
    info!(scope = %scope_name, "transient scope created");
    cleanup.push({
        let service_manager = deps.service_manager.clone();
        let scope_object = scope_object.clone();
        move || {
            tokio::spawn(async move {
                if let Err(e) = service_manager.kill_unit(&scope_object, "all", libc::SIGKILL).await
                {
                    warn!(error = %e, "failed to kill scope during cleanup");
                }
            });
        }
    });

    // Step 5: watch the peer process for exit via pidfd.
    let mut pidfd = PidFd::open(peer_pid).map_err(|e| DaemonError::Internal(e.to_string()))?;

    // Step 6: discover the scope's cgroup id.
    let control_group = match race(deps.service_manager.get_control_group(&scope_object), interrupt).await
    {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => return Err(DaemonError::ServiceManager(e.to_string())),
        Err(reason) => return fail_and_interrupt(stream, reason).await,
    };
    let relative = control_group.trim_start_matches('/');
    let cg_id = deps.cgroup_root.path_to_id(Path::new(relative))?;

    // Step 7: placeholder rule reserves the map slot before we trust the
    // client's request (spec.md §4.H step 7).
    deps.rate_limits
        .set(cg_id, RateLimit::UNLIMITED)
        .await
        .map_err(|_| DaemonError::TableFull)?;
    cleanup.push({
        let rate_limits = deps.rate_limits.clone();
        move || {
            tokio::spawn(async move {
                let _ = rate_limits.unset(cg_id).await;
            });
        }
    });

    // Step 8: read the REQ frame with a 300ms timeout (spec.md §4.H step 8).
    let req = match stream.recv(deps.io_timeout).await {
        Ok(Some(Message::Req(attr))) => attr,
        Ok(Some(_other)) => {
            return client_error(stream, "expected REQ as first message").await;
        }
        Ok(None) => return client_error(stream, "client closed before sending REQ").await,
        Err(e) => return client_error(stream, &format!("malformed or late REQ frame: {e}")).await,
    };

    // Step 9: install the real rule.
    let rate = RateLimit {
        byte_rate: req.normalized_byte_rate(),
        packet_rate: req.normalized_packet_rate(),
    };
    deps.rate_limits.set(cg_id, rate).await.map_err(|_| DaemonError::TableFull)?;

    // Step 10: LOG then PROCEED.
    let message = format!(
        "Start task with ratelimit bps={}, pps={}",
        rate.byte_rate, rate.packet_rate
    );
    let _ = stream.send(&Message::Log(message.into_bytes()), deps.io_timeout).await;
    stream.send(&Message::Proceed, deps.io_timeout).await.map_err(|e| DaemonError::Internal(e.to_string()))?;
    stream.shutdown().await;

    // Step 11: wait for child exit or interrupt.
    tokio::select! {
        biased;
        reason = interrupt.wait_for_interrupt() => {
            interrupt.set_disabled(true);
            warn!(?reason, "interrupted while awaiting child exit");
        }
        _ = pidfd.wait_for_exit() => {
            info!("peer process exited");
        }
    }

    // Step 12: reap stragglers.
    if let Err(e) = deps.service_manager.kill_unit(&scope_object, "all", libc::SIGKILL).await {
        warn!(error = %e, "final scope kill failed");
    }

    Ok(())
}

/// Race `fut` against the interrupt broadcast; `Err` carries the reason the
/// task was woken early (spec.md §4.A `wait`'s cancellation path).
async fn race<F, O>(fut: F, interrupt: &mut InterruptHandle) -> Result<O, InterruptReason>
where
    F: std::future::Future<Output = O>,
{
    tokio::select! {
        biased;
        reason = interrupt.wait_for_interrupt() => Err(reason),
        out = fut => Ok(out),
    }
}

/// Interrupt during steps 3-11: disable further interrupts, tell the client
/// if the stream is still open, and propagate (spec.md §4.H "Interrupt
/// handling").
async fn fail_and_interrupt(
    stream: &mut FramedStream,
    reason: InterruptReason,
) -> Result<(), DaemonError> {
    let _ = stream.send(&Message::Fail { reason: FailReason::Internal }, Duration::from_millis(50)).await;
    Err(DaemonError::Interrupted(reason))
}

/// A malformed/absent/late REQ is the client's fault (spec.md §7: "yield
/// YOUR_ERROR only if the client had the last expected write").
async fn client_error(stream: &mut FramedStream, detail: &str) -> Result<(), DaemonError> {
    warn!(detail, "client error");
    let _ = stream
        .send(&Message::Log(format!("Client Error: {detail}").into_bytes()), Duration::from_millis(50))
        .await;
    let _ = stream.send(&Message::Fail { reason: FailReason::YourError }, Duration::from_millis(50)).await;
    Err(DaemonError::YourError(detail.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_seqpacket::UnixSeqpacket;

    #[test]
    fn unit_name_cache_is_single_writer() {
        let cache = UnitNameCache::new();
        assert!(cache.store_if_empty("daemon.service".to_string()));
        assert!(!cache.store_if_empty("other.service".to_string()));
        assert_eq!(cache.get().as_deref(), Some("daemon.service"));
    }

    #[test]
    fn admission_rejects_beyond_cap() {
        let registry = TaskRegistry::new(1);
        assert!(registry.try_admit());
        assert!(!registry.try_admit());
        registry.release();
        assert!(registry.try_admit());
    }

    #[tokio::test]
    async fn client_error_logs_then_sends_fail_your_error() {
        let (a, mut b) = UnixSeqpacket::pair().unwrap();
        let mut stream = FramedStream::new(a).unwrap();

        let result = client_error(&mut stream, "header-only frame").await;
        assert!(matches!(result, Err(DaemonError::YourError(_))));

        let mut buf = [0u8; 512];
        let n = b.recv(&mut buf).await.unwrap();
        let log = traffic_limitd_wire::decode(&buf[..n]).unwrap();
        assert!(matches!(log, Message::Log(_)));
        let n = b.recv(&mut buf).await.unwrap();
        let fail = traffic_limitd_wire::decode(&buf[..n]).unwrap();
        assert_eq!(fail, Message::Fail { reason: FailReason::YourError });
    }

    #[tokio::test]
    async fn fail_and_interrupt_sends_internal_fail_and_propagates_reason() {
        let (a, mut b) = UnixSeqpacket::pair().unwrap();
        let mut stream = FramedStream::new(a).unwrap();

        let result = fail_and_interrupt(&mut stream, InterruptReason::Shutdown).await;
        assert!(matches!(result, Err(DaemonError::Interrupted(InterruptReason::Shutdown))));

        let mut buf = [0u8; 512];
        let n = b.recv(&mut buf).await.unwrap();
        let fail = traffic_limitd_wire::decode(&buf[..n]).unwrap();
        assert_eq!(fail, Message::Fail { reason: FailReason::Internal });
    }

    fn test_deps(
        service_manager: crate::scope::FakeServiceManager,
        max_tasks: usize,
    ) -> (
        Arc<OrchestratorDeps<crate::scope::FakeServiceManager, crate::ratelimit::InMemoryRateLimitTable, crate::cgroup::FakeCgroupIdResolver>>,
        Arc<TaskRegistry>,
    ) {
        let registry = TaskRegistry::new(max_tasks);
        let deps = Arc::new(OrchestratorDeps {
            service_manager: Arc::new(service_manager),
            rate_limits: Arc::new(crate::ratelimit::InMemoryRateLimitTable::new(4)),
            cgroup_root: Arc::new(crate::cgroup::FakeCgroupIdResolver::new()),
            registry: registry.clone(),
            this_unit_name: Arc::new(UnitNameCache::new()),
            io_timeout: Duration::from_millis(200),
        });
        (deps, registry)
    }

    /// spec.md §8 scenario 1: happy path end-to-end through `run_session`,
    /// against `FakeServiceManager`/`InMemoryRateLimitTable`/
    /// `FakeCgroupIdResolver` — no root, systemd, or real network interface.
    #[tokio::test]
    async fn happy_path_runs_full_session_to_completion() {
        let mut child = std::process::Command::new("sh").args(["-c", "sleep 0.05"]).spawn().unwrap();
        let child_pid = child.id();

        let service_manager = crate::scope::FakeServiceManager::new();
        service_manager.set_control_group(0, "/traffic-limitd-scope-happy.scope");
        let (deps, _registry) = test_deps(service_manager.clone(), 4);

        let (server, mut client) = UnixSeqpacket::pair().unwrap();
        let mut stream = FramedStream::new(server).unwrap();
        let mut interrupt = deps.registry.handle();
        let mut cleanup = CleanupStack::new();

        let req = traffic_limitd_wire::ReqAttr { byte_rate: 125_000, packet_rate: 0, flags: 0 };
        client.send(&traffic_limitd_wire::encode(&Message::Req(req))).await.unwrap();

        let session = run_session(&mut stream, &deps, &mut interrupt, &mut cleanup, child_pid);
        let drain_client = async {
            let mut buf = [0u8; 512];
            let n = client.recv(&mut buf).await.unwrap();
            assert!(matches!(traffic_limitd_wire::decode(&buf[..n]).unwrap(), Message::Log(_)));
            let n = client.recv(&mut buf).await.unwrap();
            assert_eq!(traffic_limitd_wire::decode(&buf[..n]).unwrap(), Message::Proceed);
        };

        let (result, ()) =
            tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(session, drain_client) })
                .await
                .expect("session timed out");
        assert!(result.is_ok(), "unexpected error: {result:?}");
        assert_eq!(service_manager.kills().len(), 1, "scope must be killed once the child exits");

        let _ = child.wait();
    }

    /// spec.md §8 scenario 2: a header-only/truncated frame produces a
    /// client-facing `LOG` followed by `FAIL{YourError}`.
    #[tokio::test]
    async fn malformed_request_sends_your_error() {
        let service_manager = crate::scope::FakeServiceManager::new();
        service_manager.set_control_group(0, "/traffic-limitd-scope-bad.scope");
        let (deps, _registry) = test_deps(service_manager, 4);

        let (server, mut client) = UnixSeqpacket::pair().unwrap();
        let handle = tokio::spawn(handle_connection(server, deps));

        // A REQ-typed frame whose declared length matches the 8-byte header
        // alone — too short for the 24-byte `ReqAttr` payload.
        let mut frame = [0u8; 8];
        frame[0..4].copy_from_slice(&8u32.to_ne_bytes());
        client.send(&frame).await.unwrap();

        let mut buf = [0u8; 512];
        let n = client.recv(&mut buf).await.unwrap();
        assert!(matches!(traffic_limitd_wire::decode(&buf[..n]).unwrap(), Message::Log(_)));
        let n = client.recv(&mut buf).await.unwrap();
        assert_eq!(
            traffic_limitd_wire::decode(&buf[..n]).unwrap(),
            Message::Fail { reason: FailReason::YourError }
        );

        handle.await.unwrap();
    }

    /// spec.md §8 scenario 3: a connection arriving at `MAX_NR_TASKS`
    /// receives `FAIL{NoResource}` immediately, without touching the
    /// service manager at all.
    #[tokio::test]
    async fn admission_exceeded_sends_fail_noresource() {
        let (deps, _registry) = test_deps(crate::scope::FakeServiceManager::new(), 0);

        let (server, mut client) = UnixSeqpacket::pair().unwrap();
        handle_connection(server, deps).await;

        let mut buf = [0u8; 512];
        let n = client.recv(&mut buf).await.unwrap();
        assert_eq!(
            traffic_limitd_wire::decode(&buf[..n]).unwrap(),
            Message::Fail { reason: FailReason::NoResource }
        );
    }

    /// spec.md §8 scenario 4: a `Shutdown` interrupt raised while awaiting
    /// child exit (after `PROCEED` already closed the stream) still kills
    /// the scope and lets the session complete without propagating an
    /// error — the stream is already gone by then, so no extra `FAIL` is
    /// owed to a client that has already been told to proceed.
    #[tokio::test]
    async fn shutdown_interrupt_during_await_child_exit_kills_scope() {
        let mut child = std::process::Command::new("sh").args(["-c", "sleep 5"]).spawn().unwrap();
        let child_pid = child.id();

        let service_manager = crate::scope::FakeServiceManager::new();
        service_manager.set_control_group(0, "/traffic-limitd-scope-shutdown.scope");
        let (deps, registry) = test_deps(service_manager.clone(), 4);

        let (server, mut client) = UnixSeqpacket::pair().unwrap();
        let mut stream = FramedStream::new(server).unwrap();
        let mut interrupt = deps.registry.handle();
        let mut cleanup = CleanupStack::new();

        let req = traffic_limitd_wire::ReqAttr { byte_rate: 0, packet_rate: 0, flags: 0 };
        client.send(&traffic_limitd_wire::encode(&Message::Req(req))).await.unwrap();

        let session = run_session(&mut stream, &deps, &mut interrupt, &mut cleanup, child_pid);
        let drive = async {
            let mut buf = [0u8; 512];
            let n = client.recv(&mut buf).await.unwrap();
            assert!(matches!(traffic_limitd_wire::decode(&buf[..n]).unwrap(), Message::Log(_)));
            let n = client.recv(&mut buf).await.unwrap();
            assert_eq!(traffic_limitd_wire::decode(&buf[..n]).unwrap(), Message::Proceed);
            // Give the session a moment to reach the await-child-exit step.
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.interrupter().interrupt_all(InterruptReason::Shutdown);
        };

        let (result, ()) =
            tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(session, drive) })
                .await
                .expect("session timed out");
        assert!(result.is_ok(), "unexpected error: {result:?}");
        assert_eq!(service_manager.kills().len(), 1);

        let _ = child.kill();
        let _ = child.wait();
    }
}
