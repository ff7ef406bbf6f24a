// SPDX-License-Identifier: MIT

//! Service-manager RPC (spec.md §4.D): transient scope creation and teardown
//! over `org.freedesktop.systemd1`, abstracted behind a `ServiceManager`
//! trait the same way agent process management is abstracted behind an
//! adapter trait elsewhere in this codebase — a production
//! `SystemdServiceManager` backed by `zbus`,
//! and a `FakeServiceManager` the orchestrator's tests drive without a real
//! bus connection.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};
use zbus::Connection;

use traffic_limitd_core::random_hex_id;

const SYSTEMD_DEST: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_IFACE: &str = "org.freedesktop.systemd1.Manager";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";
const DBUS_DEST: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const DBUS_IFACE: &str = "org.freedesktop.DBus";

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("bus call failed: {0}")]
    Bus(String),
    #[error("bus disconnected before job completed")]
    Disconnected,
    #[error("transient unit job finished with outcome {0:?}")]
    JobFailed(JobOutcome),
}

impl From<zbus::Error> for ScopeError {
    fn from(e: zbus::Error) -> Self {
        ScopeError::Bus(e.to_string())
    }
}

/// Outcome of a `JobRemoved` signal, mapped from its textual `result` field
/// (spec.md §4.D table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Cancelled,
    TimedOut,
    IoError,
    ExecError,
    ProtocolError,
    NotSupported,
    Stale,
    /// Bus disconnected before the job's `JobRemoved` arrived.
    ConnectionReset,
}

pub fn map_job_result(result: &str) -> JobOutcome {
    match result {
        "done" | "skipped" => JobOutcome::Done,
        "cancelled" | "collected" => JobOutcome::Cancelled,
        "timeout" => JobOutcome::TimedOut,
        "dependency" => JobOutcome::IoError,
        "invalid" => JobOutcome::ExecError,
        "assert" => JobOutcome::ProtocolError,
        "unsupported" => JobOutcome::NotSupported,
        "once" => JobOutcome::Stale,
        _ => JobOutcome::IoError,
    }
}

/// Extra unit properties the orchestrator wants set on top of the base set
/// `start_transient_scope` always installs (spec.md §4.D step (f)).
#[derive(Debug, Clone, Default)]
pub struct ScopeExtras {
    pub after: Vec<String>,
    pub binds_to: Vec<String>,
    pub send_sighup: bool,
}

/// Abstraction over `org.freedesktop.systemd1` the orchestrator drives.
/// Production code talks to the real bus; tests drive `FakeServiceManager`.
#[async_trait]
pub trait ServiceManager: Send + Sync + 'static {
    /// `Manager.GetUnitByPID` (spec.md §4.D step (a)).
    async fn get_unit_by_pid(&self, pid: u32) -> Result<OwnedObjectPath, ScopeError>;

    /// Read a unit's `Slice` property (spec.md §4.D step (b)).
    async fn get_slice(&self, unit: &OwnedObjectPath) -> Result<String, ScopeError>;

    /// Read the scope's `ControlGroup` sub-property (spec.md §4.D
    /// `unit_get_subprop`, §4.H step 6).
    async fn get_control_group(&self, unit: &OwnedObjectPath) -> Result<String, ScopeError>;

    /// `Manager.StartTransientUnit` plus the job-wait dance (spec.md §4.D
    /// `start_transient_scope`). Returns `(scope_name, scope_object_path)`.
    async fn start_transient_scope(
        &self,
        peer_pid: u32,
        extra: ScopeExtras,
    ) -> Result<(String, OwnedObjectPath), ScopeError>;

    /// `Unit.Kill(who="all", signal=SIGKILL)` (spec.md §4.H step 12).
    async fn kill_unit(&self, unit: &OwnedObjectPath, who: &str, signal: i32) -> Result<(), ScopeError>;
}

/// Production `ServiceManager` talking to the system bus via `zbus`.
pub struct SystemdServiceManager {
    conn: Connection,
    scope_prefix: String,
}

impl SystemdServiceManager {
    pub async fn connect(scope_prefix: impl Into<String>) -> Result<Self, ScopeError> {
        let conn = Connection::system().await?;
        let this = Self { conn, scope_prefix: scope_prefix.into() };
        this.subscribe_to_job_removed().await?;
        Ok(this)
    }

    /// `Manager.Subscribe` plus an `AddMatch` for `JobRemoved`, awaited to
    /// completion before any caller can start a job (spec.md §4.D "Job
    /// waiter" step 1; §9 "`slot_job_removed`... must be awaited before
    /// issuing the method call that creates the job"). Without this, the bus
    /// never routes broadcast `JobRemoved` signals to this connection at
    /// all, not just late.
    async fn subscribe_to_job_removed(&self) -> Result<(), ScopeError> {
        let _: () = self.call_method(SYSTEMD_PATH, MANAGER_IFACE, "Subscribe", ()).await?;
        let match_rule = format!(
            "type='signal',sender='{SYSTEMD_DEST}',interface='{MANAGER_IFACE}',member='JobRemoved',path='{SYSTEMD_PATH}'"
        );
        let _: () = self
            .call_method_at(DBUS_DEST, DBUS_PATH, DBUS_IFACE, "AddMatch", (match_rule,))
            .await?;
        Ok(())
    }

    async fn call_method<T>(
        &self,
        path: &str,
        iface: &str,
        member: &str,
        body: impl zbus::zvariant::DynamicType + serde::Serialize,
    ) -> Result<T, ScopeError>
    where
        T: serde::de::DeserializeOwned + zbus::zvariant::Type,
    {
        self.call_method_at(SYSTEMD_DEST, path, iface, member, body).await
    }

    async fn call_method_at<T>(
        &self,
        destination: &str,
        path: &str,
        iface: &str,
        member: &str,
        body: impl zbus::zvariant::DynamicType + serde::Serialize,
    ) -> Result<T, ScopeError>
    where
        T: serde::de::DeserializeOwned + zbus::zvariant::Type,
    {
        let reply = self
            .conn
            .call_method(Some(destination), path, Some(iface), member, &body)
            .await?;
        Ok(reply.body().deserialize()?)
    }

    async fn get_property(
        &self,
        path: &str,
        iface: &str,
        member: &str,
    ) -> Result<OwnedValue, ScopeError> {
        self.call_method::<OwnedValue>(path, PROPERTIES_IFACE, "Get", (iface, member)).await
    }

    /// `unit_get_subprop`: resolve `Id` first to pick the `Scope`/`Service`
    /// sub-interface, then proxy `Properties.Get` through it.
    async fn get_unit_subprop(&self, unit: &OwnedObjectPath, member: &str) -> Result<String, ScopeError> {
        let id: String = self
            .get_property(unit.as_str(), "org.freedesktop.systemd1.Unit", "Id")
            .await?
            .try_into()
            .map_err(|_| ScopeError::Bus("Id property was not a string".to_string()))?;
        let sub_iface = if id.ends_with(".scope") {
            "org.freedesktop.systemd1.Scope"
        } else {
            "org.freedesktop.systemd1.Service"
        };
        let value = self.get_property(unit.as_str(), sub_iface, member).await?;
        value.try_into().map_err(|_| ScopeError::Bus(format!("{member} was not a string")))
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn get_unit_by_pid(&self, pid: u32) -> Result<OwnedObjectPath, ScopeError> {
        self.call_method(SYSTEMD_PATH, MANAGER_IFACE, "GetUnitByPID", (pid,)).await
    }

    async fn get_slice(&self, unit: &OwnedObjectPath) -> Result<String, ScopeError> {
        let value = self.get_property(unit.as_str(), "org.freedesktop.systemd1.Unit", "Slice").await?;
        value.try_into().map_err(|_| ScopeError::Bus("Slice property was not a string".to_string()))
    }

    async fn get_control_group(&self, unit: &OwnedObjectPath) -> Result<String, ScopeError> {
        self.get_unit_subprop(unit, "ControlGroup").await
    }

    async fn start_transient_scope(
        &self,
        peer_pid: u32,
        extra: ScopeExtras,
    ) -> Result<(String, OwnedObjectPath), ScopeError> {
        let caller_unit = self.get_unit_by_pid(peer_pid).await?;
        let slice = self.get_slice(&caller_unit).await?;
        let name = format!("{}-{}.scope", self.scope_prefix, random_hex_id());

        let mut properties: Vec<(&str, Value)> = vec![
            ("CollectMode", Value::new("inactive-or-failed")),
            ("Slice", Value::new(slice)),
            ("PIDs", Value::new(vec![peer_pid])),
        ];
        if !extra.after.is_empty() {
            properties.push(("After", Value::new(extra.after)));
        }
        if !extra.binds_to.is_empty() {
            properties.push(("BindsTo", Value::new(extra.binds_to)));
        }
        if extra.send_sighup {
            properties.push(("SendSIGHUP", Value::new(true)));
        }
        let aux: Vec<(&str, Vec<(&str, Value)>)> = Vec::new();

        // `subscribe_to_job_removed` already ran (and was awaited) in
        // `connect`, so the bus is already routing `JobRemoved` to us; start
        // the stream before issuing the call so nothing arriving in between
        // is missed (spec.md §4.D "Job waiter" steps 1-2).
        let mut job_stream = zbus::MessageStream::from(&self.conn);

        let job_path: OwnedObjectPath = self
            .call_method(
                SYSTEMD_PATH,
                MANAGER_IFACE,
                "StartTransientUnit",
                (&name, "fail", properties, aux),
            )
            .await?;

        let outcome = wait_for_job(&mut job_stream, &job_path).await?;
        if outcome != JobOutcome::Done {
            return Err(ScopeError::JobFailed(outcome));
        }

        let scope_path: OwnedObjectPath =
            self.call_method(SYSTEMD_PATH, MANAGER_IFACE, "GetUnit", (&name,)).await?;
        Ok((name, scope_path))
    }

    async fn kill_unit(&self, unit: &OwnedObjectPath, who: &str, signal: i32) -> Result<(), ScopeError> {
        let _: () = self
            .call_method(unit.as_str(), "org.freedesktop.systemd1.Unit", "Kill", (who, signal))
            .await?;
        Ok(())
    }
}

/// Wait for the `JobRemoved` signal matching `job_path`, or report
/// `ConnectionReset` if the stream ends first (spec.md §4.D "On bus
/// disconnect before resolution... disconnected").
async fn wait_for_job(
    stream: &mut zbus::MessageStream,
    job_path: &OwnedObjectPath,
) -> Result<JobOutcome, ScopeError> {
    while let Ok(Some(msg)) = stream.try_next().await {
        let header = msg.header();
        if header.member().map(|m| m.as_str()) != Some("JobRemoved") {
            continue;
        }
        let Ok((_id, job, _unit, result)) =
            msg.body().deserialize::<(u32, OwnedObjectPath, String, String)>()
        else {
            continue;
        };
        if &job == job_path {
            return Ok(map_job_result(&result));
        }
    }
    Ok(JobOutcome::ConnectionReset)
}

/// Test double for `ServiceManager`: no bus, no systemd, just enough state
/// to drive the orchestrator's state machine end-to-end (spec.md §8
/// scenarios 1-4).
#[derive(Clone, Default)]
pub struct FakeServiceManager {
    inner: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    scopes: HashMap<String, FakeScope>,
    next_scope_id: u64,
    kills: Vec<(String, String, i32)>,
}

struct FakeScope {
    object_path: OwnedObjectPath,
    control_group: String,
}

impl FakeServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preconfigure the `ControlGroup` path a future scope should report,
    /// keyed by the scope's 0-based creation order. A no-op if `index` can't
    /// round-trip into an object path, which never happens for the all-digit
    /// suffixes this module produces.
    pub fn set_control_group(&self, index: u64, path: impl Into<String>) {
        let Ok(object_path) = OwnedObjectPath::try_from(format!("/fake/scope/{index}")) else {
            return;
        };
        let mut state = self.inner.lock();
        state
            .scopes
            .entry(format!("scope-{index}"))
            .or_insert_with(|| FakeScope { object_path, control_group: String::new() })
            .control_group = path.into();
    }

    pub fn kills(&self) -> Vec<(String, String, i32)> {
        self.inner.lock().kills.clone()
    }

    pub fn scope_count(&self) -> usize {
        self.inner.lock().scopes.len()
    }
}

#[async_trait]
impl ServiceManager for FakeServiceManager {
    async fn get_unit_by_pid(&self, _pid: u32) -> Result<OwnedObjectPath, ScopeError> {
        OwnedObjectPath::try_from("/fake/caller-unit").map_err(|e| ScopeError::Bus(e.to_string()))
    }

    async fn get_slice(&self, _unit: &OwnedObjectPath) -> Result<String, ScopeError> {
        Ok("user.slice".to_string())
    }

    async fn get_control_group(&self, unit: &OwnedObjectPath) -> Result<String, ScopeError> {
        let state = self.inner.lock();
        state
            .scopes
            .values()
            .find(|s| &s.object_path == unit)
            .map(|s| s.control_group.clone())
            .ok_or_else(|| ScopeError::Bus("unknown fake scope".to_string()))
    }

    async fn start_transient_scope(
        &self,
        _peer_pid: u32,
        _extra: ScopeExtras,
    ) -> Result<(String, OwnedObjectPath), ScopeError> {
        let mut state = self.inner.lock();
        let index = state.next_scope_id;
        state.next_scope_id += 1;
        let name = format!("scope-{index}");
        let object_path = OwnedObjectPath::try_from(format!("/fake/scope/{index}"))
            .map_err(|e| ScopeError::Bus(e.to_string()))?;
        let control_group =
            state.scopes.get(&name).map(|s| s.control_group.clone()).unwrap_or_else(|| format!("/{name}"));
        state.scopes.insert(
            name.clone(),
            FakeScope { object_path: object_path.clone(), control_group },
        );
        Ok((name, object_path))
    }

    async fn kill_unit(&self, unit: &OwnedObjectPath, who: &str, signal: i32) -> Result<(), ScopeError> {
        self.inner.lock().kills.push((unit.as_str().to_string(), who.to_string(), signal));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_job_result_per_table() {
        assert_eq!(map_job_result("done"), JobOutcome::Done);
        assert_eq!(map_job_result("skipped"), JobOutcome::Done);
        assert_eq!(map_job_result("cancelled"), JobOutcome::Cancelled);
        assert_eq!(map_job_result("collected"), JobOutcome::Cancelled);
        assert_eq!(map_job_result("timeout"), JobOutcome::TimedOut);
        assert_eq!(map_job_result("dependency"), JobOutcome::IoError);
        assert_eq!(map_job_result("invalid"), JobOutcome::ExecError);
        assert_eq!(map_job_result("assert"), JobOutcome::ProtocolError);
        assert_eq!(map_job_result("unsupported"), JobOutcome::NotSupported);
        assert_eq!(map_job_result("once"), JobOutcome::Stale);
        assert_eq!(map_job_result("something-weird"), JobOutcome::IoError);
    }

    #[tokio::test]
    async fn fake_service_manager_round_trips_scope_lifecycle() {
        let mgr = FakeServiceManager::new();
        mgr.set_control_group(0, "/traffic-limitd-scope-abc.scope");

        let (name, object_path) =
            mgr.start_transient_scope(1234, ScopeExtras::default()).await.unwrap();
        assert_eq!(name, "scope-0");

        let cgroup = mgr.get_control_group(&object_path).await.unwrap();
        assert_eq!(cgroup, "/traffic-limitd-scope-abc.scope");

        mgr.kill_unit(&object_path, "all", 9).await.unwrap();
        assert_eq!(mgr.kills(), vec![(object_path.as_str().to_string(), "all".to_string(), 9)]);
    }
}
