// SPDX-License-Identifier: MIT

//! Netlink/TC setup (spec.md §4.F). Runs once at startup, synchronously,
//! before the reactor starts: installs `fq`/`mq` queueing disciplines and
//! attaches the classifier as a `clsact` egress filter on every interface in
//! `IFACES`.

use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::tc::TcHandle;
use rtnetlink::Handle;
use traffic_limitd_core::DaemonError;

/// Priority the classifier filter is installed at (spec.md §4.F step 5).
const FILTER_PRIORITY: u16 = 49151;
/// Filter handle (spec.md §4.F step 5).
const FILTER_HANDLE: u32 = 1;
/// Special `clsact` parent handle.
const CLSACT_PARENT: u32 = TcHandle::CLSACT.into_u32();

/// Set up egress pacing on every interface named in `IFACES`, attaching
/// `prog_fd` as the classifier (spec.md §4.F, step-numbered below).
pub async fn configure_interfaces(
    handle: &Handle,
    ifaces: &[String],
    prog_fd: std::os::fd::RawFd,
) -> Result<(), DaemonError> {
    for name in ifaces {
        configure_one(handle, name, prog_fd).await?;
    }
    Ok(())
}

async fn configure_one(handle: &Handle, name: &str, prog_fd: std::os::fd::RawFd) -> Result<(), DaemonError> {
    let index = link_index(handle, name).await?;
    let (num_tx_queues, root_kind) = link_queues_and_qdisc(handle, index).await?;

    // Step 2/3: root qdisc.
    if num_tx_queues <= 1 {
        if root_kind.as_deref() != Some("fq") {
            replace_root_qdisc(handle, index, "fq").await?;
        }
    } else {
        let root_handle = attach_mq_root(handle, index).await?;
        for queue in 1..=num_tx_queues {
            let child_handle = root_handle + queue;
            replace_child_qdisc(handle, index, (root_handle, queue), child_handle, "fq").await?;
        }
    }

    // Step 4: clsact, retrying once after deleting a stale instance.
    if let Err(first_err) = add_clsact(handle, index).await {
        tracing::debug!(iface = %name, error = %first_err, "clsact install failed, retrying after cleanup");
        let _ = delete_clsact(handle, index).await;
        add_clsact(handle, index).await?;
    }

    // Step 5: egress classifier filter, same retry-once policy.
    if let Err(first_err) = add_classifier_filter(handle, index, prog_fd).await {
        tracing::debug!(iface = %name, error = %first_err, "filter install failed, retrying after cleanup");
        let _ = delete_classifier_filter(handle, index).await;
        add_classifier_filter(handle, index, prog_fd).await?;
    }

    Ok(())
}

async fn link_index(handle: &Handle, name: &str) -> Result<u32, DaemonError> {
    use futures_util::TryStreamExt;
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| DaemonError::Netlink(e.to_string()))?
        .ok_or_else(|| DaemonError::Netlink(format!("interface {name} not found")))?;
    Ok(link.header.index)
}

async fn link_queues_and_qdisc(
    handle: &Handle,
    index: u32,
) -> Result<(u32, Option<String>), DaemonError> {
    use futures_util::TryStreamExt;
    let mut links = handle.link().get().match_index(index).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| DaemonError::Netlink(e.to_string()))?
        .ok_or_else(|| DaemonError::Netlink(format!("interface index {index} vanished")))?;

    let mut num_tx_queues = 1u32;
    let mut qdisc = None;
    for attr in &link.attributes {
        match attr {
            LinkAttribute::NumTxQueues(n) => num_tx_queues = *n,
            LinkAttribute::Qdisc(kind) => qdisc = Some(kind.clone()),
            _ => {}
        }
    }
    Ok((num_tx_queues, qdisc))
}

async fn replace_root_qdisc(handle: &Handle, index: u32, kind: &str) -> Result<(), DaemonError> {
    handle
        .qdisc()
        .add(index as i32)
        .root()
        .kind(kind.to_string())
        .execute()
        .await
        .map_err(|e| DaemonError::Netlink(format!("replace root qdisc with {kind}: {e}")))
}

/// Attach `mq` at root handle `1:`, falling back to `2:` if rejected (spec.md
/// §4.F step 3). Returns the handle that was accepted.
async fn attach_mq_root(handle: &Handle, index: u32) -> Result<u32, DaemonError> {
    for candidate in [1u32, 2u32] {
        let result = handle
            .qdisc()
            .add(index as i32)
            .root()
            .handle(candidate, 0)
            .kind("mq".to_string())
            .execute()
            .await;
        if result.is_ok() {
            return Ok(candidate);
        }
    }
    Err(DaemonError::Netlink("mq root rejected at both handle 1: and 2:".to_string()))
}

async fn replace_child_qdisc(
    handle: &Handle,
    index: u32,
    parent: (u32, u32),
    new_handle: u32,
    kind: &str,
) -> Result<(), DaemonError> {
    handle
        .qdisc()
        .add(index as i32)
        .parent(parent.0, parent.1)
        .handle(new_handle, 0)
        .kind(kind.to_string())
        .execute()
        .await
        .map_err(|e| DaemonError::Netlink(format!("replace child qdisc {new_handle}:: {e}")))
}

async fn add_clsact(handle: &Handle, index: u32) -> Result<(), DaemonError> {
    handle
        .qdisc()
        .add(index as i32)
        .parent(TcHandle::CLSACT.into_u32(), 0)
        .kind("clsact".to_string())
        .execute()
        .await
        .map_err(|e| DaemonError::Netlink(format!("add clsact: {e}")))
}

async fn delete_clsact(handle: &Handle, index: u32) -> Result<(), DaemonError> {
    handle
        .qdisc()
        .del(index as i32)
        .parent(CLSACT_PARENT, 0)
        .kind("clsact".to_string())
        .execute()
        .await
        .map_err(|e| DaemonError::Netlink(format!("delete clsact: {e}")))
}

async fn add_classifier_filter(
    handle: &Handle,
    index: u32,
    prog_fd: std::os::fd::RawFd,
) -> Result<(), DaemonError> {
    handle
        .traffic_filter(index as i32)
        .add()
        .parent(TcHandle::EGRESS.into_u32())
        .priority(FILTER_PRIORITY)
        .handle(FILTER_HANDLE)
        .protocol(libc::ETH_P_ALL as u16)
        .bpf(prog_fd)
        .direct_action()
        .execute()
        .await
        .map_err(|e| DaemonError::Netlink(format!("attach classifier filter: {e}")))
}

async fn delete_classifier_filter(handle: &Handle, index: u32) -> Result<(), DaemonError> {
    handle
        .traffic_filter(index as i32)
        .del()
        .parent(TcHandle::EGRESS.into_u32())
        .priority(FILTER_PRIORITY)
        .handle(FILTER_HANDLE)
        .execute()
        .await
        .map_err(|e| DaemonError::Netlink(format!("delete classifier filter: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mq_child_handles_are_offset_from_root() {
        // Matches spec.md §4.F step 3: "replace per-queue child... at handle
        // (i+root_handle):".
        let root = 1u32;
        let child_for_queue = |q: u32| root + q;
        assert_eq!(child_for_queue(1), 2);
        assert_eq!(child_for_queue(2), 3);
    }
}
