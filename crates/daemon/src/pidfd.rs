// SPDX-License-Identifier: MIT

//! Watches a foreign process (the connecting client, identified by
//! `SO_PEERCRED`) for exit via `pidfd_open(2)` (spec.md §4.H step 5).
//!
//! The daemon never spawns this process itself — the client `exec`s its
//! target command in place only after receiving `PROCEED` — so there is no
//! `std`/`tokio` child handle to wait on; a pidfd is the only portable way to
//! watch an unrelated pid for exit without racing on pid reuse.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;

/// An open pidfd for a process we didn't spawn. Readable once the process
/// has exited.
pub struct PidFd {
    inner: AsyncFd<OwnedFd>,
}

impl PidFd {
    pub fn open(pid: u32) -> io::Result<Self> {
        // SAFETY: `pidfd_open` takes a pid and flags (0 here) and returns an
        // owned fd on success, -1/errno on failure; no pointers involved.
        let raw: RawFd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) } as RawFd;
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a valid, just-opened, uniquely-owned descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { inner: AsyncFd::new(fd)? })
    }

    /// Resolves once the process has exited (the fd becomes readable).
    pub async fn wait_for_exit(&mut self) {
        loop {
            let mut guard = match self.inner.readable().await {
                Ok(guard) => guard,
                Err(_) => return,
            };
            // pidfds never actually yield readable bytes; readiness alone
            // signals process exit. `try_io` just clears the ready state.
            let result = guard.try_io(|_| Ok(()));
            if result.is_ok() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for PidFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidFd").field("fd", &self.inner.get_ref().as_raw_fd()).finish()
    }
}
