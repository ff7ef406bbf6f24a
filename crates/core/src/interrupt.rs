// SPDX-License-Identifier: MIT

//! Interrupt reasons broadcast to every outstanding connection task.
//!
//! spec.md's design notes call for "a sealed set of variants... plus
//! user-defined tokens" rather than comparing opaque pointers across module
//! boundaries. `Shutdown` is the daemon-wide `SYS_WILL_EXIT` signal; the
//! others are raised by a single task against itself (closed stream, child
//! exited) but modeled the same way so call sites never need to distinguish
//! "my own interrupt" from "a broadcast one".

use std::sync::Arc;

use tokio::sync::watch;

/// Why a task's current wait was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptReason {
    /// The client's stream closed (EPOLLHUP/EPOLLERR) while no I/O was pending.
    IoClosed,
    /// The supervised child process exited.
    ProcessEnded,
    /// The daemon is shutting down (`SYS_WILL_EXIT`).
    Shutdown,
    /// Escape hatch for reasons private to a single call site.
    Other(Arc<str>),
}

/// Process-wide broadcast of the current interrupt reason.
///
/// Cloned into every spawned task; `watch` gives late subscribers the most
/// recent value, so a task that starts after `Shutdown` was already raised
/// still observes it.
#[derive(Clone)]
pub struct Interrupter {
    tx: Arc<watch::Sender<Option<InterruptReason>>>,
}

/// A task's private handle onto the broadcast channel; can be disabled
/// during cleanup so a task's own teardown RPCs are not re-interrupted
/// (spec.md §4.B `set_interrupt_disabled`).
pub struct InterruptHandle {
    rx: watch::Receiver<Option<InterruptReason>>,
    disabled: bool,
}

impl Default for Interrupter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Stamp `reason` into every subscriber's interrupt slot.
    pub fn interrupt_all(&self, reason: InterruptReason) {
        // `send` only errors when there are no receivers left, which is a
        // harmless race during shutdown.
        let _ = self.tx.send(Some(reason));
    }

    pub fn handle(&self) -> InterruptHandle {
        InterruptHandle { rx: self.tx.subscribe(), disabled: false }
    }
}

impl InterruptHandle {
    /// Disable further interrupts until cleanup is done (§4.B
    /// `set_interrupt_disabled`); already-pending `wait_for_interrupt` calls
    /// observe the toggle on their next poll.
    pub fn set_disabled(&mut self, disabled: bool) {
        self.disabled = disabled;
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Resolve once a reason has been broadcast, unless this handle is
    /// currently disabled (in which case it never resolves — callers race
    /// it against their real work with `tokio::select!`).
    pub async fn wait_for_interrupt(&mut self) -> InterruptReason {
        loop {
            if self.disabled {
                std::future::pending::<()>().await;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            if let Some(reason) = self.rx.borrow().clone() {
                return reason;
            }
        }
    }

    /// Snapshot the current reason without waiting.
    pub fn current(&self) -> Option<InterruptReason> {
        self.rx.borrow().clone()
    }
}
