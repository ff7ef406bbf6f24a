// SPDX-License-Identifier: MIT

//! `Event`: a single-set FIFO wait-set (spec.md §3/§4.A), and `TaskRegistry`:
//! the process-wide admission counter plus interrupt broadcast every
//! connection task shares.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::interrupt::{InterruptHandle, Interrupter};

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

/// A wait-set that wakes blocked waiters in the order they called `wait`
/// (spec.md §8: "tasks A then B waiting on event E and set(E) resumes A
/// before B").
#[derive(Default)]
pub struct Event {
    waiters: Mutex<Vec<Waiter>>,
    next_id: AtomicUsize,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `set()` is called or `interrupt` fires, whichever first.
    /// Returns `Err` with the interrupt reason on cancellation.
    pub async fn wait(
        &self,
        interrupt: &mut InterruptHandle,
    ) -> Result<(), crate::interrupt::InterruptReason> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as u64;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push(Waiter { id, tx });

        tokio::select! {
            biased;
            result = rx => {
                // `set()` already removed us from the list; a dropped sender
                // without a preceding `set()` can't happen on this path.
                result.ok();
                Ok(())
            }
            reason = interrupt.wait_for_interrupt() => {
                self.cancel_wait(id);
                Err(reason)
            }
        }
    }

    /// Remove a specific outstanding waiter, as if it had been woken, without
    /// running its continuation (spec.md §4.A `cancel_wait`).
    fn cancel_wait(&self, id: u64) {
        self.waiters.lock().retain(|w| w.id != id);
    }

    /// Wake every currently blocked waiter in FIFO order. Idempotent when
    /// the wait-set is empty.
    pub fn set(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waiter in waiters {
            let _ = waiter.tx.send(());
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// Process-wide bookkeeping shared by every connection orchestrator:
/// the active-task admission counter (spec.md §3 `Daemon.g_nr_tasks`) and the
/// interrupt broadcast (spec.md §4.B `interrupt_all_tasks`).
pub struct TaskRegistry {
    active: AtomicUsize,
    max_tasks: usize,
    interrupter: Interrupter,
    drained: tokio::sync::Notify,
}

impl TaskRegistry {
    pub fn new(max_tasks: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_tasks,
            interrupter: Interrupter::new(),
            drained: tokio::sync::Notify::new(),
        })
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Try to admit one more task. Returns `false` (without mutating state)
    /// if the daemon is already at `max_tasks` (spec.md §4.H step 2).
    pub fn try_admit(&self) -> bool {
        loop {
            let current = self.active.load(Ordering::SeqCst);
            if current >= self.max_tasks {
                return false;
            }
            if self
                .active
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn interrupter(&self) -> &Interrupter {
        &self.interrupter
    }

    pub fn handle(&self) -> InterruptHandle {
        self.interrupter.handle()
    }

    /// Block until every admitted task has called `release` (spec.md §5:
    /// "the daemon then waits for all tasks to drain before exit").
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }
}
