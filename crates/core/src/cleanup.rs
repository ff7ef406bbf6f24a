// SPDX-License-Identifier: MIT

//! LIFO cleanup registration (spec.md §4.A: "queued cleanup list... run in
//! LIFO order on task termination").
//!
//! Each connection task owns one `CleanupStack` and pushes a closure after
//! every resource it acquires (the stream, the pidfd, the scope strings, the
//! rate-limit entry, the admission slot). Whether the task finishes normally
//! or is unwound by an interrupt, `run()` discharges everything in reverse
//! acquisition order — exactly the property spec.md's interrupt-handling
//! section depends on.

pub struct CleanupStack {
    actions: Vec<Box<dyn FnOnce() + Send>>,
}

impl Default for CleanupStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupStack {
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    /// Register a cleanup action; it will run before any action registered
    /// earlier than it.
    pub fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Run every registered action in LIFO order, then clear the stack.
    pub fn run(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.run();
    }
}
