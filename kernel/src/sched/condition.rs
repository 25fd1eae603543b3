//! Condition variables.
//!
//! `wait` must be called with interrupts disabled; it atomically queues the
//! caller and suspends until a `broadcast` makes it runnable again. The ISR
//! to waiting-thread wake pattern of the block driver is exactly this.

use spin::Mutex;

use crate::arch;
use crate::config::NTHR;

use super::thread::{self, Tid};

/// Fixed-capacity waiter list; no allocation so conditions can live in
/// statics and be touched from ISRs.
struct WaitList {
    items: [Option<Tid>; NTHR],
}

impl WaitList {
    const fn new() -> Self {
        Self {
            items: [None; NTHR],
        }
    }

    fn push(&mut self, tid: Tid) {
        for slot in &mut self.items {
            if slot.is_none() {
                *slot = Some(tid);
                return;
            }
        }
        panic!("condition wait list overflow");
    }

    fn drain(&mut self, mut f: impl FnMut(Tid)) {
        for slot in &mut self.items {
            if let Some(tid) = slot.take() {
                f(tid);
            }
        }
    }
}

/// A condition variable with a name for diagnostics.
pub struct Condition {
    name: &'static str,
    waiters: Mutex<WaitList>,
}

impl Condition {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: Mutex::new(WaitList::new()),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Suspend the current thread until the next broadcast.
    ///
    /// Must be called with interrupts disabled; the caller re-checks its
    /// predicate on return (wakeups are broadcast, not targeted).
    pub fn wait(&self) {
        debug_assert!(
            !arch::intr_enabled(),
            "condition {} waited on with interrupts enabled",
            self.name
        );
        let tid = thread::running_thread();
        self.waiters.lock().push(tid);
        thread::block_current();
    }

    /// Make every queued waiter runnable. Safe to call from an ISR.
    pub fn broadcast(&self) {
        let _guard = arch::intr_disable();
        let mut ready = [None; NTHR];
        let mut n = 0;
        self.waiters.lock().drain(|tid| {
            ready[n] = Some(tid);
            n += 1;
        });
        for tid in ready.into_iter().flatten() {
            thread::make_ready(tid);
        }
    }
}

/// The table-wide condition broadcast whenever a thread exits; `join`
/// blocks on it.
pub fn exit_condition() -> &'static Condition {
    static EXITED: Condition = Condition::new("thread_exited");
    &EXITED
}
