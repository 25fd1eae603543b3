//! A single-owner sleep lock: a condition variable plus the holder's tid.
//!
//! Acquire suspends the caller while another thread holds the lock, so it
//! must not be used from an ISR. Release by a non-owner is a programming
//! error and aborts the kernel.

use core::sync::atomic::{AtomicIsize, Ordering};

use crate::arch;

use super::condition::Condition;
use super::thread::{self, Tid};

const NO_HOLDER: isize = -1;

pub struct SleepLock {
    name: &'static str,
    released: Condition,
    holder: AtomicIsize,
}

impl SleepLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            released: Condition::new(name),
            holder: AtomicIsize::new(NO_HOLDER),
        }
    }

    /// Block until the lock is free, then take it.
    pub fn acquire(&self) {
        let guard = arch::intr_disable();
        let tid = thread::running_thread();
        assert!(
            self.holder.load(Ordering::Acquire) != tid as isize,
            "lock {} re-acquired by holder",
            self.name
        );
        while self.holder.load(Ordering::Acquire) != NO_HOLDER {
            self.released.wait();
        }
        self.holder.store(tid as isize, Ordering::Release);
        drop(guard);
    }

    /// Release the lock and wake all sleepers. Ownership is strict.
    pub fn release(&self) {
        let guard = arch::intr_disable();
        let tid = thread::running_thread();
        assert!(
            self.holder.load(Ordering::Acquire) == tid as isize,
            "lock {} released by non-owner",
            self.name
        );
        self.holder.store(NO_HOLDER, Ordering::Release);
        self.released.broadcast();
        drop(guard);
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.acquire();
        let result = f();
        self.release();
        result
    }

    /// The holding thread, if any.
    pub fn holder(&self) -> Option<Tid> {
        let holder = self.holder.load(Ordering::Acquire);
        (holder != NO_HOLDER).then_some(holder as Tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_acquire_records_the_owner() {
        thread::init();
        let lock = SleepLock::new("test");
        assert_eq!(lock.holder(), None);
        lock.acquire();
        assert_eq!(lock.holder(), Some(thread::running_thread()));
        lock.release();
        assert_eq!(lock.holder(), None);
    }

    #[test]
    #[should_panic(expected = "released by non-owner")]
    fn non_owner_release_aborts() {
        thread::init();
        let lock = SleepLock::new("test");
        lock.release();
    }

    #[test]
    fn with_runs_the_closure_under_the_lock() {
        thread::init();
        let lock = SleepLock::new("test");
        let value = lock.with(|| {
            assert!(lock.holder().is_some());
            41 + 1
        });
        assert_eq!(value, 42);
        assert_eq!(lock.holder(), None);
    }
}
