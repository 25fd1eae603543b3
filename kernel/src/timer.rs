//! Timebase and alarms.
//!
//! Sleeps are absolute-deadline alarms over the `time` CSR; the S-timer
//! interrupt (Sstc stimecmp) broadcasts the alarm condition and every
//! sleeper re-checks its own deadline.

use spin::Mutex;

use crate::arch;
use crate::config::{NTHR, TIMER_FREQ_HZ};
use crate::sched::{running_thread, Condition};

static ALARM_FIRED: Condition = Condition::new("alarm_fired");
static WAKEUPS: Mutex<[Option<u64>; NTHR]> = Mutex::new([None; NTHR]);

/// Current timebase value in ticks.
pub fn now() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let ticks: u64;
        // SAFETY: reading the time CSR has no side effects.
        unsafe { core::arch::asm!("csrr {0}, time", out(reg) ticks, options(nostack)) };
        ticks
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}

fn program_timecmp(deadline: u64) {
    #[cfg(target_arch = "riscv64")]
    {
        // SAFETY: stimecmp (0x14d) only schedules the next S-timer
        // interrupt.
        unsafe { core::arch::asm!("csrw 0x14d, {0}", in(reg) deadline, options(nostack)) };
    }
    #[cfg(not(target_arch = "riscv64"))]
    let _ = deadline;
}

/// Enable the S-timer interrupt with no alarm pending.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    program_timecmp(u64::MAX);
    // SAFETY: unmasking the S-timer interrupt source; the trap vector is
    // installed before interrupts are enabled globally.
    unsafe { riscv::register::sie::set_stimer() };
}

/// Timer interrupt: wake every sleeper (each re-checks its deadline), then
/// schedule the next earliest alarm.
pub fn tick() {
    ALARM_FIRED.broadcast();
    reprogram();
}

fn reprogram() {
    let wakeups = WAKEUPS.lock();
    let next = wakeups.iter().flatten().copied().min().unwrap_or(u64::MAX);
    program_timecmp(next);
}

/// A named alarm bound to the calling thread.
pub struct Alarm {
    name: &'static str,
}

impl Alarm {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Sleep for at least `us` microseconds.
    pub fn sleep_us(&self, us: u64) {
        let deadline = now() + us.saturating_mul(TIMER_FREQ_HZ) / 1_000_000;
        let tid = running_thread();

        let guard = arch::intr_disable();
        WAKEUPS.lock()[tid] = Some(deadline);
        reprogram();
        while now() < deadline {
            ALARM_FIRED.wait();
        }
        WAKEUPS.lock()[tid] = None;
        reprogram();
        drop(guard);
    }
}

/// Microsecond sleep for the USLEEP syscall.
pub fn usleep(us: u64) {
    Alarm::new("usleep").sleep_us(us);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_with_elapsed_deadline_returns_immediately() {
        // On the host `now()` is 0, so a zero-length sleep ends at once.
        crate::sched::thread::init();
        Alarm::new("test").sleep_us(0);
        assert!(WAKEUPS.lock().iter().all(|w| w.is_none()));
    }

    #[test]
    fn alarm_names_are_kept() {
        assert_eq!(Alarm::new("alarm_us").name(), "alarm_us");
    }
}
