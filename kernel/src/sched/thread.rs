//! Cooperative kernel threads.
//!
//! Single hart, no preemption: a thread runs until it yields, blocks on a
//! condition, or exits. All scheduler state is guarded by the table mutex,
//! which is only taken with interrupts disabled (the ISR broadcast path
//! takes it too).

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch;
use crate::config::NTHR;
use crate::error::{KernelError, KernelResult};

/// Thread identifier; doubles as the table index.
pub type Tid = usize;

/// The boot thread.
pub const MAIN_TID: Tid = 0;

const STACK_SIZE: usize = 16 * 1024;

/// Callee-saved register context captured at a switch point.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Context {
    ra: usize,
    sp: usize,
    s: [usize; 12],
}

impl Context {
    const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Free,
    Ready,
    Running,
    Waiting,
    Exited,
}

struct ThreadSlot {
    state: ThreadState,
    name: &'static str,
    parent: Tid,
    ctx: Context,
    stack: Option<Box<[u8]>>,
}

impl ThreadSlot {
    const fn free() -> Self {
        Self {
            state: ThreadState::Free,
            name: "",
            parent: MAIN_TID,
            ctx: Context::zeroed(),
            stack: None,
        }
    }
}

/// Fixed-capacity ready ring; the scheduler allocates nothing.
pub(crate) struct ReadyQueue {
    items: [Tid; NTHR],
    head: usize,
    len: usize,
}

impl ReadyQueue {
    const fn new() -> Self {
        Self {
            items: [0; NTHR],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, tid: Tid) {
        assert!(self.len < NTHR, "ready queue overflow");
        self.items[(self.head + self.len) % NTHR] = tid;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Tid> {
        if self.len == 0 {
            return None;
        }
        let tid = self.items[self.head];
        self.head = (self.head + 1) % NTHR;
        self.len -= 1;
        Some(tid)
    }

    fn remove(&mut self, tid: Tid) {
        let mut kept = Vec::new();
        while let Some(t) = self.pop() {
            if t != tid {
                kept.push(t);
            }
        }
        for t in kept {
            self.push(t);
        }
    }
}

struct Sched {
    threads: [ThreadSlot; NTHR],
    ready: ReadyQueue,
    current: Tid,
}

impl Sched {
    const fn new() -> Self {
        Self {
            threads: [const { ThreadSlot::free() }; NTHR],
            ready: ReadyQueue::new(),
            current: MAIN_TID,
        }
    }
}

static SCHED: Mutex<Sched> = Mutex::new(Sched::new());

/// Claim slot 0 for the boot thread. Must run before any other thread
/// operation.
pub fn init() {
    let _guard = arch::intr_disable();
    let mut sched = SCHED.lock();
    sched.threads[MAIN_TID].state = ThreadState::Running;
    sched.threads[MAIN_TID].name = "main";
    sched.current = MAIN_TID;
}

/// Identifier of the currently running thread.
pub fn running_thread() -> Tid {
    let _guard = arch::intr_disable();
    SCHED.lock().current
}

/// Name of a thread, for diagnostics.
pub fn thread_name(tid: Tid) -> &'static str {
    let _guard = arch::intr_disable();
    let sched = SCHED.lock();
    sched.threads.get(tid).map(|t| t.name).unwrap_or("?")
}

pub(crate) fn state_of(tid: Tid) -> ThreadState {
    let _guard = arch::intr_disable();
    SCHED.lock().threads[tid].state
}

/// Spawn a thread running `entry(arg)`. The thread exits when `entry`
/// returns.
pub fn spawn(name: &'static str, entry: fn(usize), arg: usize) -> KernelResult<Tid> {
    let _guard = arch::intr_disable();
    let mut sched = SCHED.lock();
    let parent = sched.current;
    let tid = sched
        .threads
        .iter()
        .position(|t| t.state == ThreadState::Free)
        .ok_or(KernelError::TooManyProcs)?;

    let stack = vec![0u8; STACK_SIZE].into_boxed_slice();
    let stack_top = (stack.as_ptr() as usize + STACK_SIZE) & !0xF;

    let slot = &mut sched.threads[tid];
    slot.state = ThreadState::Ready;
    slot.name = name;
    slot.parent = parent;
    slot.stack = Some(stack);
    slot.ctx = Context::zeroed();
    slot.ctx.ra = thread_trampoline_addr();
    slot.ctx.sp = stack_top;
    slot.ctx.s[0] = entry as usize;
    slot.ctx.s[1] = arg;

    sched.ready.push(tid);
    Ok(tid)
}

/// Yield the processor to the next ready thread, if any.
pub fn yield_now() {
    let guard = arch::intr_disable();
    let next = {
        let mut sched = SCHED.lock();
        match sched.ready.pop() {
            Some(next) => {
                let current = sched.current;
                sched.threads[current].state = ThreadState::Ready;
                sched.ready.push(current);
                Some(next)
            }
            None => None,
        }
    };
    if let Some(next) = next {
        switch_to(next);
    }
    drop(guard);
}

/// Mark the current thread exited and never run it again. Joiners are
/// woken through the exit condition. When the boot thread exits the hart
/// simply idles.
pub fn thread_exit() -> ! {
    let _guard = arch::intr_disable();
    {
        let mut sched = SCHED.lock();
        let current = sched.current;
        sched.threads[current].state = ThreadState::Exited;
    }
    super::condition::exit_condition().broadcast();
    halt_current();
}

/// Wait for thread `tid` to exit, then reap it. Returns `tid`.
pub fn join(tid: Tid) -> KernelResult<Tid> {
    let _guard = arch::intr_disable();
    loop {
        {
            let mut sched = SCHED.lock();
            match sched.threads.get(tid).map(|t| t.state) {
                None | Some(ThreadState::Free) => return Err(KernelError::NoEntry),
                Some(ThreadState::Exited) => {
                    sched.threads[tid].state = ThreadState::Free;
                    sched.threads[tid].stack = None;
                    return Ok(tid);
                }
                _ => {}
            }
        }
        super::condition::exit_condition().wait();
    }
}

/// Wait for any child of the current thread to exit. `NoEntry` when the
/// current thread has no children.
pub fn join_any() -> KernelResult<Tid> {
    let _guard = arch::intr_disable();
    loop {
        {
            let mut sched = SCHED.lock();
            let current = sched.current;
            let mut have_child = false;
            let mut reaped = None;
            for tid in 0..NTHR {
                let slot = &sched.threads[tid];
                if tid != current && slot.parent == current && slot.state != ThreadState::Free {
                    have_child = true;
                    if slot.state == ThreadState::Exited {
                        reaped = Some(tid);
                        break;
                    }
                }
            }
            if let Some(tid) = reaped {
                sched.threads[tid].state = ThreadState::Free;
                sched.threads[tid].stack = None;
                return Ok(tid);
            }
            if !have_child {
                return Err(KernelError::NoEntry);
            }
        }
        super::condition::exit_condition().wait();
    }
}

/// Block the current thread (already queued on a condition) until it is
/// made ready again. Must be called with interrupts disabled.
pub(crate) fn block_current() {
    debug_assert!(!arch::intr_enabled(), "block with interrupts enabled");
    {
        let mut sched = SCHED.lock();
        let current = sched.current;
        sched.threads[current].state = ThreadState::Waiting;
    }
    reschedule_until_ready();
}

/// Make `tid` runnable if it is waiting.
pub(crate) fn make_ready(tid: Tid) {
    let mut sched = SCHED.lock();
    if sched.threads[tid].state == ThreadState::Waiting {
        sched.threads[tid].state = ThreadState::Ready;
        sched.ready.push(tid);
    }
}

/// Run other threads (or idle in wfi) until the current thread becomes
/// ready again, then return with it running.
fn reschedule_until_ready() {
    loop {
        let next = {
            let mut sched = SCHED.lock();
            sched.ready.pop()
        };
        if let Some(next) = next {
            switch_to(next);
            // Back here means someone switched to us: running again.
            return;
        }

        // Nothing else to run: idle with interrupts open so an ISR can
        // broadcast the condition we are waiting on.
        arch::intr_enable();
        arch::wfi();
        arch::intr_off();

        let mut sched = SCHED.lock();
        let current = sched.current;
        if sched.threads[current].state == ThreadState::Ready {
            // The broadcast pushed us on the ready ring while we were the
            // one spinning; take ourselves back out.
            sched.ready.remove(current);
            sched.threads[current].state = ThreadState::Running;
            return;
        }
    }
}

/// Switch away from an exited thread forever.
fn halt_current() -> ! {
    loop {
        let next = {
            let mut sched = SCHED.lock();
            sched.ready.pop()
        };
        if let Some(next) = next {
            switch_to(next);
            unreachable!("exited thread resumed");
        }
        arch::intr_enable();
        arch::wfi();
        arch::intr_off();
    }
}

/// Transfer control to `next`; returns when some other thread switches
/// back to the caller.
fn switch_to(next: Tid) {
    let (old_ptr, new_ptr) = {
        let mut sched = SCHED.lock();
        let current = sched.current;
        sched.threads[next].state = ThreadState::Running;
        sched.current = next;
        (
            &mut sched.threads[current].ctx as *mut Context,
            &sched.threads[next].ctx as *const Context,
        )
    };
    // SAFETY: both pointers target context slots inside the static table;
    // the slots are not moved or freed while their threads exist, and the
    // single-hart cooperative model means no other CPU touches them during
    // the switch.
    unsafe { ctx_switch(old_ptr, new_ptr) };
}

#[cfg(target_arch = "riscv64")]
mod arch_switch {
    use core::arch::global_asm;

    use super::Context;

    global_asm!(
        r#"
        .globl _ctx_switch
_ctx_switch:
    sd ra, 0(a0)
    sd sp, 8(a0)
    sd s0, 16(a0)
    sd s1, 24(a0)
    sd s2, 32(a0)
    sd s3, 40(a0)
    sd s4, 48(a0)
    sd s5, 56(a0)
    sd s6, 64(a0)
    sd s7, 72(a0)
    sd s8, 80(a0)
    sd s9, 88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)
    ld ra, 0(a1)
    ld sp, 8(a1)
    ld s0, 16(a1)
    ld s1, 24(a1)
    ld s2, 32(a1)
    ld s3, 40(a1)
    ld s4, 48(a1)
    ld s5, 56(a1)
    ld s6, 64(a1)
    ld s7, 72(a1)
    ld s8, 80(a1)
    ld s9, 88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)
    ret

        .globl _thread_trampoline
_thread_trampoline:
    mv a0, s1
    jalr s0
    call thread_exit_shim
"#
    );

    extern "C" {
        pub fn _ctx_switch(old: *mut Context, new: *const Context);
        pub fn _thread_trampoline();
    }

    #[no_mangle]
    extern "C" fn thread_exit_shim() -> ! {
        super::thread_exit()
    }
}

#[cfg(target_arch = "riscv64")]
unsafe fn ctx_switch(old: *mut Context, new: *const Context) {
    // SAFETY: forwarded contract; the asm only touches callee-saved
    // registers and the two context blocks.
    unsafe { arch_switch::_ctx_switch(old, new) };
}

#[cfg(target_arch = "riscv64")]
fn thread_trampoline_addr() -> usize {
    arch_switch::_thread_trampoline as usize
}

#[cfg(not(target_arch = "riscv64"))]
unsafe fn ctx_switch(_old: *mut Context, _new: *const Context) {
    unreachable!("context switch on the host");
}

#[cfg(not(target_arch = "riscv64"))]
fn thread_trampoline_addr() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_thread_is_running_after_init() {
        init();
        assert_eq!(running_thread(), MAIN_TID);
        assert_eq!(thread_name(MAIN_TID), "main");
        assert_eq!(state_of(MAIN_TID), ThreadState::Running);
    }

    #[test]
    fn ready_ring_is_fifo_and_supports_removal() {
        let mut q = ReadyQueue::new();
        q.push(3);
        q.push(5);
        q.push(7);
        q.remove(5);
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(7));
        assert_eq!(q.pop(), None);
    }
}
