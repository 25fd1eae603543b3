//! User processes: the process table, exec, and exit.
//!
//! A process is {pid, kernel thread, address space, fd table}. Slot 0 is
//! the main process created at boot. `exec` claims a fresh pid slot and a
//! fresh address space for the current thread; `exit` tears both down.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::Mutex;

use crate::arch;
use crate::config::{NPROC, NTHR, PROCESS_IOMAX};
use crate::error::{KernelError, KernelResult};
use crate::io::Io;
use crate::mm::{vas, VirtualAddress};
use crate::sched::thread::{self, Tid};

pub type Pid = usize;

pub const MAIN_PID: Pid = 0;

pub struct Process {
    pub pid: Pid,
    pub tid: Tid,
    pub mtag: vas::MemorySpace,
    pub iotab: [Option<Arc<dyn Io>>; PROCESS_IOMAX],
}

impl Process {
    fn new(pid: Pid, tid: Tid, mtag: vas::MemorySpace) -> Self {
        Self {
            pid,
            tid,
            mtag,
            iotab: [const { None }; PROCESS_IOMAX],
        }
    }
}

static PROC_TABLE: Mutex<[Option<Box<Process>>; NPROC]> = Mutex::new([const { None }; NPROC]);

/// tid → pid binding for the thread currently animating each process.
static THREAD_PROC: Mutex<[Option<Pid>; NTHR]> = Mutex::new([None; NTHR]);

/// Install the main process at pid 0, bound to the calling thread and the
/// main address space.
pub fn procmgr_init() {
    let tid = thread::running_thread();
    let _guard = arch::intr_disable();
    let mut table = PROC_TABLE.lock();
    for slot in table.iter_mut() {
        *slot = None;
    }
    table[MAIN_PID] = Some(Box::new(Process::new(MAIN_PID, tid, vas::main_space())));
    let mut bindings = THREAD_PROC.lock();
    for slot in bindings.iter_mut() {
        *slot = None;
    }
    bindings[tid] = Some(MAIN_PID);
}

/// Pid of the process bound to the current thread.
pub fn current_pid() -> Option<Pid> {
    let tid = thread::running_thread();
    let _guard = arch::intr_disable();
    THREAD_PROC.lock()[tid]
}

/// Run `f` against the current process. `NoEntry` when the thread has no
/// process (a kernel-only thread).
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> KernelResult<R> {
    let pid = current_pid().ok_or(KernelError::NoEntry)?;
    let _guard = arch::intr_disable();
    let mut table = PROC_TABLE.lock();
    let proc = table[pid].as_mut().ok_or(KernelError::NoEntry)?;
    Ok(f(proc))
}

/// Replace the current user image with the executable behind `exe`.
///
/// Unmaps the current user pages, claims a fresh pid slot and address
/// space, loads the ELF, and returns its entry point; the caller transfers
/// control (user stack pointer starts at USER_END_VMA). On loader failure
/// the new space is reclaimed and the slot released.
pub fn exec(exe: Arc<dyn Io>) -> KernelResult<VirtualAddress> {
    let tid = thread::running_thread();

    // The outgoing image's user pages go back to the allocator first.
    vas::unmap_and_free_user();

    let pid = {
        let _guard = arch::intr_disable();
        let mut table = PROC_TABLE.lock();
        let pid = table
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(KernelError::TooManyProcs)?;
        let space = vas::space_create()?;
        table[pid] = Some(Box::new(Process::new(pid, tid, space)));
        pid
    };

    let space = {
        let _guard = arch::intr_disable();
        let table = PROC_TABLE.lock();
        table[pid].as_ref().expect("fresh process").mtag
    };
    vas::space_switch(space);

    match crate::elf::elf_load(exe.as_ref()) {
        Ok(entry) => {
            let _guard = arch::intr_disable();
            THREAD_PROC.lock()[tid] = Some(pid);
            log::info!("process {}: entry {:#x}", pid, entry.as_usize());
            Ok(entry)
        }
        Err(err) => {
            // Tear the half-built image back down.
            vas::space_reclaim();
            let _guard = arch::intr_disable();
            PROC_TABLE.lock()[pid] = None;
            Err(err)
        }
    }
}

/// Everything `exit` does short of terminating the thread: reclaim the
/// address space, close the fd table, release the pid slot.
pub(crate) fn exit_cleanup() {
    let Some(pid) = current_pid() else {
        panic!("exit with no current process");
    };
    let tid = thread::running_thread();

    let proc = {
        let _guard = arch::intr_disable();
        let proc = PROC_TABLE.lock()[pid].take();
        THREAD_PROC.lock()[tid] = None;
        proc
    };
    let Some(proc) = proc else {
        panic!("exit with a stale process binding");
    };

    if proc.mtag == vas::main_space() {
        // The main process keeps the shared space; only its user pages go.
        vas::unmap_and_free_user();
    } else {
        vas::space_reclaim();
    }

    // Dropping the record closes every fd (stream handles are Arcs).
    drop(proc);
}

/// Terminate the current process and its thread.
pub fn exit() -> ! {
    exit_cleanup();
    thread::thread_exit();
}
