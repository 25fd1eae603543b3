//! System call dispatch.
//!
//! On an ecall from U-mode the trap handler lands here with the saved
//! frame: a7 carries the call number, a0..a2 the arguments, and a0 takes
//! the result (negative errno on failure). sepc is advanced past the
//! ecall before dispatch so sret resumes at the next instruction.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::{self, TrapFrame};
use crate::config::{PROCESS_IOMAX, USER_END_VMA};
use crate::drivers::device_open;
use crate::error::{KernelError, KernelResult};
use crate::fs::fs_open;
use crate::io::{Io, IoCtl, IOCTL_GETLEN, IOCTL_GETPOS, IOCTL_SETPOS};
use crate::mm::page_table::PteFlags;
use crate::mm::user_validation::{validate_vptr_len, validate_vstr};
use crate::mm::vas;
use crate::process;
use crate::sched::thread;
use crate::timer;

/// System call numbers (a7).
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 0,
    MsgOut = 1,
    DevOpen = 2,
    FsOpen = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Ioctl = 7,
    Exec = 8,
    Wait = 9,
    Usleep = 10,
}

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Syscall::Exit),
            1 => Ok(Syscall::MsgOut),
            2 => Ok(Syscall::DevOpen),
            3 => Ok(Syscall::FsOpen),
            4 => Ok(Syscall::Close),
            5 => Ok(Syscall::Read),
            6 => Ok(Syscall::Write),
            7 => Ok(Syscall::Ioctl),
            8 => Ok(Syscall::Exec),
            9 => Ok(Syscall::Wait),
            10 => Ok(Syscall::Usleep),
            _ => Err(()),
        }
    }
}

const A0: usize = 10;
const A1: usize = 11;
const A2: usize = 12;
const A7: usize = 17;

/// Entry from the trap handler for an ecall from U-mode.
pub fn dispatch(tf: &mut TrapFrame) {
    tf.sepc += 4;
    // Syscalls may sleep (disk, timers); run them with interrupts open.
    arch::intr_enable();

    let result: i64 = match Syscall::try_from(tf.x[A7]) {
        Ok(Syscall::Exit) => process::exit(),
        Ok(Syscall::MsgOut) => ret(sys_msgout(tf.x[A0])),
        Ok(Syscall::DevOpen) => ret(sys_devopen(tf.x[A0] as isize, tf.x[A1], tf.x[A2])),
        Ok(Syscall::FsOpen) => ret(sys_fsopen(tf.x[A0] as isize, tf.x[A1])),
        Ok(Syscall::Close) => ret(sys_close(tf.x[A0] as isize)),
        Ok(Syscall::Read) => ret(sys_read(tf.x[A0] as isize, tf.x[A1], tf.x[A2])),
        Ok(Syscall::Write) => ret(sys_write(tf.x[A0] as isize, tf.x[A1], tf.x[A2])),
        Ok(Syscall::Ioctl) => ret(sys_ioctl(tf.x[A0] as isize, tf.x[A1], tf.x[A2])),
        Ok(Syscall::Exec) => {
            let fd = tf.x[A0] as isize;
            ret(sys_exec(tf, fd))
        }
        Ok(Syscall::Wait) => ret(sys_wait(tf.x[A0])),
        Ok(Syscall::Usleep) => ret(sys_usleep(tf.x[A0])),
        Err(()) => -1,
    };
    tf.x[A0] = result as usize;
}

fn ret(result: KernelResult<i64>) -> i64 {
    match result {
        Ok(value) => value,
        Err(err) => err.errno(),
    }
}

/// Resolve a raw fd argument. Out-of-range is `NoEntry`; a negative fd
/// selects the first occupied slot when `scan` is set (the caller's
/// "current" fd) and is an error otherwise.
fn resolve_fd(proc: &process::Process, fd: isize, scan: bool) -> KernelResult<usize> {
    if fd >= PROCESS_IOMAX as isize {
        return Err(KernelError::NoEntry);
    }
    if fd >= 0 {
        return Ok(fd as usize);
    }
    if !scan {
        return Err(KernelError::NoEntry);
    }
    proc.iotab
        .iter()
        .position(|io| io.is_some())
        .ok_or(KernelError::NoEntry)
}

fn fd_stream(fd: usize) -> KernelResult<Arc<dyn Io>> {
    process::with_current(|proc| proc.iotab[fd].clone())?.ok_or(KernelError::Io)
}

/// Copy a validated user string into the kernel.
fn user_string(vptr: usize, flags: PteFlags) -> KernelResult<Vec<u8>> {
    let len = validate_vstr(vptr, flags)?;
    let mut bytes = vec![0u8; len];
    vas::copy_from_range(vptr, &mut bytes)?;
    Ok(bytes)
}

/// MSGOUT: validate and print a user string.
fn sys_msgout(msg_ptr: usize) -> KernelResult<i64> {
    let bytes = user_string(msg_ptr, PteFlags::U)?;
    let tid = thread::running_thread();
    let msg = core::str::from_utf8(&bytes).map_err(|_| KernelError::Invalid)?;
    crate::println!("Thread <{}:{}> says: {}", thread::thread_name(tid), tid, msg);
    Ok(0)
}

/// DEVOPEN: open a registered device into the given fd slot.
fn sys_devopen(fd: isize, name_ptr: usize, instno: usize) -> KernelResult<i64> {
    let name_bytes = user_string(name_ptr, PteFlags::U)?;
    let name = core::str::from_utf8(&name_bytes).map_err(|_| KernelError::Invalid)?;
    let fd = process::with_current(|proc| resolve_fd(proc, fd, true))??;
    let io = device_open(name, instno).map_err(|_| KernelError::NoDevice)?;
    process::with_current(|proc| proc.iotab[fd] = Some(io))?;
    Ok(fd as i64)
}

/// FSOPEN: open a file by name into the given fd slot.
fn sys_fsopen(fd: isize, name_ptr: usize) -> KernelResult<i64> {
    let name_bytes = user_string(name_ptr, PteFlags::U)?;
    let name = core::str::from_utf8(&name_bytes).map_err(|_| KernelError::Invalid)?;
    let fd = process::with_current(|proc| resolve_fd(proc, fd, true))??;
    let io = fs_open(name).map_err(|_| KernelError::NoEntry)?;
    process::with_current(|proc| proc.iotab[fd] = Some(io))?;
    Ok(fd as i64)
}

/// CLOSE: drop the fd's stream reference.
fn sys_close(fd: isize) -> KernelResult<i64> {
    if fd < 0 || fd >= PROCESS_IOMAX as isize {
        return Err(KernelError::NoEntry);
    }
    let io = process::with_current(|proc| proc.iotab[fd as usize].take())?;
    match io {
        Some(io) => {
            drop(io);
            Ok(0)
        }
        None => Err(KernelError::Io),
    }
}

/// READ: stream into a validated user buffer.
fn sys_read(fd: isize, buf: usize, len: usize) -> KernelResult<i64> {
    validate_vptr_len(buf, len, PteFlags::U | PteFlags::W)?;
    if fd < 0 {
        return Err(KernelError::NoEntry);
    }
    let io = fd_stream(resolve_fd_strict(fd)?)?;

    let mut scratch = vec![0u8; 4096];
    let mut done = 0;
    while done < len {
        let chunk = (len - done).min(scratch.len());
        let got = io.read(&mut scratch[..chunk])?;
        if got == 0 {
            break;
        }
        vas::copy_to_range(buf + done, &scratch[..got])?;
        done += got;
        if got < chunk {
            break;
        }
    }
    Ok(done as i64)
}

/// WRITE: stream from a validated user buffer.
fn sys_write(fd: isize, buf: usize, len: usize) -> KernelResult<i64> {
    validate_vptr_len(buf, len, PteFlags::U)?;
    if fd < 0 {
        return Err(KernelError::NoEntry);
    }
    let io = fd_stream(resolve_fd_strict(fd)?)?;

    let mut scratch = vec![0u8; 4096];
    let mut done = 0;
    while done < len {
        let chunk = (len - done).min(scratch.len());
        vas::copy_from_range(buf + done, &mut scratch[..chunk])?;
        let put = io.write(&scratch[..chunk])?;
        done += put;
        if put < chunk {
            break;
        }
    }
    Ok(done as i64)
}

fn resolve_fd_strict(fd: isize) -> KernelResult<usize> {
    if fd < 0 || fd >= PROCESS_IOMAX as isize {
        return Err(KernelError::NoEntry);
    }
    Ok(fd as usize)
}

/// IOCTL: decode the command, move the argument across the user boundary
/// in the right direction, and return the operation's value.
fn sys_ioctl(fd: isize, cmd: usize, arg_ptr: usize) -> KernelResult<i64> {
    let fd = process::with_current(|proc| resolve_fd(proc, fd, true))??;
    let io = fd_stream(fd)?;

    let arg = if cmd == IOCTL_SETPOS {
        validate_vptr_len(arg_ptr, 8, PteFlags::U)?;
        let mut raw = [0u8; 8];
        vas::copy_from_range(arg_ptr, &mut raw)?;
        u64::from_le_bytes(raw)
    } else {
        0
    };

    let value = io.ctl(IoCtl::from_raw(cmd, arg)?)?;

    if matches!(cmd, IOCTL_GETLEN | IOCTL_GETPOS | crate::io::IOCTL_GETBLKSZ) {
        validate_vptr_len(arg_ptr, 8, PteFlags::U | PteFlags::W)?;
        vas::copy_to_range(arg_ptr, &value.to_le_bytes())?;
    }
    Ok(value as i64)
}

/// EXEC: replace this process's image with the ELF behind fd; control
/// resumes at the new entry with the stack at the top of the user window.
fn sys_exec(tf: &mut TrapFrame, fd: isize) -> KernelResult<i64> {
    if fd < 0 {
        return Err(KernelError::NoEntry);
    }
    let io = fd_stream(resolve_fd_strict(fd)?)?;
    let entry = process::exec(io)?;
    tf.sepc = entry.as_usize();
    tf.x[2] = USER_END_VMA;
    Ok(0)
}

/// WAIT: join a specific child thread, or any child when tid is 0.
fn sys_wait(tid: usize) -> KernelResult<i64> {
    let joined = if tid == 0 {
        thread::join_any()?
    } else {
        thread::join(tid)?
    };
    Ok(joined as i64)
}

/// USLEEP: microsecond sleep on a timer alarm.
fn sys_usleep(us: usize) -> KernelResult<i64> {
    timer::usleep(us as u64);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PAGE_SIZE, USER_START_VMA};
    use crate::elf::test_support::ElfImage;
    use crate::fs::kfs::test_support::{build_image, pattern};
    use crate::io::MemIo;
    use crate::mm::vas::test_support::{fresh, SpaceEnv};
    use crate::process::procmgr_init;

    /// A user page at `vma` with the given bytes placed at its start.
    fn user_page(vma: usize, bytes: &[u8]) {
        vas::alloc_and_map_range(
            vma,
            bytes.len().max(1),
            PteFlags::R | PteFlags::W | PteFlags::U,
        );
        vas::copy_to_range(vma, bytes).expect("seed user page");
    }

    fn call(num: Syscall, a0: usize, a1: usize, a2: usize) -> i64 {
        let mut tf = TrapFrame::new();
        tf.x[A7] = num as usize;
        tf.x[A0] = a0;
        tf.x[A1] = a1;
        tf.x[A2] = a2;
        dispatch(&mut tf);
        tf.x[A0] as i64
    }

    fn setup(files: &[(&str, &[u8])]) -> SpaceEnv {
        let env = fresh(128);
        thread::init();
        procmgr_init();
        crate::fs::fs_mount(MemIo::new(build_image(files))).expect("mount");
        env
    }

    #[test]
    fn unknown_syscall_numbers_return_minus_one() {
        let _env = setup(&[]);
        let mut tf = TrapFrame::new();
        tf.x[A7] = 99;
        tf.sepc = 0x8010_0770;
        dispatch(&mut tf);
        assert_eq!(tf.x[A0] as i64, -1);
        // sepc advanced past the ecall.
        assert_eq!(tf.sepc, 0x8010_0774);
    }

    #[test]
    fn msgout_validates_the_string_pointer() {
        let _env = setup(&[]);
        user_page(USER_START_VMA, b"greetings\0");
        assert_eq!(call(Syscall::MsgOut, USER_START_VMA, 0, 0), 0);
        // An unmapped pointer is refused, not dereferenced.
        assert_eq!(
            call(Syscall::MsgOut, USER_START_VMA + 64 * PAGE_SIZE, 0, 0),
            KernelError::Access.errno()
        );
    }

    #[test]
    fn open_read_close_round_trip_through_the_fd_table() {
        let contents = pattern(600, 13);
        let _env = setup(&[("HelloWorld.txt", &contents)]);
        user_page(USER_START_VMA, b"HelloWorld.txt\0");
        let buf_vma = USER_START_VMA + PAGE_SIZE;
        user_page(buf_vma, &[0u8; 1024]);

        let fd = call(Syscall::FsOpen, 3, USER_START_VMA, 0);
        assert_eq!(fd, 3);

        let got = call(Syscall::Read, 3, buf_vma, 600);
        assert_eq!(got, 600);
        let mut readback = alloc::vec![0u8; 600];
        vas::copy_from_range(buf_vma, &mut readback).expect("read back");
        assert_eq!(readback, contents);

        assert_eq!(call(Syscall::Close, 3, 0, 0), 0);
        // Closing an already-empty fd reports EIO.
        assert_eq!(call(Syscall::Close, 3, 0, 0), KernelError::Io.errno());
    }

    #[test]
    fn read_refuses_buffers_without_write_permission() {
        let contents = pattern(64, 3);
        let _env = setup(&[("f", &contents)]);
        user_page(USER_START_VMA, b"f\0");
        let fd = call(Syscall::FsOpen, 0, USER_START_VMA, 0);
        assert_eq!(fd, 0);

        // Read-only user page: READ must reject it as a destination.
        let ro = USER_START_VMA + PAGE_SIZE;
        vas::alloc_and_map_page(ro, PteFlags::R | PteFlags::U);
        assert_eq!(
            call(Syscall::Read, 0, ro, 16),
            KernelError::Access.errno()
        );
    }

    #[test]
    fn negative_fd_selects_the_current_slot_for_ioctl() {
        let contents = pattern(512, 1);
        let _env = setup(&[("data", &contents)]);
        user_page(USER_START_VMA, b"data\0");
        let arg_vma = USER_START_VMA + PAGE_SIZE;
        user_page(arg_vma, &[0u8; 8]);

        // Nothing open yet: the scan fails.
        assert_eq!(
            call(Syscall::Ioctl, usize::MAX, IOCTL_GETLEN, arg_vma),
            KernelError::NoEntry.errno()
        );

        assert_eq!(call(Syscall::FsOpen, 5, USER_START_VMA, 0), 5);
        // fd -1 resolves to the first occupied slot.
        assert_eq!(
            call(Syscall::Ioctl, usize::MAX, IOCTL_GETLEN, arg_vma),
            512
        );
        let mut raw = [0u8; 8];
        vas::copy_from_range(arg_vma, &mut raw).expect("arg out");
        assert_eq!(u64::from_le_bytes(raw), 512);
    }

    #[test]
    fn out_of_range_fds_are_rejected() {
        let _env = setup(&[]);
        assert_eq!(
            call(Syscall::Close, PROCESS_IOMAX, 0, 0),
            KernelError::NoEntry.errno()
        );
        assert_eq!(
            call(Syscall::Read, PROCESS_IOMAX, USER_START_VMA, 0),
            KernelError::NoEntry.errno()
        );
    }

    #[test]
    fn exec_syscall_redirects_the_trap_frame() {
        let payload = pattern(256, 17);
        let image = ElfImage::riscv(0x8010_0000)
            .segment(0x8010_0000, 0x4 | 0x1, payload.clone())
            .build();
        let _env = setup(&[("init", &image)]);
        user_page(USER_START_VMA + 8 * PAGE_SIZE, b"init\0");

        let fd = call(Syscall::FsOpen, 0, USER_START_VMA + 8 * PAGE_SIZE, 0);
        assert_eq!(fd, 0);

        let mut tf = TrapFrame::new();
        tf.x[A7] = Syscall::Exec as usize;
        tf.x[A0] = 0;
        tf.sepc = 0x8010_0500;
        dispatch(&mut tf);
        assert_eq!(tf.x[A0] as i64, 0);
        assert_eq!(tf.sepc, 0x8010_0000);
        assert_eq!(tf.x[2], USER_END_VMA);

        // The new image is in place in the fresh space.
        let mut loaded = alloc::vec![0u8; 256];
        vas::copy_from_range(0x8010_0000, &mut loaded).expect("loaded");
        assert_eq!(loaded, payload);

        crate::process::exit_cleanup();
    }
}
