//! CobaltOS boot binary.
//!
//! Brings up the console, memory, traps, timer, threads, and processes,
//! scans the virtio-mmio slots for a block device, mounts the filesystem
//! on it, and executes `init` in user mode.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod boot {
    use cobalt_kernel::arch::riscv64::{entry, plic, trap, usermode};
    use cobalt_kernel::config::{
        USER_END_VMA, VIRT0_IRQNO, VIRT0_MMIO_BASE, VIRT_MMIO_SLOTS, VIRT_MMIO_STRIDE,
    };
    use cobalt_kernel::{arch, console, drivers, fs, mm, process, sched, timer};

    #[no_mangle]
    extern "C" fn kernel_main() -> ! {
        console::init();
        cobalt_kernel::println!("CobaltOS {}", env!("CARGO_PKG_VERSION"));

        mm::memory_init();
        trap::init();
        plic::init();
        timer::init();
        sched::thread::init();
        process::procmgr_init();

        // Probe every virtio-mmio window; block devices register as "blk".
        for k in 0..VIRT_MMIO_SLOTS {
            drivers::virtio::attach(
                VIRT0_MMIO_BASE + k * VIRT_MMIO_STRIDE,
                VIRT0_IRQNO + k as u32,
            );
        }

        arch::intr_enable();

        match start_init() {
            Ok(entry_point) => {
                // SAFETY: the entry point comes from a successfully loaded
                // ELF in the now-active space; the boot stack becomes the
                // trap stack once we leave for U-mode.
                unsafe {
                    usermode::enter_usermode(
                        entry_point,
                        USER_END_VMA,
                        entry::boot_stack_top(),
                    )
                }
            }
            Err(err) => {
                log::error!("failed to start init: {}", err);
                idle();
            }
        }
    }

    fn start_init() -> cobalt_kernel::KernelResult<usize> {
        let blkio = drivers::device_open("blk", 0)?;
        fs::fs_mount(blkio)?;
        let exe = fs::fs_open("init")?;
        let entry_point = process::exec(exe)?;
        Ok(entry_point.as_usize())
    }

    fn idle() -> ! {
        loop {
            arch::wfi();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        cobalt_kernel::println!("[KERNEL PANIC] {}", info);
        arch::intr_off();
        loop {
            arch::wfi();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("cobalt-kernel is a bare-metal binary; build for riscv64gc-unknown-none-elf");
}
