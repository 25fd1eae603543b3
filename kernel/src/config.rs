//! Compile-time platform configuration for the QEMU `virt` machine.
//!
//! Everything the kernel knows about the platform memory map lives here;
//! the rest of the kernel never hard-codes an address.

/// Size of one page / physical frame.
pub const PAGE_SIZE: usize = 4096;
/// log2(PAGE_SIZE), used to convert between addresses and page numbers.
pub const PAGE_ORDER: usize = 12;
/// Size of a level-1 megapage mapping.
pub const MEGA_SIZE: usize = 2 * 1024 * 1024;
/// Size of a level-2 gigapage mapping.
pub const GIGA_SIZE: usize = 1024 * 1024 * 1024;

/// Start of physical RAM; the kernel image is linked here.
pub const RAM_START: usize = 0x8000_0000;

/// RAM size in MiB, overridable at build time via CONFIG_RAM_SIZE_MB.
pub const RAM_SIZE_MB: usize = match option_env!("COBALT_RAM_SIZE_MB") {
    Some(s) => parse_decimal(s),
    None => 8,
};

/// Total physical RAM.
pub const RAM_SIZE: usize = RAM_SIZE_MB * 1024 * 1024;
/// One past the last byte of physical RAM.
pub const RAM_END: usize = RAM_START + RAM_SIZE;

/// User virtual address window. All U-mapped pages live inside
/// [USER_START_VMA, USER_END_VMA); the initial user stack pointer is
/// USER_END_VMA.
pub const USER_START_VMA: usize = 0x8010_0000;
pub const USER_END_VMA: usize = 0x8100_0000;

/// Minimum size handed to the kernel heap at boot, before the remaining
/// RAM is given to the page allocator.
pub const HEAP_INIT_MIN: usize = 256 * 1024;

/// NS16550A-compatible UART.
pub const UART0_BASE: usize = 0x1000_0000;
/// Platform-level interrupt controller.
pub const PLIC_BASE: usize = 0x0c00_0000;
pub const UART0_IRQNO: u32 = 10;

/// virtio-mmio transport windows: 8 slots of 0x100 bytes each, with
/// consecutive IRQ lines starting at VIRT0_IRQNO.
pub const VIRT0_MMIO_BASE: usize = 0x1000_1000;
pub const VIRT_MMIO_STRIDE: usize = 0x100;
pub const VIRT_MMIO_SLOTS: usize = 8;
pub const VIRT0_IRQNO: u32 = 1;

/// Timebase frequency of the `time` CSR on the virt machine.
pub const TIMER_FREQ_HZ: u64 = 10_000_000;

/// Maximum number of processes; slot 0 is the main process.
pub const NPROC: usize = 16;
/// Maximum number of kernel threads.
pub const NTHR: usize = 16;
/// Per-process file descriptor table size. Kept equal to the open-file
/// table capacity so the syscall bound check covers both.
pub const PROCESS_IOMAX: usize = 32;

/// Parse a small decimal literal in a const context (build-time override).
const fn parse_decimal(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut value = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        let d = bytes[i];
        assert!(d.is_ascii_digit(), "CONFIG_RAM_SIZE_MB must be decimal");
        value = value * 10 + (d - b'0') as usize;
        i += 1;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_layout_is_consistent() {
        assert_eq!(RAM_END - RAM_START, RAM_SIZE);
        assert_eq!(RAM_SIZE % MEGA_SIZE, 0);
        assert!(USER_START_VMA > RAM_START);
        assert!(USER_START_VMA < USER_END_VMA);
    }

    #[test]
    fn parse_decimal_handles_multidigit_values() {
        assert_eq!(parse_decimal("8"), 8);
        assert_eq!(parse_decimal("128"), 128);
    }
}
