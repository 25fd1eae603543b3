//! RISC-V 64 architecture support: CSR access, interrupt masking, fences.

pub mod entry;
pub mod plic;
pub mod trap;
pub mod usermode;

use riscv::register::sstatus;

/// RAII interrupt-disable guard. Construction disables S-mode interrupts;
/// drop restores the state captured at construction. Guards nest.
pub struct IntrGuard {
    was_enabled: bool,
}

impl Drop for IntrGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            // SAFETY: re-enabling S-mode interrupts is always permitted in
            // S-mode; the guard only re-enables what it disabled.
            unsafe { sstatus::set_sie() };
        }
    }
}

/// Disable S-mode interrupts, returning a guard that restores them.
pub fn intr_disable() -> IntrGuard {
    let was_enabled = sstatus::read().sie();
    // SAFETY: clearing SIE only masks interrupt delivery on this hart.
    unsafe { sstatus::clear_sie() };
    IntrGuard { was_enabled }
}

/// Disable S-mode interrupt delivery without tracking the prior state.
pub fn intr_off() {
    // SAFETY: masking interrupt delivery has no other effect.
    unsafe { sstatus::clear_sie() };
}

/// Enable S-mode interrupt delivery.
pub fn intr_enable() {
    // SAFETY: setting SIE only unmasks interrupt delivery on this hart;
    // all handlers are registered before this is first called.
    unsafe { sstatus::set_sie() };
}

/// Whether S-mode interrupts are currently enabled.
pub fn intr_enabled() -> bool {
    sstatus::read().sie()
}

/// Single-hart TLB shootdown; follows every PTE mutation that may affect
/// the active address space.
pub fn sfence_vma() {
    // SAFETY: sfence.vma with no operands flushes this hart's TLB; it has
    // no effect other than ordering and translation-cache invalidation.
    unsafe { core::arch::asm!("sfence.vma", options(nostack)) };
}

/// Install an address-space tag (Sv39 mode bits | root PPN) into satp.
pub fn satp_write(tag: u64) {
    // SAFETY: the caller passes a tag built from a valid root page table;
    // the write is followed by sfence.vma at the call site.
    unsafe { core::arch::asm!("csrw satp, {0}", in(reg) tag, options(nostack)) };
}

/// Allow supervisor loads/stores to U-mapped pages (sstatus.SUM).
pub fn set_sum() {
    // SAFETY: SUM only widens what S-mode may access; required so the
    // kernel can copy syscall buffers mapped with PTE_U.
    unsafe { sstatus::set_sum() };
}

/// Wait for interrupt.
pub fn wfi() {
    // SAFETY: wfi only stalls the hart until the next interrupt.
    unsafe { core::arch::asm!("wfi", options(nomem, nostack)) };
}
