//! S-mode to U-mode transition.
//!
//! The S→U transition requires:
//! - sstatus.SPP = 0 (sret returns to U-mode)
//! - sstatus.SPIE = 1 (interrupts enabled after sret)
//! - sepc set to the user entry point
//! - sscratch set to the kernel trap stack (for the ecall trap path)

use core::arch::asm;

/// Enter user mode at `entry` with the given user stack pointer.
///
/// # Safety
/// - `entry` must be a U-executable mapping in the active address space
/// - `user_sp` must lie in the user window (it is the initial sp only; the
///   first stack push will demand-fault the page in)
/// - `kernel_sp` must be the top of a valid kernel stack reserved for traps
/// - the trap vector must already be installed
pub unsafe fn enter_usermode(entry: usize, user_sp: usize, kernel_sp: usize) -> ! {
    // SAFETY: per the function contract; after this asm the CPU is in
    // U-mode and never returns here.
    unsafe {
        asm!(
            // Kernel trap stack for the ecall handler.
            "csrw sscratch, {ksp}",
            "csrw sepc, {entry}",
            // Clear SPP (bit 8): sret targets U-mode.
            "csrc sstatus, {spp}",
            // Set SPIE (bit 5): interrupts on after sret.
            "csrs sstatus, {spie}",
            "mv sp, {usp}",
            "sfence.vma",
            "sret",
            entry = in(reg) entry,
            usp = in(reg) user_sp,
            ksp = in(reg) kernel_sp,
            spp = in(reg) 1usize << 8,
            spie = in(reg) 1usize << 5,
            options(noreturn)
        );
    }
}
