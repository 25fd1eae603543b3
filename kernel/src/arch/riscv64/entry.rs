//! Boot entry: set up the boot stack and jump into `kernel_main`.

use core::arch::global_asm;

global_asm!(
    r#"
    .section .text.entry
    .globl _entry
_entry:
    la sp, _boot_stack_top
    call kernel_main
1:
    wfi
    j 1b

    .section .bss
    .align 12
    .globl _boot_stack
_boot_stack:
    .space 16384
    .globl _boot_stack_top
_boot_stack_top:
"#
);

extern "C" {
    static _boot_stack_top: u8;
}

/// Top of the boot thread's stack; used as the trap stack when the boot
/// thread enters user mode.
pub fn boot_stack_top() -> usize {
    // SAFETY: _boot_stack_top is a linker-provided symbol; only its address
    // is taken, never its contents.
    unsafe { core::ptr::addr_of!(_boot_stack_top) as usize }
}
