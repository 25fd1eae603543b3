//! Trap entry and dispatch.
//!
//! A single direct-mode vector serves every trap. The convention for
//! sscratch: zero while executing in S-mode, the current kernel trap stack
//! top while executing in U-mode. The vector saves the full register file
//! into a `TrapFrame` on the kernel stack and calls `trap_handler`.

use core::arch::global_asm;

use riscv::register::{scause, stval, stvec};

use crate::arch::TrapFrame;

// TrapFrame layout: x[i] at 8*i, sstatus at 256, sepc at 264; 272 bytes,
// 16-byte aligned.
global_asm!(
    r#"
    .align 4
    .globl _trap_entry
_trap_entry:
    csrrw sp, sscratch, sp
    bnez sp, 1f
    csrrw sp, sscratch, sp
1:
    addi sp, sp, -272
    sd x1, 8(sp)
    sd x3, 24(sp)
    sd x4, 32(sp)
    sd x5, 40(sp)
    sd x6, 48(sp)
    sd x7, 56(sp)
    sd x8, 64(sp)
    sd x9, 72(sp)
    sd x10, 80(sp)
    sd x11, 88(sp)
    sd x12, 96(sp)
    sd x13, 104(sp)
    sd x14, 112(sp)
    sd x15, 120(sp)
    sd x16, 128(sp)
    sd x17, 136(sp)
    sd x18, 144(sp)
    sd x19, 152(sp)
    sd x20, 160(sp)
    sd x21, 168(sp)
    sd x22, 176(sp)
    sd x23, 184(sp)
    sd x24, 192(sp)
    sd x25, 200(sp)
    sd x26, 208(sp)
    sd x27, 216(sp)
    sd x28, 224(sp)
    sd x29, 232(sp)
    sd x30, 240(sp)
    sd x31, 248(sp)
    csrr t0, sscratch
    bnez t0, 2f
    addi t0, sp, 272
2:
    sd t0, 16(sp)
    csrw sscratch, zero
    csrr t1, sstatus
    sd t1, 256(sp)
    csrr t2, sepc
    sd t2, 264(sp)
    mv a0, sp
    call trap_handler
    ld t1, 256(sp)
    csrw sstatus, t1
    ld t2, 264(sp)
    csrw sepc, t2
    andi t0, t1, 0x100
    bnez t0, 3f
    addi t0, sp, 272
    csrw sscratch, t0
3:
    ld x1, 8(sp)
    ld x3, 24(sp)
    ld x4, 32(sp)
    ld x5, 40(sp)
    ld x6, 48(sp)
    ld x7, 56(sp)
    ld x8, 64(sp)
    ld x9, 72(sp)
    ld x10, 80(sp)
    ld x11, 88(sp)
    ld x12, 96(sp)
    ld x13, 104(sp)
    ld x14, 112(sp)
    ld x15, 120(sp)
    ld x16, 128(sp)
    ld x17, 136(sp)
    ld x18, 144(sp)
    ld x19, 152(sp)
    ld x20, 160(sp)
    ld x21, 168(sp)
    ld x22, 176(sp)
    ld x23, 184(sp)
    ld x24, 192(sp)
    ld x25, 200(sp)
    ld x26, 208(sp)
    ld x27, 216(sp)
    ld x28, 224(sp)
    ld x29, 232(sp)
    ld x30, 240(sp)
    ld x31, 248(sp)
    ld sp, 16(sp)
    sret
"#
);

extern "C" {
    fn _trap_entry();
}

/// Install the trap vector. Must run before interrupts are enabled.
pub fn init() {
    // SAFETY: _trap_entry is 4-byte aligned (`.align 4`) and follows the
    // TrapFrame save/restore contract above; sscratch starts zero per the
    // in-S-mode convention.
    unsafe {
        stvec::write(_trap_entry as usize, stvec::TrapMode::Direct);
        core::arch::asm!("csrw sscratch, zero", options(nostack));
    }
}

const SCAUSE_INTERRUPT: usize = 1 << 63;
const IRQ_S_TIMER: usize = 5;
const IRQ_S_EXTERNAL: usize = 9;
const EXC_ECALL_FROM_U: usize = 8;
const EXC_STORE_PAGE_FAULT: usize = 15;

/// Rust half of the trap vector.
#[no_mangle]
extern "C" fn trap_handler(tf: &mut TrapFrame) {
    let cause = scause::read().bits();
    let code = cause & !SCAUSE_INTERRUPT;

    if cause & SCAUSE_INTERRUPT != 0 {
        match code {
            IRQ_S_EXTERNAL => crate::irq::handle_external(),
            IRQ_S_TIMER => crate::timer::tick(),
            _ => panic!("unexpected interrupt: scause={:#x}", cause),
        }
        return;
    }

    match code {
        EXC_ECALL_FROM_U => crate::syscall::dispatch(tf),
        EXC_STORE_PAGE_FAULT => {
            // Store faults inside the user window are serviced by mapping a
            // fresh page; handle_page_fault is fatal for anything else.
            crate::mm::vas::handle_page_fault(stval::read());
        }
        _ => panic!(
            "unexpected trap: scause={:#x} sepc={:#x} stval={:#x}",
            cause,
            tf.sepc,
            stval::read()
        ),
    }
}
