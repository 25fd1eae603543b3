//! Platform-level interrupt controller (SiFive PLIC layout, as on the QEMU
//! virt machine). Only hart 0's S-mode context is used.

use crate::config::PLIC_BASE;

/// S-mode context of hart 0.
const CONTEXT: usize = 1;

const PRIORITY_BASE: usize = 0x0;
const ENABLE_BASE: usize = 0x2000;
const ENABLE_STRIDE: usize = 0x80;
const CONTEXT_BASE: usize = 0x20_0000;
const CONTEXT_STRIDE: usize = 0x1000;
const THRESHOLD_OFF: usize = 0x0;
const CLAIM_OFF: usize = 0x4;

fn reg(offset: usize) -> *mut u32 {
    (PLIC_BASE + offset) as *mut u32
}

/// Accept interrupts of any priority on this context.
pub fn init() {
    // SAFETY: PLIC_BASE is the platform's PLIC MMIO window, identity-mapped
    // at boot; the threshold register is 4-byte and writable.
    unsafe {
        reg(CONTEXT_BASE + CONTEXT * CONTEXT_STRIDE + THRESHOLD_OFF).write_volatile(0);
    }
}

/// Set the priority of an interrupt source (0 disables the source).
pub fn set_priority(irq: u32, prio: u32) {
    // SAFETY: priority registers are one u32 per source starting at the
    // PLIC base; irq numbers come from the platform config.
    unsafe {
        reg(PRIORITY_BASE + 4 * irq as usize).write_volatile(prio);
    }
}

/// Unmask an interrupt source for this context.
pub fn enable_irq(irq: u32) {
    let word = ENABLE_BASE + CONTEXT * ENABLE_STRIDE + 4 * (irq as usize / 32);
    // SAFETY: read-modify-write of the context's enable bitmap; interrupt
    // registration happens under the caller's interrupt-disable guard.
    unsafe {
        let p = reg(word);
        p.write_volatile(p.read_volatile() | (1 << (irq % 32)));
    }
}

/// Mask an interrupt source for this context.
pub fn disable_irq(irq: u32) {
    let word = ENABLE_BASE + CONTEXT * ENABLE_STRIDE + 4 * (irq as usize / 32);
    // SAFETY: see enable_irq.
    unsafe {
        let p = reg(word);
        p.write_volatile(p.read_volatile() & !(1 << (irq % 32)));
    }
}

/// Claim the highest-priority pending interrupt; 0 means none pending.
pub fn claim() -> u32 {
    // SAFETY: reading the claim register atomically claims the source.
    unsafe { reg(CONTEXT_BASE + CONTEXT * CONTEXT_STRIDE + CLAIM_OFF).read_volatile() }
}

/// Signal completion of a previously claimed interrupt.
pub fn complete(irq: u32) {
    // SAFETY: writing the claimed source number back completes it.
    unsafe {
        reg(CONTEXT_BASE + CONTEXT * CONTEXT_STRIDE + CLAIM_OFF).write_volatile(irq);
    }
}
