//! External interrupt registration and dispatch.
//!
//! Drivers register an ISR for their IRQ line; the S-external trap path
//! claims sources from the PLIC, dispatches, and completes them before
//! returning.

use alloc::sync::Arc;

use spin::Mutex;

use crate::arch::{self, plic};

/// Highest interrupt source number handled.
pub const MAX_IRQ: usize = 64;

/// Implemented by drivers whose device raises interrupts. Called with
/// interrupts disabled; must acknowledge the device before returning.
pub trait IrqHandler: Send + Sync {
    fn handle_irq(&self, irq: u32);
}

static HANDLERS: Mutex<[Option<Arc<dyn IrqHandler>>; MAX_IRQ]> =
    Mutex::new([const { None }; MAX_IRQ]);

/// Register `handler` for `irq` at the given PLIC priority. The line is
/// registered but not yet enabled; drivers enable it on open.
pub fn register_isr(irq: u32, priority: u32, handler: Arc<dyn IrqHandler>) {
    assert!((irq as usize) < MAX_IRQ, "irq {} out of range", irq);
    let _guard = arch::intr_disable();
    let mut handlers = HANDLERS.lock();
    assert!(
        handlers[irq as usize].is_none(),
        "irq {} registered twice",
        irq
    );
    handlers[irq as usize] = Some(handler);
    plic::set_priority(irq, priority);
}

/// Unmask an interrupt line.
pub fn enable_irq(irq: u32) {
    plic::enable_irq(irq);
}

/// Mask an interrupt line.
pub fn disable_irq(irq: u32) {
    plic::disable_irq(irq);
}

/// S-external interrupt: claim, dispatch, complete, until no source is
/// pending. Spurious sources are ignored.
pub fn handle_external() {
    loop {
        let irq = plic::claim();
        if irq == 0 {
            break;
        }
        let handler = {
            let handlers = HANDLERS.lock();
            handlers.get(irq as usize).and_then(|h| h.clone())
        };
        if let Some(handler) = handler {
            handler.handle_irq(irq);
        }
        plic::complete(irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct Recorder {
        seen: AtomicU32,
    }

    impl IrqHandler for Recorder {
        fn handle_irq(&self, irq: u32) {
            self.seen.store(irq, Ordering::SeqCst);
        }
    }

    #[test]
    fn registration_is_single_shot_per_line() {
        let recorder = Arc::new(Recorder {
            seen: AtomicU32::new(0),
        });
        register_isr(42, 1, recorder.clone());
        let taken = HANDLERS.lock()[42].clone().expect("registered");
        taken.handle_irq(42);
        assert_eq!(recorder.seen.load(Ordering::SeqCst), 42);
    }
}
