//! Kernel console: print macros and the `log` facade backend, both writing
//! through the UART. On the host (unit tests) console output is dropped.

use core::fmt;

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use crate::config::UART0_BASE;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use crate::serial::Uart16550;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
static WRITER: Mutex<Option<Uart16550>> = Mutex::new(None);

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
static WRITER: Mutex<Option<()>> = Mutex::new(None);

/// Bring up the UART and install the kernel logger.
pub fn init() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let mut uart = Uart16550::new(UART0_BASE);
        uart.init();
        *WRITER.lock() = Some(uart);
    }
    let _ = log::set_logger(&KERNEL_LOG);
    log::set_max_level(LevelFilter::Info);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        use core::fmt::Write;
        let _guard = crate::arch::intr_disable();
        if let Some(uart) = WRITER.lock().as_mut() {
            let _ = uart.write_fmt(args);
        }
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    let _ = args;
}

struct KernelLog;

static KERNEL_LOG: KernelLog = KernelLog;

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::println!("[{:>5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_on_host_is_a_no_op() {
        _print(format_args!("dropped {}", 1));
        assert!(WRITER.lock().is_none());
    }
}
