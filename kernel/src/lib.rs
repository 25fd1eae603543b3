//! CobaltOS kernel library.
//!
//! The crate is `no_std`; on non-bare-metal targets (host unit tests and
//! tooling) it links `std` and uses the system allocator so the memory,
//! filesystem, and loader logic can be exercised with the standard test
//! harness. On bare metal the kernel heap is the global allocator.

#![no_std]

extern crate alloc;

// Host target: link std so unit tests can allocate and synchronize
// normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod console;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod io;
pub mod irq;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod syscall;
pub mod timer;

// Re-exports used across module boundaries and by the boot binary.
pub use error::{KernelError, KernelResult};
pub use mm::{FrameNumber, MemoryRegion, PhysicalAddress, VirtualAddress};
