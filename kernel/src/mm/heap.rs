//! Kernel heap.
//!
//! The region between the end of the kernel image and the first free page
//! is handed to a linked-list allocator at boot. Host targets use the
//! system allocator instead (see lib.rs).

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand `[start, end)` to the heap allocator.
///
/// # Safety
/// The range must be unused, writable kernel memory, and this must be
/// called exactly once before the first allocation.
#[cfg(target_os = "none")]
pub unsafe fn init(start: usize, end: usize) {
    // SAFETY: per the function contract.
    unsafe {
        ALLOCATOR.lock().init(start as *mut u8, end - start);
    }
}
