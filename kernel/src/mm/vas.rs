//! Address-space lifecycle: creation, switching, mapping, reclamation, and
//! the store-fault handler.
//!
//! A space is identified by its satp-format tag (Sv39 mode bits | root
//! PPN). The active tag is mirrored in a kernel global beside satp so every
//! walker reads the same source of truth on target and host.

use core::sync::atomic::{AtomicU64, Ordering};

use super::page_table::{walk, PageTable, Pte, PteFlags, PTE_CNT};
use super::{frame_allocator, round_up, PhysicalAddress, VirtualAddress};
use crate::arch;
use crate::config::{PAGE_SIZE, USER_END_VMA, USER_START_VMA};
use crate::error::{KernelError, KernelResult};

const SATP_MODE_SV39: u64 = 8 << 60;

/// An address space: the Sv39 mode/root-PPN bundle swapped on a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySpace(u64);

impl MemorySpace {
    /// Tag for a space rooted at `root` (page-aligned).
    pub fn from_root(root: PhysicalAddress) -> Self {
        debug_assert!(root.is_page_aligned());
        Self(SATP_MODE_SV39 | (root.as_usize() as u64 >> 12))
    }

    pub const fn tag(&self) -> u64 {
        self.0
    }

    pub fn root_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(((self.0 & !(0xF << 60)) << 12) as usize)
    }

    pub fn root_ptr(&self) -> *mut PageTable {
        self.root_phys().as_usize() as *mut PageTable
    }
}

static MAIN_SPACE: AtomicU64 = AtomicU64::new(0);
static ACTIVE_SPACE: AtomicU64 = AtomicU64::new(0);

/// The shared kernel address space set up at boot.
pub fn main_space() -> MemorySpace {
    MemorySpace(MAIN_SPACE.load(Ordering::Acquire))
}

/// The currently active address space.
pub fn active_space() -> MemorySpace {
    MemorySpace(ACTIVE_SPACE.load(Ordering::Acquire))
}

/// Root table of the active space.
pub fn active_space_root() -> *mut PageTable {
    active_space().root_ptr()
}

/// Record the boot-time kernel space and make it active.
pub fn init_main_space(space: MemorySpace) {
    MAIN_SPACE.store(space.tag(), Ordering::Release);
    ACTIVE_SPACE.store(space.tag(), Ordering::Release);
    arch::satp_write(space.tag());
    arch::sfence_vma();
}

/// Switch to `space`, returning the previously active space.
pub fn space_switch(space: MemorySpace) -> MemorySpace {
    let prev = ACTIVE_SPACE.swap(space.tag(), Ordering::AcqRel);
    arch::satp_write(space.tag());
    arch::sfence_vma();
    MemorySpace(prev)
}

/// Create a new space sharing the kernel mappings of the main space.
///
/// Gigapage leaves in the main root are copied verbatim (they are global
/// MMIO/RAM mappings); table branches are deep-copied so per-space user
/// mappings never leak into another space. Leaf entries keep their flags;
/// copied interior entries drop G so `space_reclaim` can free the copies.
pub fn space_create() -> KernelResult<MemorySpace> {
    let root = alloc_table_frame();
    let main_root = main_space().root_ptr();
    for idx in 0..PTE_CNT {
        // SAFETY: the main root is a live table; root was just allocated
        // and zeroed.
        let entry = unsafe { (&*main_root)[idx] };
        if entry.is_table() {
            let copy = clone_table_tree(entry.frame().expect("table entry has frame"));
            // SAFETY: root is exclusively ours until returned.
            unsafe { (&mut (*root))[idx] = Pte::table(copy, PteFlags::empty()) };
        } else if entry.is_valid() {
            // SAFETY: as above.
            unsafe { (&mut (*root))[idx] = entry };
        }
    }
    // SAFETY: root is a valid, fully initialized table.
    Ok(MemorySpace::from_root(PhysicalAddress::new(root as usize)))
}

fn clone_table_tree(table: PhysicalAddress) -> PhysicalAddress {
    let copy = alloc_table_frame();
    let src = table.as_usize() as *const PageTable;
    for idx in 0..PTE_CNT {
        // SAFETY: src is a live table of the main space; copy is ours.
        let entry = unsafe { (&*src)[idx] };
        if entry.is_table() {
            let child = clone_table_tree(entry.frame().expect("table entry has frame"));
            // SAFETY: copy is exclusively ours.
            unsafe { (&mut (*copy))[idx] = Pte::table(child, PteFlags::empty()) };
        } else if entry.is_valid() {
            // SAFETY: as above.
            unsafe { (&mut (*copy))[idx] = entry };
        }
    }
    PhysicalAddress::new(copy as usize)
}

fn alloc_table_frame() -> *mut PageTable {
    let frame = frame_allocator::alloc_page();
    // SAFETY: fresh frame, exclusively ours; tables start zeroed.
    unsafe { core::ptr::write_bytes(frame.as_mut_ptr(), 0, PAGE_SIZE) };
    frame.as_usize() as *mut PageTable
}

/// Allocate one frame and map it at `vma` in the active space with
/// `rwxug | A | D | V`. If a valid leaf is already present the existing
/// frame is kept and its flags widened, so overlapping range maps never
/// drop data.
pub fn alloc_and_map_page(vma: usize, rwxug: PteFlags) -> VirtualAddress {
    // SAFETY: the active root is a live table tree.
    let pte = unsafe { walk(active_space_root(), vma, true) }.expect("create walk");
    // SAFETY: walk returned a live leaf slot.
    let slot = unsafe { &mut *pte };
    if slot.is_leaf() {
        slot.set_flags(slot.flags() | rwxug);
    } else {
        let frame = frame_allocator::alloc_page();
        // SAFETY: fresh frame; zeroed so BSS tails and demand pages read 0.
        unsafe { core::ptr::write_bytes(frame.as_mut_ptr(), 0, PAGE_SIZE) };
        *slot = Pte::leaf(frame, rwxug);
    }
    arch::sfence_vma();
    VirtualAddress::new(vma)
}

/// Map `size` bytes (rounded up to pages) starting at `vma`; the virtual
/// address is taken as given.
pub fn alloc_and_map_range(vma: usize, size: usize, rwxug: PteFlags) -> VirtualAddress {
    let size = round_up(size, PAGE_SIZE);
    let mut offset = 0;
    while offset < size {
        alloc_and_map_page(vma + offset, rwxug);
        offset += PAGE_SIZE;
    }
    VirtualAddress::new(vma)
}

/// Replace the flags of an existing leaf; A|D|V are reasserted. Calling
/// this on a never-mapped page is a contract violation.
pub fn set_page_flags(vma: usize, rwxug: PteFlags) {
    // SAFETY: the active root is a live table tree.
    let pte = unsafe { walk(active_space_root(), vma, false) };
    let pte = pte.expect("set_page_flags on unmapped region");
    // SAFETY: walk returned a live leaf slot.
    let slot = unsafe { &mut *pte };
    assert!(slot.is_valid(), "set_page_flags on unmapped page {:#x}", vma);
    slot.set_flags(rwxug);
    arch::sfence_vma();
}

/// Replace the flags on every page of `[vma, vma + size)`.
pub fn set_range_flags(vma: usize, size: usize, rwxug: PteFlags) {
    let size = round_up(size, PAGE_SIZE);
    let mut offset = 0;
    while offset < size {
        set_page_flags(vma + offset, rwxug);
        offset += PAGE_SIZE;
    }
}

/// Reclaim every U-marked leaf frame of the active space and free the
/// U-marked interior tables; the root itself is untouched. Afterwards the
/// active root holds no U-flagged entry at any level.
pub fn unmap_and_free_user() {
    let root = active_space_root();
    for i2 in 0..PTE_CNT {
        // SAFETY: root is the live active table tree throughout this walk.
        let l2 = unsafe { &mut (&mut (*root))[i2] };
        if !l2.is_table() {
            continue;
        }
        let pt1 = l2.frame().expect("table entry has frame").as_usize() as *mut PageTable;
        for i1 in 0..PTE_CNT {
            // SAFETY: pt1 is a live interior table of the active space.
            let l1 = unsafe { &mut (&mut (*pt1))[i1] };
            if !l1.is_table() {
                continue;
            }
            let pt0 = l1.frame().expect("table entry has frame").as_usize() as *mut PageTable;
            for i0 in 0..PTE_CNT {
                // SAFETY: pt0 is a live leaf table of the active space.
                let l0 = unsafe { &mut (&mut (*pt0))[i0] };
                if l0.is_leaf() && l0.flags().contains(PteFlags::U) {
                    let frame = l0.frame().expect("leaf has frame");
                    l0.clear();
                    arch::sfence_vma();
                    frame_allocator::free_page(frame);
                }
            }
            if l1.flags().contains(PteFlags::U) {
                let table = l1.frame().expect("table entry has frame");
                l1.clear();
                arch::sfence_vma();
                frame_allocator::free_page(table);
            }
        }
        if l2.flags().contains(PteFlags::U) {
            let table = l2.frame().expect("table entry has frame");
            l2.clear();
            arch::sfence_vma();
            frame_allocator::free_page(table);
        }
    }
}

/// Switch back to the main space and tear down the previously active one:
/// every non-global leaf frame, every non-global interior table, and the
/// root go back to the page allocator.
pub fn space_reclaim() {
    let prev = space_switch(main_space());
    if prev == main_space() || prev.tag() == 0 {
        return;
    }
    let root = prev.root_ptr();
    for i2 in 0..PTE_CNT {
        // SAFETY: prev's table tree stays alive until this walk frees it;
        // it is no longer the active translation.
        let l2 = unsafe { &mut (&mut (*root))[i2] };
        if !l2.is_table() {
            continue;
        }
        let pt1 = l2.frame().expect("table entry has frame").as_usize() as *mut PageTable;
        for i1 in 0..PTE_CNT {
            // SAFETY: as above.
            let l1 = unsafe { &mut (&mut (*pt1))[i1] };
            if !l1.is_table() {
                continue;
            }
            let pt0 = l1.frame().expect("table entry has frame").as_usize() as *mut PageTable;
            for i0 in 0..PTE_CNT {
                // SAFETY: as above.
                let l0 = unsafe { &mut (&mut (*pt0))[i0] };
                if l0.is_leaf() && !l0.flags().contains(PteFlags::G) {
                    let frame = l0.frame().expect("leaf has frame");
                    l0.clear();
                    frame_allocator::free_page(frame);
                }
            }
            if !l1.flags().contains(PteFlags::G) {
                let table = l1.frame().expect("table entry has frame");
                l1.clear();
                frame_allocator::free_page(table);
            }
        }
        if !l2.flags().contains(PteFlags::G) {
            let table = l2.frame().expect("table entry has frame");
            l2.clear();
            frame_allocator::free_page(table);
        }
    }
    frame_allocator::free_page(prev.root_phys());
    arch::sfence_vma();
}

/// Service a store fault at `vma`: inside the user window, install a fresh
/// zeroed R|W|U page (replacing and freeing any frame already there);
/// anywhere else the fault is fatal.
pub fn handle_page_fault(vma: usize) {
    if !(USER_START_VMA..USER_END_VMA).contains(&vma) {
        panic!("page fault outside user range: {:#x}", vma);
    }
    // SAFETY: the active root is a live table tree.
    let pte = unsafe { walk(active_space_root(), vma, true) }.expect("create walk");
    // SAFETY: walk returned a live leaf slot.
    let slot = unsafe { &mut *pte };
    let old = if slot.is_leaf() { slot.frame() } else { None };
    let frame = frame_allocator::alloc_page();
    // SAFETY: fresh frame; demand-faulted pages must read as zero.
    unsafe { core::ptr::write_bytes(frame.as_mut_ptr(), 0, PAGE_SIZE) };
    *slot = Pte::leaf(frame, PteFlags::R | PteFlags::W | PteFlags::U);
    arch::sfence_vma();
    if let Some(old) = old {
        frame_allocator::free_page(old);
    }
}

/// Resolve `vma` through the active space to its physical address,
/// including the page offset. `None` when no valid leaf maps it.
pub fn translate(vma: usize) -> Option<PhysicalAddress> {
    // SAFETY: the active root is a live table tree.
    let pte = unsafe { walk(active_space_root(), vma, false) }?;
    // SAFETY: walk returned a live leaf slot.
    let slot = unsafe { *pte };
    if !slot.is_leaf() {
        return None;
    }
    let base = slot.frame().expect("leaf has frame");
    Some(PhysicalAddress::new(base.as_usize() + vma % PAGE_SIZE))
}

/// Leaf flags for `vma` in the active space, if mapped.
pub fn page_flags(vma: usize) -> Option<PteFlags> {
    // SAFETY: the active root is a live table tree.
    let pte = unsafe { walk(active_space_root(), vma, false) }?;
    // SAFETY: walk returned a live leaf slot.
    let slot = unsafe { *pte };
    slot.is_leaf().then(|| slot.flags())
}

/// Copy `data` into the active-space mapping of `[vma, vma + data.len())`,
/// resolving each page through the walker. Every page must be mapped.
pub fn copy_to_range(vma: usize, data: &[u8]) -> KernelResult<()> {
    let mut done = 0;
    while done < data.len() {
        let va = vma + done;
        let pa = translate(va).ok_or(KernelError::Access)?;
        let chunk = (PAGE_SIZE - va % PAGE_SIZE).min(data.len() - done);
        // SAFETY: pa resolves a mapped frame; chunk stays inside the page.
        unsafe {
            core::ptr::copy_nonoverlapping(data[done..].as_ptr(), pa.as_mut_ptr(), chunk);
        }
        done += chunk;
    }
    Ok(())
}

/// Copy `buf.len()` bytes out of the active-space mapping at `vma`.
pub fn copy_from_range(vma: usize, buf: &mut [u8]) -> KernelResult<()> {
    let mut done = 0;
    while done < buf.len() {
        let va = vma + done;
        let pa = translate(va).ok_or(KernelError::Access)?;
        let chunk = (PAGE_SIZE - va % PAGE_SIZE).min(buf.len() - done);
        // SAFETY: pa resolves a mapped frame; chunk stays inside the page.
        unsafe {
            core::ptr::copy_nonoverlapping(pa.as_ptr(), buf[done..].as_mut_ptr(), chunk);
        }
        done += chunk;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared scaffolding for tests that need a live space: a RAM arena, a
    //! fresh main space, and the test serialization lock.

    use super::*;
    use crate::mm::testing::{self, Arena};
    use std::sync::MutexGuard;

    pub struct SpaceEnv {
        pub arena: Arena,
        _guard: MutexGuard<'static, ()>,
    }

    /// Install a fresh, empty main space over a new arena.
    pub fn fresh(pages: usize) -> SpaceEnv {
        let guard = testing::lock();
        let arena = Arena::new(pages);
        frame_allocator::init(arena.region());
        let root = alloc_table_frame();
        init_main_space(MemorySpace::from_root(PhysicalAddress::new(root as usize)));
        SpaceEnv {
            arena,
            _guard: guard,
        }
    }
}
