//! Boot-time memory initialization for the riscv64 target.
//!
//! Builds the main kernel address space:
//!
//! - identity-mapped R|W|G gigapages for everything below RAM (MMIO)
//! - per-page mappings of the kernel image: .text R|X|G, .rodata R|G,
//!   .data through the end of the first megapage R|W|G
//! - R|W|G megapages for the rest of RAM
//!
//! then enables Sv39 translation, sets SUM, initializes the heap, and
//! hands every remaining page to the frame allocator.

use super::frame_allocator::{self, MemoryRegion};
use super::page_table::{vpn0, vpn1, vpn2, PageTable, Pte, PteFlags};
use super::vas::{self, MemorySpace};
use super::{heap, round_up, PhysicalAddress};
use crate::arch::riscv64 as arch;
use crate::config::{
    GIGA_SIZE, HEAP_INIT_MIN, MEGA_SIZE, PAGE_SIZE, RAM_END, RAM_SIZE, RAM_START,
};

extern "C" {
    static _kimg_start: u8;
    static _kimg_text_start: u8;
    static _kimg_text_end: u8;
    static _kimg_rodata_start: u8;
    static _kimg_rodata_end: u8;
    static _kimg_data_start: u8;
    static _kimg_end: u8;
}

// Statically allocated boot page tables, linked into .bss.pagetable.
#[link_section = ".bss.pagetable"]
static mut MAIN_PT2: PageTable = PageTable::new();
#[link_section = ".bss.pagetable"]
static mut MAIN_PT1: PageTable = PageTable::new();
#[link_section = ".bss.pagetable"]
static mut MAIN_PT0: PageTable = PageTable::new();

fn sym(addr: &'static u8) -> usize {
    core::ptr::addr_of!(*addr) as usize
}

/// Set up the main address space, heap, and page pool.
pub fn memory_init() {
    // SAFETY: taking addresses of the linker symbols only.
    let (kimg_start, text_start, text_end, rodata_start, rodata_end, data_start, kimg_end) = unsafe {
        (
            sym(&_kimg_start),
            sym(&_kimg_text_start),
            sym(&_kimg_text_end),
            sym(&_kimg_rodata_start),
            sym(&_kimg_rodata_end),
            sym(&_kimg_data_start),
            sym(&_kimg_end),
        )
    };

    assert_eq!(kimg_start, RAM_START, "kernel image must start at RAM_START");
    // The kernel image must fit inside the first megapage.
    assert!(kimg_end - kimg_start <= MEGA_SIZE, "kernel too large");

    log::info!(
        "           RAM: [{:#x},{:#x}): {} MiB",
        RAM_START,
        RAM_END,
        RAM_SIZE / 1024 / 1024
    );
    log::info!("  Kernel image: [{:#x},{:#x})", kimg_start, kimg_end);

    // SAFETY: boot runs single-threaded before translation is enabled; the
    // static tables are written once here.
    let (pt2, pt1, pt0) = unsafe {
        (
            &mut *core::ptr::addr_of_mut!(MAIN_PT2),
            &mut *core::ptr::addr_of_mut!(MAIN_PT1),
            &mut *core::ptr::addr_of_mut!(MAIN_PT0),
        )
    };

    // Identity-map everything below RAM as R|W|G gigapages (MMIO region).
    let mut pma = 0usize;
    while pma < RAM_START {
        pt2[vpn2(pma)] = Pte::leaf(
            PhysicalAddress::new(pma),
            PteFlags::R | PteFlags::W | PteFlags::G,
        );
        pma += GIGA_SIZE;
    }

    // RAM's gigarange goes through a second-level table.
    pt2[vpn2(RAM_START)] = Pte::table(
        PhysicalAddress::new(pt1 as *const PageTable as usize),
        PteFlags::G,
    );
    pt1[vpn1(RAM_START)] = Pte::table(
        PhysicalAddress::new(pt0 as *const PageTable as usize),
        PteFlags::G,
    );

    // First megapage of RAM: per-page permissions from the image layout.
    let mut pp = text_start;
    while pp < text_end {
        pt0[vpn0(pp)] = Pte::leaf(
            PhysicalAddress::new(pp),
            PteFlags::R | PteFlags::X | PteFlags::G,
        );
        pp += PAGE_SIZE;
    }
    let mut pp = rodata_start;
    while pp < rodata_end {
        pt0[vpn0(pp)] = Pte::leaf(PhysicalAddress::new(pp), PteFlags::R | PteFlags::G);
        pp += PAGE_SIZE;
    }
    let mut pp = data_start;
    while pp < RAM_START + MEGA_SIZE {
        pt0[vpn0(pp)] = Pte::leaf(
            PhysicalAddress::new(pp),
            PteFlags::R | PteFlags::W | PteFlags::G,
        );
        pp += PAGE_SIZE;
    }

    // Remaining RAM as R|W|G megapages.
    let mut pp = RAM_START + MEGA_SIZE;
    while pp < RAM_END {
        pt1[vpn1(pp)] = Pte::leaf(
            PhysicalAddress::new(pp),
            PteFlags::R | PteFlags::W | PteFlags::G,
        );
        pp += MEGA_SIZE;
    }

    // Enable paging.
    let main = MemorySpace::from_root(PhysicalAddress::new(pt2 as *const PageTable as usize));
    vas::init_main_space(main);

    // Supervisor access to U-mapped pages (syscall buffer copies).
    arch::set_sum();

    // Heap: from the image end to the next page boundary, grown to at
    // least HEAP_INIT_MIN.
    let heap_start = kimg_end;
    let mut heap_end = round_up(heap_start, PAGE_SIZE);
    if heap_end - heap_start < HEAP_INIT_MIN {
        heap_end += round_up(HEAP_INIT_MIN - (heap_end - heap_start), PAGE_SIZE);
    }
    assert!(heap_end <= RAM_END, "not enough memory for the heap");

    // SAFETY: [heap_start, heap_end) is unused RAM past the image.
    unsafe { heap::init(heap_start, heap_end) };
    log::info!(
        "Heap allocator: [{:#x},{:#x}): {} KiB free",
        heap_start,
        heap_end,
        (heap_end - heap_start) / 1024
    );

    // Every page above the heap goes on the free list.
    frame_allocator::init(MemoryRegion::new(heap_end, RAM_END));
    log::info!(
        "Page allocator: [{:#x},{:#x}): {} pages free",
        heap_end,
        RAM_END,
        frame_allocator::free_count()
    );
}
