//! Validation of user-supplied pointers against the active page table.
//!
//! Every syscall that dereferences a user pointer validates it first: the
//! spanned pages must be mapped by valid leaves whose flags are a superset
//! of what the operation requires.

use super::page_table::PteFlags;
use super::vas;
use crate::config::PAGE_SIZE;
use crate::error::{KernelError, KernelResult};

/// Check that every page of `[vp, vp + len)` is mapped with at least
/// `rwxug`. Zero-length spans are trivially valid.
pub fn validate_vptr_len(vp: usize, len: usize, rwxug: PteFlags) -> KernelResult<()> {
    if len == 0 {
        return Ok(());
    }
    let end = vp.checked_add(len).ok_or(KernelError::Access)?;
    let mut page = vp - vp % PAGE_SIZE;
    while page < end {
        let flags = vas::page_flags(page).ok_or(KernelError::Access)?;
        if !flags.contains(rwxug) {
            return Err(KernelError::Access);
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// Check that `vs` points at a NUL-terminated string fully contained in
/// pages mapped with at least `ug`. Returns the string length (bytes before
/// the NUL). Running off the mapped region fails with `Access`.
pub fn validate_vstr(vs: usize, ug: PteFlags) -> KernelResult<usize> {
    let mut addr = vs;
    loop {
        let page = addr - addr % PAGE_SIZE;
        let flags = vas::page_flags(page).ok_or(KernelError::Access)?;
        if !flags.contains(ug) {
            return Err(KernelError::Access);
        }
        let pa = vas::translate(addr).ok_or(KernelError::Access)?;
        let span = PAGE_SIZE - addr % PAGE_SIZE;
        // SAFETY: the page is mapped by a valid leaf; the slice stays
        // inside it.
        let bytes = unsafe { core::slice::from_raw_parts(pa.as_ptr(), span) };
        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            return Ok(addr - vs + nul);
        }
        addr += span;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::USER_START_VMA;
    use crate::mm::vas::test_support::fresh;

    #[test]
    fn validates_flag_supersets_per_page() {
        let _env = fresh(32);
        let vma = USER_START_VMA;
        vas::alloc_and_map_range(vma, 2 * PAGE_SIZE, PteFlags::R | PteFlags::W | PteFlags::U);

        assert!(validate_vptr_len(vma, 2 * PAGE_SIZE, PteFlags::U | PteFlags::W).is_ok());
        assert!(validate_vptr_len(vma + 100, PAGE_SIZE, PteFlags::U).is_ok());
        // X is not set anywhere in the range.
        assert_eq!(
            validate_vptr_len(vma, 8, PteFlags::U | PteFlags::X),
            Err(KernelError::Access)
        );
        // The span runs one byte past the mapped pages.
        assert_eq!(
            validate_vptr_len(vma, 2 * PAGE_SIZE + 1, PteFlags::U),
            Err(KernelError::Access)
        );
        assert!(validate_vptr_len(vma, 0, PteFlags::U).is_ok());
    }

    #[test]
    fn unmapped_pointer_is_rejected() {
        let _env = fresh(16);
        assert_eq!(
            validate_vptr_len(USER_START_VMA, 4, PteFlags::U),
            Err(KernelError::Access)
        );
    }

    #[test]
    fn string_validation_finds_the_nul() {
        let _env = fresh(32);
        let vma = USER_START_VMA;
        vas::alloc_and_map_range(vma, 2 * PAGE_SIZE, PteFlags::R | PteFlags::W | PteFlags::U);
        vas::copy_to_range(vma, b"hello, kernel\0").expect("copy");

        assert_eq!(validate_vstr(vma, PteFlags::U), Ok(13));
        // Freshly mapped pages are zeroed, so an empty string validates.
        assert_eq!(validate_vstr(vma + 64, PteFlags::U), Ok(0));
    }

    #[test]
    fn string_crossing_pages_validates_across_the_boundary() {
        let _env = fresh(32);
        let vma = USER_START_VMA;
        vas::alloc_and_map_range(vma, 2 * PAGE_SIZE, PteFlags::R | PteFlags::W | PteFlags::U);
        let start = vma + PAGE_SIZE - 3;
        vas::copy_to_range(start, b"abcdef\0").expect("copy");
        assert_eq!(validate_vstr(start, PteFlags::U), Ok(6));
    }

    #[test]
    fn unterminated_string_hits_the_unmapped_edge() {
        let _env = fresh(32);
        let vma = USER_START_VMA;
        vas::alloc_and_map_page(vma, PteFlags::R | PteFlags::W | PteFlags::U);
        // Fill the whole page with non-zero bytes; the next page is unmapped.
        let fill = alloc::vec![0x41u8; PAGE_SIZE];
        vas::copy_to_range(vma, &fill).expect("copy");
        assert_eq!(validate_vstr(vma, PteFlags::U), Err(KernelError::Access));
    }
}
