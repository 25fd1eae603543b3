//! ELF64 program loader.
//!
//! Validates the header (each check has its own error tag), then streams
//! every PT_LOAD segment into freshly mapped user pages and installs the
//! segment's final permissions. Segment bytes are written through the
//! page-table walk, so loading does not require the target range to be
//! reachable as raw pointers.

use alloc::vec;

use crate::config::{PAGE_SIZE, USER_END_VMA, USER_START_VMA};
use crate::error::{ElfError, KernelResult};
use crate::io::{read_fully, seek, Io};
use crate::mm::page_table::PteFlags;
use crate::mm::{vas, VirtualAddress};

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_OSABI: usize = 7;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFOSABI_SYSV: u8 = 0;
const EM_RISCV: u16 = 0xF3;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

struct Elf64Ehdr {
    ident: [u8; 16],
    machine: u16,
    entry: u64,
    phoff: u64,
    phentsize: u16,
    phnum: u16,
}

impl Elf64Ehdr {
    fn parse(raw: &[u8; EHDR_SIZE]) -> Self {
        let half = |off: usize| u16::from_le_bytes(raw[off..off + 2].try_into().unwrap());
        let xword = |off: usize| u64::from_le_bytes(raw[off..off + 8].try_into().unwrap());
        Self {
            ident: raw[..16].try_into().unwrap(),
            machine: half(18),
            entry: xword(24),
            phoff: xword(32),
            phentsize: half(54),
            phnum: half(56),
        }
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
}

impl Elf64Phdr {
    fn parse(raw: &[u8; PHDR_SIZE]) -> Self {
        let word = |off: usize| u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
        let xword = |off: usize| u64::from_le_bytes(raw[off..off + 8].try_into().unwrap());
        Self {
            p_type: word(0),
            p_flags: word(4),
            p_offset: xword(8),
            p_vaddr: xword(16),
            p_filesz: xword(32),
        }
    }
}

/// Map ELF segment permission bits onto PTE access bits.
fn flag_convert(p_flags: u32) -> PteFlags {
    let mut flags = PteFlags::empty();
    if p_flags & PF_X != 0 {
        flags |= PteFlags::X;
    }
    if p_flags & PF_W != 0 {
        flags |= PteFlags::W;
    }
    if p_flags & PF_R != 0 {
        flags |= PteFlags::R;
    }
    flags
}

/// Load the executable behind `io` into the active address space and
/// return its entry point.
pub fn elf_load(io: &dyn Io) -> KernelResult<VirtualAddress> {
    seek(io, 0).map_err(|_| ElfError::ReadFailure)?;

    let mut raw = [0u8; EHDR_SIZE];
    let got = read_fully(io, &mut raw).map_err(|_| ElfError::ReadFailure)?;
    if got < EHDR_SIZE {
        return Err(ElfError::ShortHeader.into());
    }
    let ehdr = Elf64Ehdr::parse(&raw);

    if ehdr.ident[..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic.into());
    }
    if ehdr.ident[EI_CLASS] != ELFCLASS64 {
        return Err(ElfError::BadClass.into());
    }
    if ehdr.ident[EI_DATA] != ELFDATA2LSB {
        return Err(ElfError::BadEndian.into());
    }
    if ehdr.ident[EI_OSABI] != ELFOSABI_SYSV {
        return Err(ElfError::BadAbi.into());
    }
    if ehdr.machine != EM_RISCV {
        return Err(ElfError::BadMachine.into());
    }

    for i in 0..ehdr.phnum as u64 {
        let mut raw = [0u8; PHDR_SIZE];
        seek(io, ehdr.phoff + i * ehdr.phentsize as u64)
            .map_err(|_| ElfError::ProgHeaderRead)?;
        let got = read_fully(io, &mut raw).map_err(|_| ElfError::ProgHeaderRead)?;
        if got < PHDR_SIZE {
            return Err(ElfError::ProgHeaderRead.into());
        }
        let phdr = Elf64Phdr::parse(&raw);
        if phdr.p_type != PT_LOAD {
            continue;
        }

        let vaddr = phdr.p_vaddr as usize;
        let end = phdr
            .p_vaddr
            .checked_add(phdr.p_filesz)
            .ok_or(ElfError::ProgAddr)? as usize;
        if vaddr < USER_START_VMA || end > USER_END_VMA {
            return Err(ElfError::ProgAddr.into());
        }

        // Map writable first so the segment bytes can be streamed in; the
        // real permissions land afterwards.
        let filesz = phdr.p_filesz as usize;
        vas::alloc_and_map_range(vaddr, filesz, PteFlags::R | PteFlags::W);

        seek(io, phdr.p_offset).map_err(|_| ElfError::ProgSegRead)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut done = 0;
        while done < filesz {
            let chunk = (filesz - done).min(PAGE_SIZE);
            let got = read_fully(io, &mut buf[..chunk]).map_err(|_| ElfError::ProgSegRead)?;
            if got < chunk {
                return Err(ElfError::ProgSegRead.into());
            }
            vas::copy_to_range(vaddr + done, &buf[..chunk])
                .map_err(|_| ElfError::ProgSegRead)?;
            done += chunk;
        }

        vas::set_range_flags(vaddr, filesz, flag_convert(phdr.p_flags) | PteFlags::U);
    }

    Ok(VirtualAddress::new(ehdr.entry as usize))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builders for small ELF images.

    use super::*;
    use alloc::vec::Vec;

    pub struct ElfImage {
        pub machine: u16,
        pub class: u8,
        pub endian: u8,
        pub abi: u8,
        pub entry: u64,
        pub segments: Vec<(u64, u32, Vec<u8>)>, // (vaddr, p_flags, bytes)
    }

    impl ElfImage {
        pub fn riscv(entry: u64) -> Self {
            Self {
                machine: EM_RISCV,
                class: ELFCLASS64,
                endian: ELFDATA2LSB,
                abi: ELFOSABI_SYSV,
                entry,
                segments: Vec::new(),
            }
        }

        pub fn segment(mut self, vaddr: u64, p_flags: u32, bytes: Vec<u8>) -> Self {
            self.segments.push((vaddr, p_flags, bytes));
            self
        }

        pub fn build(&self) -> Vec<u8> {
            let phnum = self.segments.len();
            let phoff = EHDR_SIZE as u64;
            let mut data_off = EHDR_SIZE + phnum * PHDR_SIZE;

            let mut image = Vec::new();
            image.extend_from_slice(&ELF_MAGIC);
            image.push(self.class);
            image.push(self.endian);
            image.push(1); // EI_VERSION
            image.push(self.abi);
            image.extend_from_slice(&[0u8; 8]); // ABI version + padding
            image.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
            image.extend_from_slice(&self.machine.to_le_bytes());
            image.extend_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
            image.extend_from_slice(&self.entry.to_le_bytes());
            image.extend_from_slice(&phoff.to_le_bytes());
            image.extend_from_slice(&0u64.to_le_bytes()); // shoff
            image.extend_from_slice(&0u32.to_le_bytes()); // flags
            image.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
            image.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
            image.extend_from_slice(&(phnum as u16).to_le_bytes());
            image.extend_from_slice(&0u16.to_le_bytes()); // shentsize
            image.extend_from_slice(&0u16.to_le_bytes()); // shnum
            image.extend_from_slice(&0u16.to_le_bytes()); // shstrndx
            assert_eq!(image.len(), EHDR_SIZE);

            for (vaddr, p_flags, bytes) in &self.segments {
                image.extend_from_slice(&PT_LOAD.to_le_bytes());
                image.extend_from_slice(&p_flags.to_le_bytes());
                image.extend_from_slice(&(data_off as u64).to_le_bytes());
                image.extend_from_slice(&vaddr.to_le_bytes());
                image.extend_from_slice(&vaddr.to_le_bytes()); // paddr
                image.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                image.extend_from_slice(&(bytes.len() as u64).to_le_bytes()); // memsz
                image.extend_from_slice(&0x1000u64.to_le_bytes()); // align
                data_off += bytes.len();
            }
            for (_, _, bytes) in &self.segments {
                image.extend_from_slice(bytes);
            }
            image
        }
    }
}
