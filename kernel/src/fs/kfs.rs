//! kfs: a single-directory, inode-indexed filesystem over a block stream.
//!
//! On-disk layout, little-endian, 4096-byte blocks:
//!
//! - block 0, the boot block: dentry/inode/data-block counts, 52 reserved
//!   bytes, then up to 63 directory entries of {32-byte zero-padded name,
//!   u32 inode index, 28 reserved}
//! - blocks 1..=N_i, one inode per block: {u32 byte length, 1023 u32
//!   data-block indices relative to the data region}
//! - data blocks from N_i+1 on
//!
//! The boot block is immutable after mount. Open files live in a fixed
//! 32-slot table; handles are `Arc<dyn Io>` and the slot is released when
//! the last clone drops.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::io::{read_fully, seek, Io, IoCtl};
use crate::sched::SleepLock;

/// Filesystem block size.
pub const FS_BLKSZ: usize = 4096;
/// Fixed width of a directory-entry name, zero-padded.
pub const FS_NAMELEN: usize = 32;
/// Directory entries in the boot block.
pub const DIR_ENTRY_CT: usize = 63;
/// Data-block index slots per inode.
pub const DATA_BLOCK_NUM: usize = 1023;
/// Capacity of the open-file table.
pub const MAX_OPEN_FILE_CT: usize = 32;

const DIR_ENTRY_SZ: usize = 64;
const BOOT_HEADER_SZ: usize = 64;

/// One directory entry.
#[derive(Debug, Clone, Copy)]
struct DirEntry {
    name: [u8; FS_NAMELEN],
    inode: u32,
}

impl DirEntry {
    fn matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        if bytes.len() > FS_NAMELEN {
            return false;
        }
        if &self.name[..bytes.len()] != bytes {
            return false;
        }
        bytes.len() == FS_NAMELEN || self.name[bytes.len()] == 0
    }
}

/// The parsed boot block.
struct BootBlock {
    num_dentry: u32,
    num_inodes: u32,
    #[allow(dead_code)]
    num_data: u32,
    entries: [DirEntry; DIR_ENTRY_CT],
}

impl BootBlock {
    fn parse(raw: &[u8]) -> Self {
        let word = |off: usize| u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
        let mut entries = [DirEntry {
            name: [0; FS_NAMELEN],
            inode: 0,
        }; DIR_ENTRY_CT];
        for (i, entry) in entries.iter_mut().enumerate() {
            let base = BOOT_HEADER_SZ + i * DIR_ENTRY_SZ;
            entry.name.copy_from_slice(&raw[base..base + FS_NAMELEN]);
            entry.inode = word(base + FS_NAMELEN);
        }
        Self {
            num_dentry: word(0),
            num_inodes: word(4),
            num_data: word(8),
            entries,
        }
    }

    /// Linear scan over the populated directory entries.
    fn lookup(&self, name: &str) -> Option<u32> {
        let populated = (self.num_dentry as usize).min(DIR_ENTRY_CT);
        self.entries[..populated]
            .iter()
            .find(|e| e.matches(name))
            .map(|e| e.inode)
    }
}

/// One raw inode block; fields are read in place.
struct InodeBlock(Box<[u8]>);

impl InodeBlock {
    fn byte_len(&self) -> u64 {
        u32::from_le_bytes(self.0[0..4].try_into().unwrap()) as u64
    }

    fn data_block(&self, idx: usize) -> u32 {
        debug_assert!(idx < DATA_BLOCK_NUM);
        let off = 4 + 4 * idx;
        u32::from_le_bytes(self.0[off..off + 4].try_into().unwrap())
    }
}

struct Mounted {
    io: Arc<dyn Io>,
    boot: BootBlock,
}

/// One open-file slot: position, cached length, inode, in-use flag.
#[derive(Debug, Clone, Copy, Default)]
struct OpenSlot {
    in_use: bool,
    inode: u32,
    pos: u64,
    size: u64,
}

static MOUNT: Mutex<Option<Mounted>> = Mutex::new(None);
static OPEN_FILES: Mutex<[OpenSlot; MAX_OPEN_FILE_CT]> =
    Mutex::new([OpenSlot {
        in_use: false,
        inode: 0,
        pos: 0,
        size: 0,
    }; MAX_OPEN_FILE_CT]);

/// The backing stream's position is shared by every operation, so the
/// seek-then-transfer sequences are serialized here.
static FS_LOCK: SleepLock = SleepLock::new("kfs");

/// Mount the filesystem found on `io`, caching its boot block. A second
/// mount replaces the first.
pub fn fs_mount(io: Arc<dyn Io>) -> KernelResult<()> {
    let mut raw = vec![0u8; FS_BLKSZ];
    FS_LOCK.with(|| -> KernelResult<()> {
        seek(io.as_ref(), 0)?;
        if read_fully(io.as_ref(), &mut raw)? != FS_BLKSZ {
            return Err(KernelError::Filesys);
        }
        Ok(())
    })?;
    let boot = BootBlock::parse(&raw);
    log::info!(
        "kfs mounted: {} files, {} inodes, {} data blocks",
        boot.num_dentry,
        boot.num_inodes,
        boot.num_data
    );
    *MOUNT.lock() = Some(Mounted { io, boot });
    Ok(())
}

fn backing() -> KernelResult<(Arc<dyn Io>, u32)> {
    let mount = MOUNT.lock();
    let mounted = mount.as_ref().ok_or(KernelError::Filesys)?;
    Ok((mounted.io.clone(), mounted.boot.num_inodes))
}

/// Fetch an inode block through the backing stream. Caller holds FS_LOCK.
fn read_inode(io: &dyn Io, inode: u32) -> KernelResult<InodeBlock> {
    let mut raw = vec![0u8; FS_BLKSZ];
    seek(io, (1 + inode as u64) * FS_BLKSZ as u64)?;
    if read_fully(io, &mut raw)? != FS_BLKSZ {
        return Err(KernelError::Filesys);
    }
    Ok(InodeBlock(raw.into_boxed_slice()))
}

/// Open a file by name. `NoEntry` when no directory entry matches,
/// `Filesys` when the open-file table is full.
pub fn fs_open(name: &str) -> KernelResult<Arc<dyn Io>> {
    let inode = {
        let mount = MOUNT.lock();
        let mounted = mount.as_ref().ok_or(KernelError::Filesys)?;
        mounted.boot.lookup(name).ok_or(KernelError::NoEntry)?
    };
    let (io, _) = backing()?;
    let size = FS_LOCK.with(|| read_inode(io.as_ref(), inode))?.byte_len();

    let _guard = arch::intr_disable();
    let mut slots = OPEN_FILES.lock();
    let idx = slots
        .iter()
        .position(|s| !s.in_use)
        .ok_or(KernelError::Filesys)?;
    slots[idx] = OpenSlot {
        in_use: true,
        inode,
        pos: 0,
        size,
    };
    Ok(Arc::new(FileIo { slot: idx }))
}

/// Stream handle for one open file.
struct FileIo {
    slot: usize,
}

impl FileIo {
    fn slot_snapshot(&self) -> KernelResult<OpenSlot> {
        let slots = OPEN_FILES.lock();
        let slot = slots[self.slot];
        if !slot.in_use {
            return Err(KernelError::Filesys);
        }
        Ok(slot)
    }

    fn set_pos(&self, pos: u64) {
        OPEN_FILES.lock()[self.slot].pos = pos;
    }
}

impl Io for FileIo {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let slot = self.slot_snapshot()?;
        let (io, num_inodes) = backing()?;

        let done = FS_LOCK.with(|| -> KernelResult<usize> {
            // Re-read the inode: the length is authoritative on disk.
            let inode = read_inode(io.as_ref(), slot.inode)?;
            let size = inode.byte_len();
            let mut pos = slot.pos.min(size);
            let todo = (buf.len() as u64).min(size - pos) as usize;
            let mut done = 0;

            // Leading partial block, whole blocks, then the remainder;
            // every block needs its own seek since data blocks are not
            // contiguous.
            while done < todo {
                let blk_idx = (pos / FS_BLKSZ as u64) as usize;
                let in_blk = (pos % FS_BLKSZ as u64) as usize;
                let abs_block = inode.data_block(blk_idx) as u64 + num_inodes as u64 + 1;
                let chunk = (todo - done).min(FS_BLKSZ - in_blk);

                seek(io.as_ref(), abs_block * FS_BLKSZ as u64 + in_blk as u64)?;
                if read_fully(io.as_ref(), &mut buf[done..done + chunk])? != chunk {
                    return Err(KernelError::Io);
                }
                pos += chunk as u64;
                done += chunk;
            }
            self.set_pos(pos);
            Ok(done)
        })?;
        Ok(done)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let slot = self.slot_snapshot()?;
        let (io, num_inodes) = backing()?;

        let done = FS_LOCK.with(|| -> KernelResult<usize> {
            let inode = read_inode(io.as_ref(), slot.inode)?;
            let size = inode.byte_len();
            let mut pos = slot.pos.min(size);
            // Overwrite only: the file never grows.
            let todo = (buf.len() as u64).min(size - pos) as usize;
            let mut done = 0;

            while done < todo {
                let blk_idx = (pos / FS_BLKSZ as u64) as usize;
                let in_blk = (pos % FS_BLKSZ as u64) as usize;
                let abs_block = inode.data_block(blk_idx) as u64 + num_inodes as u64 + 1;
                let chunk = (todo - done).min(FS_BLKSZ - in_blk);

                seek(io.as_ref(), abs_block * FS_BLKSZ as u64 + in_blk as u64)?;
                let mut written = 0;
                while written < chunk {
                    let n = io.write(&buf[done + written..done + chunk])?;
                    if n == 0 {
                        return Err(KernelError::Io);
                    }
                    written += n;
                }
                pos += chunk as u64;
                done += chunk;
            }
            self.set_pos(pos);
            Ok(done)
        })?;
        Ok(done)
    }

    fn ctl(&self, op: IoCtl) -> KernelResult<u64> {
        let slot = self.slot_snapshot()?;
        match op {
            IoCtl::GetLen => Ok(slot.size),
            IoCtl::GetPos => Ok(slot.pos),
            IoCtl::SetPos(pos) => {
                self.set_pos(pos);
                Ok(pos)
            }
            IoCtl::GetBlkSz => Ok(FS_BLKSZ as u64),
        }
    }
}

impl Drop for FileIo {
    fn drop(&mut self) {
        let _guard = arch::intr_disable();
        OPEN_FILES.lock()[self.slot] = OpenSlot::default();
    }
}

#[cfg(test)]
pub(crate) fn used_slots() -> usize {
    OPEN_FILES.lock().iter().filter(|s| s.in_use).count()
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Builds kfs images in memory, the same packing the mkfs host tool
    //! performs.

    use super::*;
    use alloc::vec::Vec;

    pub fn build_image(files: &[(&str, &[u8])]) -> Vec<u8> {
        assert!(files.len() <= DIR_ENTRY_CT);
        let num_inodes = files.len() as u32;
        let total_data: usize = files
            .iter()
            .map(|(_, data)| data.len().div_ceil(FS_BLKSZ))
            .sum();

        let blocks = 1 + num_inodes as usize + total_data;
        let mut image = vec![0u8; blocks * FS_BLKSZ];

        // Boot block.
        image[0..4].copy_from_slice(&(files.len() as u32).to_le_bytes());
        image[4..8].copy_from_slice(&num_inodes.to_le_bytes());
        image[8..12].copy_from_slice(&(total_data as u32).to_le_bytes());
        for (i, (name, _)) in files.iter().enumerate() {
            let base = BOOT_HEADER_SZ + i * DIR_ENTRY_SZ;
            let bytes = name.as_bytes();
            assert!(bytes.len() <= FS_NAMELEN);
            image[base..base + bytes.len()].copy_from_slice(bytes);
            image[base + FS_NAMELEN..base + FS_NAMELEN + 4]
                .copy_from_slice(&(i as u32).to_le_bytes());
        }

        // Inode blocks and data blocks.
        let mut next_data = 0u32;
        for (i, (_, data)) in files.iter().enumerate() {
            let inode_base = (1 + i) * FS_BLKSZ;
            image[inode_base..inode_base + 4].copy_from_slice(&(data.len() as u32).to_le_bytes());
            for (j, chunk) in data.chunks(FS_BLKSZ).enumerate() {
                let slot = inode_base + 4 + 4 * j;
                image[slot..slot + 4].copy_from_slice(&next_data.to_le_bytes());
                let abs = (1 + num_inodes + next_data) as usize * FS_BLKSZ;
                image[abs..abs + chunk.len()].copy_from_slice(chunk);
                next_data += 1;
            }
        }
        image
    }

    /// Deterministic file contents for equality checks.
    pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::io::MemIo;
    use crate::mm::testing;

    fn mount_files(files: &[(&str, &[u8])]) -> Arc<MemIo> {
        crate::sched::thread::init();
        let backing = MemIo::new(build_image(files));
        fs_mount(backing.clone()).expect("mount");
        backing
    }

    #[test]
    fn short_file_reads_back_exactly() {
        let _lock = testing::lock();
        let hello = pattern(351, 7);
        mount_files(&[("HelloWorld.txt", &hello)]);

        let io = fs_open("HelloWorld.txt").expect("open");
        let mut buf = vec![0u8; 351];
        assert_eq!(io.read(&mut buf).unwrap(), 351);
        assert_eq!(buf, hello);
        // Position is at EOF now; further reads return 0.
        assert_eq!(io.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn split_reads_match_a_single_cross_block_read() {
        let _lock = testing::lock();
        let horus = pattern(27414, 3);
        mount_files(&[("HorusHeresyChOne.txt", &horus)]);

        let a = fs_open("HorusHeresyChOne.txt").expect("open");
        let mut split = vec![0u8; 10000];
        assert_eq!(a.read(&mut split[..1500]).unwrap(), 1500);
        assert_eq!(a.read(&mut split[1500..]).unwrap(), 8500);

        let b = fs_open("HorusHeresyChOne.txt").expect("open fresh");
        let mut whole = vec![0u8; 10000];
        assert_eq!(b.read(&mut whole).unwrap(), 10000);
        assert_eq!(split, whole);
    }

    #[test]
    fn reads_are_reproducible_after_setpos() {
        let _lock = testing::lock();
        let data = pattern(9000, 11);
        mount_files(&[("trek", &data)]);

        let io = fs_open("trek").expect("open");
        let mut first = vec![0u8; 600];
        io.ctl(IoCtl::SetPos(4000)).unwrap();
        assert_eq!(io.read(&mut first).unwrap(), 600);
        io.ctl(IoCtl::SetPos(4000)).unwrap();
        let mut second = vec![0u8; 600];
        assert_eq!(io.read(&mut second).unwrap(), 600);
        assert_eq!(first, second);
    }

    #[test]
    fn writes_clamp_at_eof_and_touch_only_their_span() {
        let _lock = testing::lock();
        let len = 6000;
        let data = pattern(len, 5);
        mount_files(&[("HonorAndDeath.txt", &data)]);

        let io = fs_open("HonorAndDeath.txt").expect("open");
        io.ctl(IoCtl::SetPos(len as u64 - 5)).unwrap();
        let overlong = [0xEEu8; 100];
        // Only the last 5 bytes fit.
        assert_eq!(io.write(&overlong).unwrap(), 5);
        assert_eq!(io.ctl(IoCtl::GetLen).unwrap(), len as u64);

        io.ctl(IoCtl::SetPos(0)).unwrap();
        let mut out = vec![0u8; len];
        assert_eq!(io.read(&mut out).unwrap(), len);
        assert_eq!(&out[..len - 5], &data[..len - 5]);
        assert_eq!(&out[len - 5..], &[0xEE; 5]);
    }

    #[test]
    fn cross_block_write_round_trips() {
        let _lock = testing::lock();
        let data = pattern(3 * FS_BLKSZ, 1);
        mount_files(&[("HorusHeresyChTwo.txt", &data)]);

        let io = fs_open("HorusHeresyChTwo.txt").expect("open");
        let payload = pattern(5000, 99);
        io.ctl(IoCtl::SetPos(2000)).unwrap();
        assert_eq!(io.write(&payload).unwrap(), 5000);

        io.ctl(IoCtl::SetPos(2000)).unwrap();
        let mut out = vec![0u8; 5000];
        assert_eq!(io.read(&mut out).unwrap(), 5000);
        assert_eq!(out, payload);
        // Bytes before the span are untouched.
        io.ctl(IoCtl::SetPos(0)).unwrap();
        let mut head = vec![0u8; 2000];
        assert_eq!(io.read(&mut head).unwrap(), 2000);
        assert_eq!(&head[..], &data[..2000]);
    }

    #[test]
    fn missing_names_and_full_tables_error_distinctly() {
        let _lock = testing::lock();
        let data = pattern(100, 2);
        mount_files(&[("ls", &data)]);

        assert!(matches!(fs_open("nope"), Err(KernelError::NoEntry)));

        let baseline = used_slots();
        let mut handles = alloc::vec::Vec::new();
        for _ in baseline..MAX_OPEN_FILE_CT {
            handles.push(fs_open("ls").expect("open"));
        }
        assert!(matches!(fs_open("ls"), Err(KernelError::Filesys)));
        handles.clear();
        assert_eq!(used_slots(), baseline);
        assert!(fs_open("ls").is_ok());
    }

    #[test]
    fn ioctl_reports_length_position_and_block_size() {
        let _lock = testing::lock();
        let data = pattern(1234, 9);
        mount_files(&[("cat", &data)]);

        let io = fs_open("cat").expect("open");
        assert_eq!(io.ctl(IoCtl::GetLen).unwrap(), 1234);
        assert_eq!(io.ctl(IoCtl::GetPos).unwrap(), 0);
        assert_eq!(io.ctl(IoCtl::SetPos(50)).unwrap(), 50);
        assert_eq!(io.ctl(IoCtl::GetPos).unwrap(), 50);
        assert_eq!(io.ctl(IoCtl::GetBlkSz).unwrap(), FS_BLKSZ as u64);
    }

    #[test]
    fn data_block_translation_offsets_by_the_inode_region() {
        // Two files interleave their data blocks; reading the second must
        // apply the +num_inodes+1 translation to land on its own blocks.
        let _lock = testing::lock();
        let a = pattern(FS_BLKSZ + 10, 21);
        let b = pattern(2 * FS_BLKSZ, 22);
        mount_files(&[("a.txt", &a), ("b.txt", &b)]);

        let ioa = fs_open("a.txt").expect("a");
        let iob = fs_open("b.txt").expect("b");
        let mut out_a = vec![0u8; a.len()];
        let mut out_b = vec![0u8; b.len()];
        assert_eq!(ioa.read(&mut out_a).unwrap(), a.len());
        assert_eq!(iob.read(&mut out_b).unwrap(), b.len());
        assert_eq!(out_a, a);
        assert_eq!(out_b, b);
    }
}
