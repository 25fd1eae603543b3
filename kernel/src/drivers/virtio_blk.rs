//! virtio block device driver.
//!
//! One queue of length 1, one transaction at a time: descriptor 0 is an
//! indirect pointer to {header, bounce buffer, status}; the issuing thread
//! bumps the avail ring, notifies, and sleeps on `used_updated` until the
//! ISR observes the used-buffer interrupt. All disk data flows through the
//! block-sized bounce buffer, and sub-block writes read-modify-write.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{fence, Ordering};

use super::virtio::{
    FeatureSet, VirtioMmio, VirtqAvail, VirtqDesc, VirtqUsed, VIRTIO_F_INDIRECT_DESC,
    VIRTIO_F_RING_RESET, VIRTQ_DESC_F_INDIRECT, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE,
};
use super::{device_register, DeviceOpener};
use crate::arch;
use crate::error::{KernelError, KernelResult};
use crate::io::{Io, IoCtl};
use crate::irq::{self, IrqHandler};
use crate::sched::{Condition, SleepLock};

const VIOBLK_IRQ_PRIO: u32 = 1;
/// The virtio request sector unit; capacity is reported in these.
const SECTOR_SIZE: u64 = 512;
/// Used-buffer notification bit in interrupt_status.
const USED_NOTF: u32 = 1 << 0;

// Block-device feature bit numbers.
const VIRTIO_BLK_F_BLK_SIZE: u32 = 6;
const VIRTIO_BLK_F_TOPOLOGY: u32 = 10;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;

const VIRTIO_BLK_S_OK: u8 = 0;

/// Request header, device-read-only.
#[repr(C)]
#[derive(Debug, Default)]
struct RequestHeader {
    req_type: u32,
    reserved: u32,
    sector: u64,
}

/// DMA-visible queue state; boxed so every address is stable.
#[repr(C)]
struct VioBlkQueue {
    /// desc[0] is the indirect descriptor published in the avail ring; it
    /// points at desc[1..=3] = header, data, status.
    desc: [VirtqDesc; 4],
    avail: VirtqAvail,
    used: VirtqUsed,
    req_header: RequestHeader,
    req_status: u8,
}

struct VioBlkState {
    vq: Box<VioBlkQueue>,
    /// Block-sized bounce buffer all disk data flows through.
    bounce: Box<[u8]>,
    pos: u64,
    opened: bool,
}

pub struct VioBlkDevice {
    regs: VirtioMmio,
    irqno: u32,
    blksz: u64,
    size: u64,
    used_updated: Condition,
    /// One outstanding transaction at a time; also guards `state`.
    cmd_lock: SleepLock,
    state: UnsafeCell<VioBlkState>,
}

// SAFETY: `state` is only touched while `cmd_lock` is held (a single-owner
// sleep lock); the ISR reads device registers and broadcasts the condition
// but never enters `state`.
unsafe impl Send for VioBlkDevice {}
// SAFETY: as above.
unsafe impl Sync for VioBlkDevice {}

impl VioBlkDevice {
    /// State accessor; callers hold `cmd_lock`.
    #[allow(clippy::mut_from_ref)]
    fn state_mut(&self) -> &mut VioBlkState {
        debug_assert!(self.cmd_lock.holder().is_some());
        // SAFETY: cmd_lock serializes every entry to this function.
        unsafe { &mut *self.state.get() }
    }

    /// Issue one transaction for `sector` and sleep until the device has
    /// serviced it. The caller has filled (OUT) or will consume (IN) the
    /// bounce buffer.
    fn transact(&self, req_type: u32, sector: u64) -> KernelResult<()> {
        {
            let state = self.state_mut();
            state.vq.req_header.req_type = req_type;
            state.vq.req_header.sector = sector;
            // The data descriptor is device-written for reads.
            if req_type == VIRTIO_BLK_T_IN {
                state.vq.desc[2].flags |= VIRTQ_DESC_F_WRITE;
            } else {
                state.vq.desc[2].flags &= !VIRTQ_DESC_F_WRITE;
            }
            state.vq.req_status = 0xFF;
            state.vq.avail.idx = state.vq.avail.idx.wrapping_add(1);
        }
        fence(Ordering::SeqCst);

        let guard = arch::intr_disable();
        self.regs.notify_avail(0);
        self.used_updated.wait();
        drop(guard);

        fence(Ordering::SeqCst);
        if self.state_mut().vq.req_status != VIRTIO_BLK_S_OK {
            return Err(KernelError::Io);
        }
        Ok(())
    }

    fn do_open(self: &Arc<Self>) -> KernelResult<Arc<dyn Io>> {
        self.cmd_lock.acquire();
        let state = self.state_mut();
        if state.opened {
            self.cmd_lock.release();
            return Err(KernelError::Busy);
        }
        state.vq.avail.flags = 0;
        state.vq.avail.idx = 0;
        state.vq.avail.ring[0] = 0;
        irq::enable_irq(self.irqno);
        fence(Ordering::SeqCst);
        state.opened = true;
        self.cmd_lock.release();
        Ok(Arc::new(VioBlkHandle {
            dev: self.clone(),
        }))
    }

    /// Called when the last handle drops. Must run with interrupts enabled
    /// so an in-flight IRQ has drained.
    fn do_close(&self) {
        debug_assert!(arch::intr_enabled(), "vioblk close with interrupts disabled");
        self.cmd_lock.acquire();
        irq::disable_irq(self.irqno);
        self.regs.reset_virtq(0);
        self.state_mut().opened = false;
        self.cmd_lock.release();
    }

    fn do_read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        self.cmd_lock.acquire();
        let result = self.read_locked(buf);
        self.cmd_lock.release();
        result
    }

    fn read_locked(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let (opened, pos0) = {
            let state = self.state_mut();
            (state.opened, state.pos)
        };
        if !opened {
            return Err(KernelError::BadFormat);
        }
        let remaining = self.size.saturating_sub(pos0);
        let mut todo = (buf.len() as u64).min(remaining) as usize;
        let mut done = 0;

        while todo > 0 {
            let pos = self.state_mut().pos;
            let sector = pos / self.blksz;
            self.transact(VIRTIO_BLK_T_IN, sector * self.blksz / SECTOR_SIZE)?;

            let state = self.state_mut();
            let offset = (pos % self.blksz) as usize;
            let count = todo.min(self.blksz as usize - offset);
            buf[done..done + count].copy_from_slice(&state.bounce[offset..offset + count]);
            state.pos += count as u64;
            done += count;
            todo -= count;
        }
        Ok(done)
    }

    fn do_write(&self, buf: &[u8]) -> KernelResult<usize> {
        self.cmd_lock.acquire();
        let result = self.write_locked(buf);
        self.cmd_lock.release();
        result
    }

    fn write_locked(&self, buf: &[u8]) -> KernelResult<usize> {
        let (opened, pos0) = {
            let state = self.state_mut();
            (state.opened, state.pos)
        };
        if !opened {
            return Err(KernelError::BadFormat);
        }
        // Writes overwrite in place; the device never grows.
        let remaining = self.size.saturating_sub(pos0);
        let mut todo = (buf.len() as u64).min(remaining) as usize;
        let mut done = 0;

        while todo > 0 {
            let pos = self.state_mut().pos;
            let sector = pos / self.blksz;
            let offset = (pos % self.blksz) as usize;
            let count = todo.min(self.blksz as usize - offset);

            if count < self.blksz as usize {
                // Sub-block write: fetch the block, overlay, write back.
                self.transact(VIRTIO_BLK_T_IN, sector * self.blksz / SECTOR_SIZE)?;
            }
            let state = self.state_mut();
            state.bounce[offset..offset + count].copy_from_slice(&buf[done..done + count]);
            self.transact(VIRTIO_BLK_T_OUT, sector * self.blksz / SECTOR_SIZE)?;

            self.state_mut().pos += count as u64;
            done += count;
            todo -= count;
        }
        Ok(done)
    }

    fn do_ctl(&self, op: IoCtl) -> KernelResult<u64> {
        self.cmd_lock.acquire();
        let state = self.state_mut();
        let result = match op {
            IoCtl::GetLen => Ok(self.size),
            IoCtl::GetPos => Ok(state.pos),
            IoCtl::SetPos(pos) => {
                state.pos = pos;
                Ok(pos)
            }
            IoCtl::GetBlkSz => Ok(self.blksz),
        };
        self.cmd_lock.release();
        result
    }
}

impl IrqHandler for VioBlkDevice {
    fn handle_irq(&self, _irq: u32) {
        fence(Ordering::SeqCst);
        let status = self.regs.interrupt_status();
        if status & USED_NOTF != 0 {
            self.used_updated.broadcast();
            self.regs.interrupt_ack(status);
            fence(Ordering::SeqCst);
        }
    }
}

/// Registry adapter holding the device Arc.
struct VioBlkOpener {
    dev: Arc<VioBlkDevice>,
}

impl DeviceOpener for VioBlkOpener {
    fn open(&self) -> KernelResult<Arc<dyn Io>> {
        self.dev.do_open()
    }
}

/// A stream handle; the last drop closes the device.
struct VioBlkHandle {
    dev: Arc<VioBlkDevice>,
}

impl Io for VioBlkHandle {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        self.dev.do_read(buf)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        self.dev.do_write(buf)
    }

    fn ctl(&self, op: IoCtl) -> KernelResult<u64> {
        self.dev.do_ctl(op)
    }
}

impl Drop for VioBlkHandle {
    fn drop(&mut self) {
        self.dev.do_close();
    }
}

/// Attach a block device behind an acknowledged virtio-mmio window.
/// Negotiates features, builds the descriptor chain, installs the rings,
/// and registers the ISR and the "blk" device entry.
pub fn attach(regs: VirtioMmio, irqno: u32) -> Option<Arc<VioBlkDevice>> {
    regs.set_status(super::virtio::STAT_DRIVER);
    fence(Ordering::SeqCst);

    let needed = FeatureSet::empty()
        .with(VIRTIO_F_RING_RESET)
        .with(VIRTIO_F_INDIRECT_DESC);
    let wanted = FeatureSet::empty()
        .with(VIRTIO_BLK_F_BLK_SIZE)
        .with(VIRTIO_BLK_F_TOPOLOGY);
    let enabled = match regs.negotiate_features(wanted, needed) {
        Ok(enabled) => enabled,
        Err(_) => {
            log::warn!("vioblk: feature negotiation failed (irq {})", irqno);
            return None;
        }
    };

    let blksz = if enabled.test(VIRTIO_BLK_F_BLK_SIZE) {
        regs.config_u32(20) as u64
    } else {
        SECTOR_SIZE
    };
    let size = regs.config_u64(0) * SECTOR_SIZE;
    log::debug!("vioblk: block size {} capacity {} bytes", blksz, size);

    let mut vq = Box::new(VioBlkQueue {
        desc: [VirtqDesc::default(); 4],
        avail: VirtqAvail::default(),
        used: VirtqUsed::default(),
        req_header: RequestHeader::default(),
        req_status: 0,
    });
    let bounce = vec![0u8; blksz as usize].into_boxed_slice();

    // Indirect chain: d0 → {d1 header, d2 data, d3 status}; next indices
    // are relative to the indirect table starting at d1.
    vq.desc[0] = VirtqDesc {
        addr: core::ptr::addr_of!(vq.desc[1]) as u64,
        len: (3 * core::mem::size_of::<VirtqDesc>()) as u32,
        flags: VIRTQ_DESC_F_INDIRECT,
        next: 0,
    };
    vq.desc[1] = VirtqDesc {
        addr: core::ptr::addr_of!(vq.req_header) as u64,
        len: core::mem::size_of::<RequestHeader>() as u32,
        flags: VIRTQ_DESC_F_NEXT,
        next: 1,
    };
    vq.desc[2] = VirtqDesc {
        addr: bounce.as_ptr() as u64,
        len: blksz as u32,
        flags: VIRTQ_DESC_F_NEXT,
        next: 2,
    };
    vq.desc[3] = VirtqDesc {
        addr: core::ptr::addr_of!(vq.req_status) as u64,
        len: 1,
        flags: VIRTQ_DESC_F_WRITE,
        next: 0,
    };

    let desc = core::ptr::addr_of!(vq.desc[0]) as u64;
    let avail = core::ptr::addr_of!(vq.avail) as u64;
    let used = core::ptr::addr_of!(vq.used) as u64;
    if regs.attach_virtq(0, 1, desc, used, avail).is_err() {
        log::warn!("vioblk: queue setup failed (irq {})", irqno);
        return None;
    }

    let dev = Arc::new(VioBlkDevice {
        regs,
        irqno,
        blksz,
        size,
        used_updated: Condition::new("vioblk_used_updated"),
        cmd_lock: SleepLock::new("vioblk_cmd"),
        state: UnsafeCell::new(VioBlkState {
            vq,
            bounce,
            pos: 0,
            opened: false,
        }),
    });

    irq::register_isr(irqno, VIOBLK_IRQ_PRIO, dev.clone());
    device_register("blk", Arc::new(VioBlkOpener { dev: dev.clone() }));

    regs.set_status(super::virtio::STAT_DRIVER_OK);
    fence(Ordering::SeqCst);
    Some(dev)
}

#[cfg(test)]
mod tests {
    use super::super::virtio::test_support::{foldable_needed_features, FakeRegs};
    use super::*;
    use crate::io::{IOCTL_GETLEN, IOCTL_SETPOS};

    fn attach_fake(irq: u32) -> (FakeRegs, Arc<VioBlkDevice>) {
        crate::sched::thread::init();
        let fake = FakeRegs::new_block_device(foldable_needed_features(), 2048);
        let dev = attach(fake.regs(), irq).expect("attach");
        (fake, dev)
    }

    #[test]
    fn attach_reports_capacity_and_default_block_size() {
        let (_fake, dev) = attach_fake(33);
        assert_eq!(dev.size, 2048 * SECTOR_SIZE);
        assert_eq!(dev.blksz, SECTOR_SIZE);
    }

    #[test]
    fn descriptor_chain_is_indirect_header_data_status() {
        let (_fake, dev) = attach_fake(34);
        dev.cmd_lock.acquire();
        let state = dev.state_mut();
        assert_eq!(state.vq.desc[0].flags, VIRTQ_DESC_F_INDIRECT);
        assert_eq!(
            state.vq.desc[0].len as usize,
            3 * core::mem::size_of::<VirtqDesc>()
        );
        assert_eq!(state.vq.desc[1].next, 1);
        assert_eq!(state.vq.desc[2].next, 2);
        assert_eq!(state.vq.desc[3].flags, VIRTQ_DESC_F_WRITE);
        assert_eq!(state.vq.desc[2].len as u64, dev.blksz);
        dev.cmd_lock.release();
    }

    #[test]
    fn open_is_exclusive_until_closed() {
        let (_fake, dev) = attach_fake(35);
        let handle = dev.do_open().expect("first open");
        assert!(matches!(dev.do_open(), Err(KernelError::Busy)));
        drop(handle);
        let again = dev.do_open().expect("reopen after close");
        drop(again);
    }

    #[test]
    fn ioctl_tracks_position_and_reports_geometry() {
        let (_fake, dev) = attach_fake(36);
        let handle = dev.do_open().expect("open");
        assert_eq!(handle.ctl(IoCtl::GetLen).unwrap(), 2048 * SECTOR_SIZE);
        assert_eq!(handle.ctl(IoCtl::GetPos).unwrap(), 0);
        assert_eq!(handle.ctl(IoCtl::SetPos(100)).unwrap(), 100);
        assert_eq!(handle.ctl(IoCtl::GetPos).unwrap(), 100);
        assert_eq!(handle.ctl(IoCtl::GetBlkSz).unwrap(), SECTOR_SIZE);
        // Raw command decoding used by the syscall layer.
        assert_eq!(IoCtl::from_raw(IOCTL_GETLEN, 0), Ok(IoCtl::GetLen));
        assert_eq!(IoCtl::from_raw(IOCTL_SETPOS, 7), Ok(IoCtl::SetPos(7)));
    }

    #[test]
    fn reads_on_a_closed_device_are_rejected() {
        let (_fake, dev) = attach_fake(37);
        let mut buf = [0u8; 16];
        assert!(matches!(dev.do_read(&mut buf), Err(KernelError::BadFormat)));
    }
}
