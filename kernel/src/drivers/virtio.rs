//! virtio-mmio transport: register access, feature negotiation, virtqueue
//! plumbing shared by virtio device drivers.

use core::sync::atomic::{fence, Ordering};

use crate::error::{KernelError, KernelResult};

pub const VIRTIO_MAGIC: u32 = 0x7472_6976; // "virt"
pub const VIRTIO_VERSION: u32 = 2;

/// Device ids we know about.
pub const VIRTIO_ID_BLOCK: u32 = 2;

// Register offsets (virtio-mmio v2).
const MAGIC_VALUE: usize = 0x000;
const VERSION: usize = 0x004;
const DEVICE_ID: usize = 0x008;
const DEVICE_FEATURES: usize = 0x010;
const DEVICE_FEATURES_SEL: usize = 0x014;
const DRIVER_FEATURES: usize = 0x020;
const DRIVER_FEATURES_SEL: usize = 0x024;
const QUEUE_SEL: usize = 0x030;
const QUEUE_NUM_MAX: usize = 0x034;
const QUEUE_NUM: usize = 0x038;
const QUEUE_READY: usize = 0x044;
const QUEUE_NOTIFY: usize = 0x050;
const INTERRUPT_STATUS: usize = 0x060;
const INTERRUPT_ACK: usize = 0x064;
const STATUS: usize = 0x070;
const QUEUE_DESC_LOW: usize = 0x080;
const QUEUE_DESC_HIGH: usize = 0x084;
const QUEUE_AVAIL_LOW: usize = 0x090;
const QUEUE_AVAIL_HIGH: usize = 0x094;
const QUEUE_USED_LOW: usize = 0x0a0;
const QUEUE_USED_HIGH: usize = 0x0a4;
pub const CONFIG_OFFSET: usize = 0x100;

// Device status bits.
pub const STAT_ACKNOWLEDGE: u32 = 1;
pub const STAT_DRIVER: u32 = 2;
pub const STAT_DRIVER_OK: u32 = 4;
pub const STAT_FEATURES_OK: u32 = 8;
pub const STAT_FAILED: u32 = 128;

// Feature bit numbers (bit positions in the 64-bit feature space).
pub const VIRTIO_F_INDIRECT_DESC: u32 = 28;
pub const VIRTIO_F_VERSION_1: u32 = 32;
pub const VIRTIO_F_RING_RESET: u32 = 40;

/// A set of feature bit numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureSet(pub u64);

impl FeatureSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn with(self, bit: u32) -> Self {
        Self(self.0 | (1 << bit))
    }

    pub const fn test(&self, bit: u32) -> bool {
        self.0 & (1 << bit) != 0
    }

    pub const fn contains(&self, other: FeatureSet) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Handle to one virtio-mmio register window.
#[derive(Debug, Clone, Copy)]
pub struct VirtioMmio {
    base: usize,
}

impl VirtioMmio {
    /// # Safety
    /// `base` must be the base of a virtio-mmio register window mapped for
    /// the lifetime of the handle (the platform windows are identity-mapped
    /// at boot; tests point handles at fake register blocks in memory).
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // SAFETY: offset is one of the register constants above, inside
        // the window promised at construction.
        unsafe { ((self.base + offset) as *const u32).read_volatile() }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        // SAFETY: as read_reg.
        unsafe { ((self.base + offset) as *mut u32).write_volatile(value) };
    }

    pub fn magic(&self) -> u32 {
        self.read_reg(MAGIC_VALUE)
    }

    pub fn version(&self) -> u32 {
        self.read_reg(VERSION)
    }

    pub fn device_id(&self) -> u32 {
        self.read_reg(DEVICE_ID)
    }

    pub fn status(&self) -> u32 {
        self.read_reg(STATUS)
    }

    pub fn set_status(&self, bits: u32) {
        self.write_reg(STATUS, self.status() | bits);
    }

    pub fn reset(&self) {
        self.write_reg(STATUS, 0);
    }

    pub fn interrupt_status(&self) -> u32 {
        self.read_reg(INTERRUPT_STATUS)
    }

    pub fn interrupt_ack(&self, bits: u32) {
        self.write_reg(INTERRUPT_ACK, bits);
    }

    /// Read a u32 out of the device-specific config space.
    pub fn config_u32(&self, offset: usize) -> u32 {
        self.read_reg(CONFIG_OFFSET + offset)
    }

    /// Read a u64 out of the config space as two 32-bit halves.
    pub fn config_u64(&self, offset: usize) -> u64 {
        let lo = self.config_u32(offset) as u64;
        let hi = self.config_u32(offset + 4) as u64;
        (hi << 32) | lo
    }

    fn device_features(&self) -> FeatureSet {
        self.write_reg(DEVICE_FEATURES_SEL, 0);
        let lo = self.read_reg(DEVICE_FEATURES) as u64;
        self.write_reg(DEVICE_FEATURES_SEL, 1);
        let hi = self.read_reg(DEVICE_FEATURES) as u64;
        FeatureSet((hi << 32) | lo)
    }

    fn write_driver_features(&self, features: FeatureSet) {
        self.write_reg(DRIVER_FEATURES_SEL, 0);
        self.write_reg(DRIVER_FEATURES, features.0 as u32);
        self.write_reg(DRIVER_FEATURES_SEL, 1);
        self.write_reg(DRIVER_FEATURES, (features.0 >> 32) as u32);
    }

    /// Negotiate features: every `needed` bit must be offered; `wanted`
    /// bits are taken when offered. VERSION_1 is acknowledged whenever the
    /// device offers it. Returns the enabled set.
    pub fn negotiate_features(
        &self,
        wanted: FeatureSet,
        needed: FeatureSet,
    ) -> KernelResult<FeatureSet> {
        let offered = self.device_features();
        if !offered.contains(needed) {
            self.set_status(STAT_FAILED);
            return Err(KernelError::NoDevice);
        }
        let enabled = FeatureSet(offered.0 & (needed.0 | wanted.0 | (1 << VIRTIO_F_VERSION_1)));
        self.write_driver_features(enabled);
        self.set_status(STAT_FEATURES_OK);
        if self.status() & STAT_FEATURES_OK == 0 {
            self.set_status(STAT_FAILED);
            return Err(KernelError::NoDevice);
        }
        Ok(enabled)
    }

    /// Install a virtqueue's rings and mark it ready.
    pub fn attach_virtq(
        &self,
        qid: u32,
        len: u32,
        desc: u64,
        used: u64,
        avail: u64,
    ) -> KernelResult<()> {
        self.write_reg(QUEUE_SEL, qid);
        if self.read_reg(QUEUE_NUM_MAX) < len {
            return Err(KernelError::NoDevice);
        }
        self.write_reg(QUEUE_NUM, len);
        self.write_reg(QUEUE_DESC_LOW, desc as u32);
        self.write_reg(QUEUE_DESC_HIGH, (desc >> 32) as u32);
        self.write_reg(QUEUE_AVAIL_LOW, avail as u32);
        self.write_reg(QUEUE_AVAIL_HIGH, (avail >> 32) as u32);
        self.write_reg(QUEUE_USED_LOW, used as u32);
        self.write_reg(QUEUE_USED_HIGH, (used >> 32) as u32);
        fence(Ordering::SeqCst);
        self.write_reg(QUEUE_READY, 1);
        Ok(())
    }

    /// Take a virtqueue out of service.
    pub fn reset_virtq(&self, qid: u32) {
        self.write_reg(QUEUE_SEL, qid);
        self.write_reg(QUEUE_READY, 0);
        while self.read_reg(QUEUE_READY) != 0 {
            core::hint::spin_loop();
        }
    }

    /// Tell the device the avail ring for `qid` has new buffers.
    pub fn notify_avail(&self, qid: u32) {
        self.write_reg(QUEUE_NOTIFY, qid);
    }
}

// Descriptor flag bits.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// One descriptor.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

/// Single-entry available ring.
#[repr(C, align(2))]
#[derive(Debug, Default)]
pub struct VirtqAvail {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; 1],
    pub used_event: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

/// Single-entry used ring.
#[repr(C, align(4))]
#[derive(Debug, Default)]
pub struct VirtqUsed {
    pub flags: u16,
    pub idx: u16,
    pub ring: [VirtqUsedElem; 1],
    pub avail_event: u16,
}

/// Probe one mmio slot and attach the matching driver.
pub fn attach(mmio_base: usize, irqno: u32) {
    // SAFETY: mmio_base comes from the platform config (or a test fake)
    // and stays mapped.
    let regs = unsafe { VirtioMmio::new(mmio_base) };
    if regs.magic() != VIRTIO_MAGIC || regs.version() != VIRTIO_VERSION {
        return;
    }
    match regs.device_id() {
        0 => {} // empty slot
        VIRTIO_ID_BLOCK => {
            regs.reset();
            regs.set_status(STAT_ACKNOWLEDGE);
            fence(Ordering::SeqCst);
            super::virtio_blk::attach(regs, irqno);
        }
        other => {
            log::warn!("virtio device id {} at {:#x} not supported", other, mmio_base);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A fake register window: plain memory standing in for the device.

    use super::*;
    use alloc::boxed::Box;

    pub struct FakeRegs {
        mem: Box<[u32; 0x140 / 4]>,
    }

    impl FakeRegs {
        pub fn new_block_device(features: FeatureSet, capacity_sectors: u64) -> Self {
            let mut mem = Box::new([0u32; 0x140 / 4]);
            mem[MAGIC_VALUE / 4] = VIRTIO_MAGIC;
            mem[VERSION / 4] = VIRTIO_VERSION;
            mem[DEVICE_ID / 4] = VIRTIO_ID_BLOCK;
            // The fake cannot bank-switch: both selector reads return this
            // word, so tests fold the two banks into one value.
            mem[DEVICE_FEATURES / 4] = features.0 as u32;
            mem[QUEUE_NUM_MAX / 4] = 8;
            mem[CONFIG_OFFSET / 4] = capacity_sectors as u32;
            mem[CONFIG_OFFSET / 4 + 1] = (capacity_sectors >> 32) as u32;
            Self { mem }
        }

        pub fn set_blk_size(&mut self, blk_size: u32) {
            self.mem[(CONFIG_OFFSET + 20) / 4] = blk_size;
        }

        pub fn regs(&self) -> VirtioMmio {
            // SAFETY: the backing memory outlives the handle within each
            // test.
            unsafe { VirtioMmio::new(self.mem.as_ptr() as usize) }
        }

        pub fn word(&self, offset: usize) -> u32 {
            self.mem[offset / 4]
        }
    }

    /// The features a fake must offer so block negotiation succeeds: the
    /// low word doubles as both banks, so fold RING_RESET (bit 40 → bank-1
    /// bit 8) and INDIRECT_DESC (bank-0 bit 28) together.
    pub fn foldable_needed_features() -> FeatureSet {
        FeatureSet((1 << VIRTIO_F_INDIRECT_DESC) | (1 << (VIRTIO_F_RING_RESET - 32)))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn negotiation_requires_the_needed_features() {
        let fake = FakeRegs::new_block_device(FeatureSet::empty(), 64);
        let needed = FeatureSet::empty()
            .with(VIRTIO_F_RING_RESET)
            .with(VIRTIO_F_INDIRECT_DESC);
        let result = fake.regs().negotiate_features(FeatureSet::empty(), needed);
        assert!(result.is_err());
        assert_ne!(fake.regs().status() & STAT_FAILED, 0);
    }

    #[test]
    fn negotiation_accepts_offered_features() {
        let fake = FakeRegs::new_block_device(foldable_needed_features(), 64);
        let needed = FeatureSet::empty().with(VIRTIO_F_INDIRECT_DESC);
        let enabled = fake
            .regs()
            .negotiate_features(FeatureSet::empty(), needed)
            .expect("negotiation");
        assert!(enabled.test(VIRTIO_F_INDIRECT_DESC));
        assert_ne!(fake.regs().status() & STAT_FEATURES_OK, 0);
    }

    #[test]
    fn attach_virtq_programs_the_ring_addresses() {
        let fake = FakeRegs::new_block_device(foldable_needed_features(), 64);
        fake.regs()
            .attach_virtq(0, 1, 0x1111_2222_3333_4000, 0x5000, 0x6000)
            .expect("attach");
        assert_eq!(fake.word(0x080), 0x3333_4000);
        assert_eq!(fake.word(0x084), 0x1111_2222);
        assert_eq!(fake.word(0x0a0), 0x5000);
        assert_eq!(fake.word(0x090), 0x6000);
        assert_eq!(fake.word(0x044), 1);
    }

    #[test]
    fn feature_set_algebra() {
        let set = FeatureSet::empty().with(VIRTIO_F_RING_RESET).with(3);
        assert!(set.test(VIRTIO_F_RING_RESET));
        assert!(!set.test(4));
        assert!(set.contains(FeatureSet::empty().with(3)));
        assert!(!set.contains(FeatureSet::empty().with(4)));
    }
}
