//! Device drivers and the name → driver registry behind DEVOPEN.

pub mod virtio;
pub mod virtio_blk;

use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::io::Io;

/// Implemented by drivers that can hand out stream handles by name.
pub trait DeviceOpener: Send + Sync {
    fn open(&self) -> KernelResult<Arc<dyn Io>>;
}

struct DeviceEntry {
    name: &'static str,
    instno: usize,
    opener: Arc<dyn DeviceOpener>,
}

lazy_static! {
    static ref DEVICES: Mutex<Vec<DeviceEntry>> = Mutex::new(Vec::new());
}

/// Register a device instance under `name`; returns the instance number
/// assigned within that name.
pub fn device_register(name: &'static str, opener: Arc<dyn DeviceOpener>) -> usize {
    let _guard = crate::arch::intr_disable();
    let mut devices = DEVICES.lock();
    let instno = devices.iter().filter(|d| d.name == name).count();
    devices.push(DeviceEntry {
        name,
        instno,
        opener,
    });
    log::info!("device {}{} registered", name, instno);
    instno
}

/// Open instance `instno` of the device registered under `name`.
pub fn device_open(name: &str, instno: usize) -> KernelResult<Arc<dyn Io>> {
    let opener = {
        let _guard = crate::arch::intr_disable();
        let devices = DEVICES.lock();
        devices
            .iter()
            .find(|d| d.name == name && d.instno == instno)
            .map(|d| d.opener.clone())
    };
    opener.ok_or(KernelError::NoDevice)?.open()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDevice;

    impl DeviceOpener for NullDevice {
        fn open(&self) -> KernelResult<Arc<dyn Io>> {
            Err(KernelError::Busy)
        }
    }

    #[test]
    fn unknown_devices_report_nodev() {
        assert!(matches!(
            device_open("does-not-exist", 0),
            Err(KernelError::NoDevice)
        ));
    }

    #[test]
    fn instances_are_numbered_per_name() {
        let a = device_register("nulltest", Arc::new(NullDevice));
        let b = device_register("nulltest", Arc::new(NullDevice));
        assert_eq!(b, a + 1);
        // The opener itself is consulted once the entry resolves.
        assert!(matches!(
            device_open("nulltest", a),
            Err(KernelError::Busy)
        ));
    }
}
