//! The byte-stream interface.
//!
//! Devices and files are driven through one polymorphic handle exposing
//! read/write/ctl with an implicit position. Handles are `Arc<dyn Io>`;
//! the Arc strong count is the stream's reference count and the last drop
//! performs the close.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// ioctl command numbers shared with user space.
pub const IOCTL_GETLEN: usize = 1;
pub const IOCTL_SETLEN: usize = 2;
pub const IOCTL_GETPOS: usize = 3;
pub const IOCTL_SETPOS: usize = 4;
pub const IOCTL_FLUSH: usize = 5;
pub const IOCTL_GETBLKSZ: usize = 6;

/// Decoded ioctl request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCtl {
    GetLen,
    GetPos,
    SetPos(u64),
    GetBlkSz,
}

impl IoCtl {
    /// Decode the raw syscall (cmd, arg) pair; `arg` is the value read
    /// from the user's argument pointer.
    pub fn from_raw(cmd: usize, arg: u64) -> KernelResult<Self> {
        match cmd {
            IOCTL_GETLEN => Ok(Self::GetLen),
            IOCTL_GETPOS => Ok(Self::GetPos),
            IOCTL_SETPOS => Ok(Self::SetPos(arg)),
            IOCTL_GETBLKSZ => Ok(Self::GetBlkSz),
            _ => Err(KernelError::NotSupported),
        }
    }
}

/// A seekable byte stream. Reads and writes advance the implicit position;
/// short transfers are not errors (the return is the byte count, zero only
/// at EOF).
pub trait Io: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn write(&self, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn ctl(&self, _op: IoCtl) -> KernelResult<u64> {
        Err(KernelError::NotSupported)
    }
}

/// Read until `buf` is full or the stream hits EOF; returns the number of
/// bytes actually placed in `buf`.
pub fn read_fully(io: &dyn Io, buf: &mut [u8]) -> KernelResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Position the stream at an absolute byte offset.
pub fn seek(io: &dyn Io, pos: u64) -> KernelResult<()> {
    io.ctl(IoCtl::SetPos(pos))?;
    Ok(())
}

/// An in-memory stream over an owned buffer; the literal-backed cousin of
/// the device streams, used to mount linked-in filesystem images and by
/// the unit tests.
pub struct MemIo {
    inner: Mutex<MemIoInner>,
}

struct MemIoInner {
    data: Vec<u8>,
    pos: u64,
}

impl MemIo {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MemIoInner { data, pos: 0 }),
        })
    }

    /// Snapshot of the backing buffer (test support).
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }
}

impl Io for MemIo {
    fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        let pos = inner.pos.min(inner.data.len() as u64) as usize;
        let n = buf.len().min(inner.data.len() - pos);
        buf[..n].copy_from_slice(&inner.data[pos..pos + n]);
        inner.pos = (pos + n) as u64;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        let pos = inner.pos.min(inner.data.len() as u64) as usize;
        // Like the block device: writes overwrite, never extend.
        let n = buf.len().min(inner.data.len() - pos);
        inner.data[pos..pos + n].copy_from_slice(&buf[..n]);
        inner.pos = (pos + n) as u64;
        Ok(n)
    }

    fn ctl(&self, op: IoCtl) -> KernelResult<u64> {
        let mut inner = self.inner.lock();
        match op {
            IoCtl::GetLen => Ok(inner.data.len() as u64),
            IoCtl::GetPos => Ok(inner.pos),
            IoCtl::SetPos(pos) => {
                inner.pos = pos;
                Ok(pos)
            }
            IoCtl::GetBlkSz => Ok(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn read_advances_position_and_stops_at_eof() {
        let io = MemIo::new(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        assert_eq!(io.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(io.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(io.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn writes_overwrite_but_never_extend() {
        let io = MemIo::new(vec![0u8; 4]);
        seek(io.as_ref(), 2).unwrap();
        assert_eq!(io.write(&[9, 9, 9, 9]).unwrap(), 2);
        assert_eq!(io.contents(), vec![0, 0, 9, 9]);
        assert_eq!(io.ctl(IoCtl::GetLen).unwrap(), 4);
    }

    #[test]
    fn read_fully_loops_until_satisfied() {
        struct OneByte {
            inner: MemIo,
        }
        impl Io for OneByte {
            fn read(&self, buf: &mut [u8]) -> KernelResult<usize> {
                let n = 1.min(buf.len());
                self.inner.read(&mut buf[..n])
            }
        }
        let io = OneByte {
            inner: MemIo {
                inner: Mutex::new(MemIoInner {
                    data: vec![7u8; 10],
                    pos: 0,
                }),
            },
        };
        let mut buf = [0u8; 6];
        assert_eq!(read_fully(&io, &mut buf).unwrap(), 6);
        assert_eq!(buf, [7u8; 6]);
    }

    #[test]
    fn ioctl_decode_rejects_unknown_commands() {
        assert_eq!(IoCtl::from_raw(IOCTL_SETPOS, 42), Ok(IoCtl::SetPos(42)));
        assert_eq!(IoCtl::from_raw(99, 0), Err(KernelError::NotSupported));
    }
}
