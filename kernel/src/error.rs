//! Kernel error types and the errno mapping used at the syscall boundary.
//!
//! Resource exhaustion and request-level failures are ordinary `Err` values
//! propagated with `?`; programmer contract violations panic.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Named object (file, device, fd) does not exist.
    NoEntry,
    /// Input/output failure on a device or descriptor.
    Io,
    /// No such device registered.
    NoDevice,
    /// Malformed argument.
    Invalid,
    /// User pointer failed page-permission validation.
    Access,
    /// Filesystem-level failure (no open-file slot, ioctl on a stale
    /// handle, backing-stream failure during mount).
    Filesys,
    /// Operation not recognized by this stream.
    NotSupported,
    /// Device already open / queue busy.
    Busy,
    /// Process table is full.
    TooManyProcs,
    /// Stream is not in a state where the request makes sense.
    BadFormat,
    /// ELF loader rejection; carries the step that failed.
    Elf(ElfError),
}

/// ELF loader errors, one per validation/load step. The discriminants are
/// the (positive) tags surfaced as negative return values, kept distinct so
/// a failing exec pinpoints the offending check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ElfError {
    ReadFailure = 1,
    ShortHeader = 2,
    BadMagic = 3,
    BadClass = 4,
    BadEndian = 5,
    BadAbi = 6,
    BadMachine = 7,
    ProgHeaderRead = 8,
    ProgAddr = 9,
    ProgSegRead = 10,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// The negative errno value placed in a0 when a syscall fails.
    pub const fn errno(self) -> i64 {
        match self {
            KernelError::NoEntry => -2,
            KernelError::Io => -5,
            KernelError::NoDevice => -19,
            KernelError::Invalid => -22,
            KernelError::Access => -13,
            KernelError::Filesys => -30,
            KernelError::NotSupported => -95,
            KernelError::Busy => -16,
            KernelError::TooManyProcs => -24,
            KernelError::BadFormat => -8,
            KernelError::Elf(e) => -(e as i64),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEntry => write!(f, "no such entry"),
            Self::Io => write!(f, "I/O error"),
            Self::NoDevice => write!(f, "no such device"),
            Self::Invalid => write!(f, "invalid argument"),
            Self::Access => write!(f, "user pointer validation failed"),
            Self::Filesys => write!(f, "filesystem error"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Busy => write!(f, "device or resource busy"),
            Self::TooManyProcs => write!(f, "process table full"),
            Self::BadFormat => write!(f, "bad stream state"),
            Self::Elf(e) => write!(f, "ELF load failed: {}", e),
        }
    }
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailure => write!(f, "header read failed"),
            Self::ShortHeader => write!(f, "short header"),
            Self::BadMagic => write!(f, "bad magic"),
            Self::BadClass => write!(f, "not ELF64"),
            Self::BadEndian => write!(f, "not little-endian"),
            Self::BadAbi => write!(f, "not System V ABI"),
            Self::BadMachine => write!(f, "not RISC-V"),
            Self::ProgHeaderRead => write!(f, "program header read failed"),
            Self::ProgAddr => write!(f, "segment outside user range"),
            Self::ProgSegRead => write!(f, "segment read failed"),
        }
    }
}

impl From<ElfError> for KernelError {
    fn from(err: ElfError) -> Self {
        Self::Elf(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elf_errnos_are_distinct_per_step() {
        let all = [
            ElfError::ReadFailure,
            ElfError::ShortHeader,
            ElfError::BadMagic,
            ElfError::BadClass,
            ElfError::BadEndian,
            ElfError::BadAbi,
            ElfError::BadMachine,
            ElfError::ProgHeaderRead,
            ElfError::ProgAddr,
            ElfError::ProgSegRead,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(KernelError::Elf(*a).errno() < 0);
            for b in &all[i + 1..] {
                assert_ne!(KernelError::Elf(*a).errno(), KernelError::Elf(*b).errno());
            }
        }
        assert_eq!(KernelError::Elf(ElfError::BadEndian).errno(), -5);
        assert_eq!(KernelError::Elf(ElfError::BadMachine).errno(), -7);
    }
}
