//! WASI preview1 error numbers returned by the import table

use std::fmt;

/// Subset of `wasi_snapshot_preview1` errno values the host can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Errno {
    Success = 0,
    /// Bad file descriptor
    Badf = 8,
    /// Pointer outside linear memory
    Fault = 21,
    /// Write would exceed the run's output budget
    Fbig = 22,
    /// Too many iovecs in one call
    Inval = 28,
    Overflow = 61,
}

impl Errno {
    /// Value handed back to the guest.
    pub fn raw(self) -> i32 {
        self as u16 as i32
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::Success => "success",
            Errno::Badf => "badf",
            Errno::Fault => "fault",
            Errno::Fbig => "fbig",
            Errno::Inval => "inval",
            Errno::Overflow => "overflow",
        };
        write!(f, "{} ({})", name, self.raw())
    }
}
