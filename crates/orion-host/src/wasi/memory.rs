//! Bounds-checked access to a guest's linear memory
//!
//! Every pointer a guest hands to a WASI call is untrusted. All reads and
//! writes go through [`GuestMemory`], which turns an out-of-range access into
//! [`Errno::Fault`] instead of a host panic.

use super::errno::Errno;

/// Guest pointer type (32-bit address in WASM linear memory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestPtr(pub u32);

impl GuestPtr {
    pub fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Pointer `bytes` further on; `None` if it would wrap the address space.
    pub fn offset(&self, bytes: u32) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl From<i32> for GuestPtr {
    fn from(addr: i32) -> Self {
        // Guest addresses are unsigned; reinterpret the bits.
        Self(addr as u32)
    }
}

/// A `ciovec`/`iovec` entry: buffer pointer and length, 8 bytes in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVec {
    pub buf: GuestPtr,
    pub len: u32,
}

impl IoVec {
    pub const SIZE: u32 = 8;
    /// Most iovecs accepted by one call, matching POSIX `IOV_MAX`
    pub const MAX_COUNT: u32 = 1024;
}

/// View over linear memory for the duration of one host call
pub struct GuestMemory<'a> {
    data: &'a mut [u8],
}

impl<'a> GuestMemory<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn range(&self, ptr: GuestPtr, len: u32) -> Result<std::ops::Range<usize>, Errno> {
        let start = ptr.as_usize();
        let end = start.checked_add(len as usize).ok_or(Errno::Fault)?;
        if end > self.data.len() {
            return Err(Errno::Fault);
        }
        Ok(start..end)
    }

    pub fn read(&self, ptr: GuestPtr, len: u32) -> Result<&[u8], Errno> {
        let range = self.range(ptr, len)?;
        Ok(&self.data[range])
    }

    pub fn read_mut(&mut self, ptr: GuestPtr, len: u32) -> Result<&mut [u8], Errno> {
        let range = self.range(ptr, len)?;
        Ok(&mut self.data[range])
    }

    pub fn read_u32(&self, ptr: GuestPtr) -> Result<u32, Errno> {
        let bytes = self.read(ptr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, ptr: GuestPtr, value: u32) -> Result<(), Errno> {
        self.read_mut(ptr, 4)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, ptr: GuestPtr, bytes: &[u8]) -> Result<(), Errno> {
        let len = u32::try_from(bytes.len()).map_err(|_| Errno::Overflow)?;
        self.read_mut(ptr, len)?.copy_from_slice(bytes);
        Ok(())
    }

    /// Decode `count` iovec entries starting at `base`. Each entry's buffer
    /// must lie inside memory; more than [`IoVec::MAX_COUNT`] is `INVAL`.
    pub fn iovecs(&self, base: GuestPtr, count: u32) -> Result<Vec<IoVec>, Errno> {
        if count > IoVec::MAX_COUNT {
            return Err(Errno::Inval);
        }
        let mut iovs = Vec::with_capacity(count as usize);
        for i in 0..count {
            let at = i
                .checked_mul(IoVec::SIZE)
                .and_then(|off| base.offset(off))
                .ok_or(Errno::Fault)?;
            let buf = GuestPtr(self.read_u32(at)?);
            let len = self.read_u32(at.offset(4).ok_or(Errno::Fault)?)?;
            self.range(buf, len)?;
            iovs.push(IoVec { buf, len });
        }
        Ok(iovs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_ptr_offset() {
        assert_eq!(GuestPtr(8).offset(4), Some(GuestPtr(12)));
        assert_eq!(GuestPtr(u32::MAX).offset(1), None);
        assert_eq!(GuestPtr::from(-1i32), GuestPtr(u32::MAX));
    }

    #[test]
    fn test_read_write_u32() {
        let mut data = vec![0u8; 16];
        let mut mem = GuestMemory::new(&mut data);
        mem.write_u32(GuestPtr(4), 0xdead_beef).unwrap();
        assert_eq!(mem.read_u32(GuestPtr(4)).unwrap(), 0xdead_beef);
        assert_eq!(&data[4..8], &[0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_out_of_bounds_is_fault() {
        let mut data = vec![0u8; 8];
        let mut mem = GuestMemory::new(&mut data);
        assert_eq!(mem.read(GuestPtr(6), 4), Err(Errno::Fault));
        assert_eq!(mem.write_u32(GuestPtr(5), 1), Err(Errno::Fault));
        assert_eq!(mem.read(GuestPtr(u32::MAX), 2), Err(Errno::Fault));
        assert!(mem.read(GuestPtr(8), 0).is_ok());
    }

    #[test]
    fn test_iovecs_decode() {
        let mut data = vec![0u8; 256];
        {
            let mut mem = GuestMemory::new(&mut data);
            mem.write_u32(GuestPtr(0), 100).unwrap();
            mem.write_u32(GuestPtr(4), 5).unwrap();
            mem.write_u32(GuestPtr(8), 200).unwrap();
            mem.write_u32(GuestPtr(12), 7).unwrap();
        }
        let mem = GuestMemory::new(&mut data);
        let iovs = mem.iovecs(GuestPtr(0), 2).unwrap();
        assert_eq!(
            iovs,
            vec![
                IoVec { buf: GuestPtr(100), len: 5 },
                IoVec { buf: GuestPtr(200), len: 7 },
            ]
        );
        assert_eq!(mem.iovecs(GuestPtr(250), 2), Err(Errno::Fault));
    }

    #[test]
    fn test_iovecs_rejects_buffer_outside_memory() {
        let mut data = vec![0u8; 32];
        let mut mem = GuestMemory::new(&mut data);
        mem.write_u32(GuestPtr(0), 16).unwrap();
        mem.write_u32(GuestPtr(4), 17).unwrap();
        assert_eq!(mem.iovecs(GuestPtr(0), 1), Err(Errno::Fault));
    }

    #[test]
    fn test_iovecs_count_limit() {
        let mut data = vec![0u8; 16];
        let mem = GuestMemory::new(&mut data);
        assert_eq!(mem.iovecs(GuestPtr(0), IoVec::MAX_COUNT + 1), Err(Errno::Inval));
        assert_eq!(mem.iovecs(GuestPtr(0), u32::MAX), Err(Errno::Inval));
    }
}
