//! Flat guest memory image.
//!
//! All command parameters and reply payloads live in the emulated guest's
//! address space. The dispatcher only ever touches memory through this type,
//! which bounds-checks every access and returns an error instead of
//! panicking. Multi-byte values use the guest's big-endian byte order.

use crate::error::{Error, Result};

/// A flat, bounds-checked guest address space.
#[derive(Debug)]
pub struct GuestMemory {
    bytes: Vec<u8>,
}

impl GuestMemory {
    /// Create a zero-filled image of `size` bytes.
    pub fn new(size: usize) -> Self {
        GuestMemory {
            bytes: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn check(&self, address: u32, length: u32) -> Result<usize> {
        let start = address as usize;
        let end = start.checked_add(length as usize).ok_or(Error::Memory {
            address,
            length,
        })?;
        if end > self.bytes.len() {
            return Err(Error::Memory { address, length });
        }
        Ok(start)
    }

    pub fn read_u8(&self, address: u32) -> Result<u8> {
        let start = self.check(address, 1)?;
        Ok(self.bytes[start])
    }

    pub fn read_u16(&self, address: u32) -> Result<u16> {
        let start = self.check(address, 2)?;
        Ok(u16::from_be_bytes(
            self.bytes[start..start + 2].try_into().unwrap(),
        ))
    }

    pub fn read_u32(&self, address: u32) -> Result<u32> {
        let start = self.check(address, 4)?;
        Ok(u32::from_be_bytes(
            self.bytes[start..start + 4].try_into().unwrap(),
        ))
    }

    pub fn read_u64(&self, address: u32) -> Result<u64> {
        let start = self.check(address, 8)?;
        Ok(u64::from_be_bytes(
            self.bytes[start..start + 8].try_into().unwrap(),
        ))
    }

    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<()> {
        let start = self.check(address, 4)?;
        self.bytes[start..start + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn write_u64(&mut self, address: u32, value: u64) -> Result<()> {
        let start = self.check(address, 8)?;
        self.bytes[start..start + 8].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Copy `out.len()` bytes out of guest memory.
    pub fn copy_from_guest(&self, address: u32, out: &mut [u8]) -> Result<()> {
        let start = self.check(address, out.len() as u32)?;
        out.copy_from_slice(&self.bytes[start..start + out.len()]);
        Ok(())
    }

    /// Read `length` bytes of guest memory into a fresh buffer.
    pub fn read_bytes(&self, address: u32, length: u32) -> Result<Vec<u8>> {
        let mut buffer = vec![0; length as usize];
        self.copy_from_guest(address, &mut buffer)?;
        Ok(buffer)
    }

    /// Copy a buffer into guest memory.
    pub fn copy_to_guest(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let start = self.check(address, data.len() as u32)?;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Zero-fill a guest range. Used for the defensive clearing of output
    /// vectors before dispatch.
    pub fn memset(&mut self, address: u32, value: u8, length: u32) -> Result<()> {
        let start = self.check(address, length)?;
        self.bytes[start..start + length as usize].fill(value);
        Ok(())
    }

    /// Write a NUL-terminated ASCII string into guest memory.
    pub fn write_cstr(&mut self, address: u32, text: &str) -> Result<()> {
        let mut data = text.as_bytes().to_vec();
        data.push(0);
        self.copy_to_guest(address, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_are_big_endian() {
        let mut mem = GuestMemory::new(0x100);
        mem.write_u32(0x10, 0x0102_0304).unwrap();
        assert_eq!(mem.read_u8(0x10).unwrap(), 0x01);
        assert_eq!(mem.read_u16(0x10).unwrap(), 0x0102);
        assert_eq!(mem.read_u32(0x10).unwrap(), 0x0102_0304);

        mem.write_u64(0x20, 0x0001_0001_0000_0002).unwrap();
        assert_eq!(mem.read_u32(0x20).unwrap(), 0x0001_0001);
        assert_eq!(mem.read_u32(0x24).unwrap(), 0x0000_0002);
    }

    #[test]
    fn out_of_bounds_access_is_an_error() {
        let mut mem = GuestMemory::new(0x20);
        assert!(mem.read_u32(0x1e).is_err());
        assert!(mem.write_u32(0x20, 0).is_err());
        assert!(mem.memset(0x10, 0, 0x11).is_err());
        // Address arithmetic must not wrap.
        assert!(mem.read_u64(0xffff_fffc).is_err());
    }

    #[test]
    fn memset_clears_exactly_the_range() {
        let mut mem = GuestMemory::new(0x40);
        mem.copy_to_guest(0x00, &[0xaa; 0x40]).unwrap();
        mem.memset(0x10, 0, 0x10).unwrap();
        assert_eq!(mem.read_u8(0x0f).unwrap(), 0xaa);
        assert_eq!(mem.read_u8(0x10).unwrap(), 0x00);
        assert_eq!(mem.read_u8(0x1f).unwrap(), 0x00);
        assert_eq!(mem.read_u8(0x20).unwrap(), 0xaa);
    }
}
