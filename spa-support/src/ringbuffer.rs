//! Lock-free single-producer/single-consumer byte ring.
//!
//! Mirrors `spa/include/spa/ringbuffer.h` from the original source: a power
//! of two sized byte area addressed by monotonically increasing (and
//! wrapping) read/write indices. The ring itself does not own the backing
//! bytes — callers pass the buffer in on every call, which is what lets the
//! same type describe both a plain `Vec<u8>` in tests and a byte range
//! inside a shared memfd mapping in `client-node`.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    NotPowerOfTwo,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Index/size bookkeeping for a ring buffer. `#[repr(C)]` because in
/// `client-node` this header is embedded directly inside the shared-memory
/// transport region and must have a stable cross-process layout.
#[repr(C)]
pub struct RingBuffer {
    read_index: AtomicU32,
    write_index: AtomicU32,
    size: u32,
    mask: u32,
}

impl RingBuffer {
    pub fn new(size: u32) -> Result<Self, Error> {
        if size == 0 || (size & (size - 1)) != 0 {
            return Err(Error::NotPowerOfTwo);
        }
        Ok(Self {
            read_index: AtomicU32::new(0),
            write_index: AtomicU32::new(0),
            size,
            mask: size - 1,
        })
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn clear(&self) {
        self.read_index.store(0, Ordering::Relaxed);
        self.write_index.store(0, Ordering::Relaxed);
    }

    /// Returns the current read index and the number of bytes available to
    /// read. A negative result means underrun, a result greater than `size`
    /// means overrun — neither should happen with a correctly sized ring.
    pub fn read_index(&self) -> (u32, i32) {
        let index = self.read_index.load(Ordering::Relaxed);
        let avail = self.write_index.load(Ordering::Acquire).wrapping_sub(index) as i32;
        (index, avail)
    }

    /// Returns the current write index and the number of bytes already
    /// filled (i.e. `size - filled` bytes are free to write).
    pub fn write_index(&self) -> (u32, i32) {
        let index = self.write_index.load(Ordering::Relaxed);
        let filled = index.wrapping_sub(self.read_index.load(Ordering::Acquire)) as i32;
        (index, filled)
    }

    pub fn read_data(&self, buffer: &[u8], offset: u32, dst: &mut [u8]) {
        debug_assert_eq!(buffer.len(), self.size as usize);
        let offset = offset & self.mask;
        let first = dst.len().min((self.size - offset) as usize);
        dst[..first].copy_from_slice(&buffer[offset as usize..offset as usize + first]);
        if dst.len() > first {
            dst[first..].copy_from_slice(&buffer[..dst.len() - first]);
        }
    }

    pub fn write_data(&self, buffer: &mut [u8], offset: u32, src: &[u8]) {
        debug_assert_eq!(buffer.len(), self.size as usize);
        let offset = offset & self.mask;
        let first = src.len().min((self.size - offset) as usize);
        buffer[offset as usize..offset as usize + first].copy_from_slice(&src[..first]);
        if src.len() > first {
            buffer[..src.len() - first].copy_from_slice(&src[first..]);
        }
    }

    pub fn read_update(&self, index: u32) {
        self.read_index.store(index, Ordering::Release);
    }

    pub fn write_update(&self, index: u32) {
        self.write_index.store(index, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two() {
        assert!(RingBuffer::new(0).is_err());
        assert!(RingBuffer::new(3).is_err());
        assert!(RingBuffer::new(16).is_ok());
    }

    #[test]
    fn write_then_read_roundtrip() {
        let rb = RingBuffer::new(16).unwrap();
        let mut buf = [0u8; 16];

        let (widx, _) = rb.write_index();
        rb.write_data(&mut buf, widx, b"hello");
        rb.write_update(widx + 5);

        let (ridx, avail) = rb.read_index();
        assert_eq!(avail, 5);
        let mut dst = [0u8; 5];
        rb.read_data(&buf, ridx, &mut dst);
        rb.read_update(ridx + 5);
        assert_eq!(&dst, b"hello");

        let (_, avail) = rb.read_index();
        assert_eq!(avail, 0);
    }

    #[test]
    fn wraps_around() {
        let rb = RingBuffer::new(8).unwrap();
        let mut buf = [0u8; 8];

        // fill to index 6, drain it, then write 4 bytes that wrap.
        let (widx, _) = rb.write_index();
        rb.write_data(&mut buf, widx, &[1, 2, 3, 4, 5, 6]);
        rb.write_update(widx + 6);
        let (ridx, _) = rb.read_index();
        rb.read_update(ridx + 6);

        let (widx, _) = rb.write_index();
        assert_eq!(widx & 7, 6);
        rb.write_data(&mut buf, widx, &[7, 8, 9, 10]);
        rb.write_update(widx + 4);

        let (ridx, avail) = rb.read_index();
        assert_eq!(avail, 4);
        let mut dst = [0u8; 4];
        rb.read_data(&buf, ridx, &mut dst);
        assert_eq!(&dst, &[7, 8, 9, 10]);
    }
}
