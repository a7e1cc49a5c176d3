//! `io` slots: a small fixed record shared between a node and whatever
//! schedules it, used to pass buffer references back and forth without a
//! round trip through the full event path. The original hands out a raw
//! pointer whose lifetime is the caller's responsibility; here the same
//! shared-mutable-state contract is expressed as an `Arc` the caller keeps
//! alive and a clone the node holds, with plain field access swapped for
//! atomics because the main loop and data loop touch it from different
//! threads.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum IoStatus {
    Ok = 0,
    NeedBuffer = 1,
    HaveBuffer = 2,
}

impl IoStatus {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => IoStatus::NeedBuffer,
            2 => IoStatus::HaveBuffer,
            _ => IoStatus::Ok,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

pub struct PortIo {
    status: AtomicU32,
    buffer_id: AtomicU32,
    range_offset: AtomicU32,
    range_size: AtomicU32,
}

/// `u32::MAX` marks "no buffer", matching the original's `SPA_ID_INVALID`
/// sentinel; `0` is a valid buffer id, so it cannot double as the sentinel.
pub const INVALID_BUFFER_ID: u32 = u32::MAX;

impl Default for PortIo {
    fn default() -> Self {
        Self {
            status: AtomicU32::new(IoStatus::Ok as u32),
            buffer_id: AtomicU32::new(INVALID_BUFFER_ID),
            range_offset: AtomicU32::new(0),
            range_size: AtomicU32::new(0),
        }
    }
}

pub type PortIoHandle = Arc<PortIo>;

impl PortIo {
    pub fn status(&self) -> IoStatus {
        IoStatus::from_u32(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: IoStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    pub fn buffer_id(&self) -> u32 {
        self.buffer_id.load(Ordering::Acquire)
    }

    pub fn set_buffer_id(&self, id: u32) {
        self.buffer_id.store(id, Ordering::Release);
    }

    pub fn range(&self) -> (u32, u32) {
        (
            self.range_offset.load(Ordering::Acquire),
            self.range_size.load(Ordering::Acquire),
        )
    }

    pub fn set_range(&self, offset: u32, size: u32) {
        self.range_offset.store(offset, Ordering::Release);
        self.range_size.store(size, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        let io = PortIo::default();
        assert_eq!(io.status(), IoStatus::Ok);
        io.set_status(IoStatus::HaveBuffer);
        io.set_buffer_id(7);
        io.set_range(128, 4096);
        assert_eq!(io.status(), IoStatus::HaveBuffer);
        assert_eq!(io.buffer_id(), 7);
        assert_eq!(io.range(), (128, 4096));
    }
}
