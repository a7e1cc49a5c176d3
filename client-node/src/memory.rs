//! Memory registry (C2): per-port monotonically increasing memory ids, each
//! naming an owned fd plus the offset/size/flags a client is allowed to map.
//! Tracks what's currently registered for a `(direction, port)`; wholly
//! replaced on every `use_buffers` call.

use std::os::fd::OwnedFd;

use client_rpc::WireDataType;

#[derive(Debug)]
pub struct MemEntry {
    pub mem_id: u32,
    pub data_type: WireDataType,
    pub fd: Option<OwnedFd>,
    pub flags: u32,
    pub offset: u64,
    pub size: u64,
}

/// The set of memory registrations currently live for one port. Replaced
/// wholesale by every `use_buffers`; the previous set is simply dropped,
/// which closes its fds.
#[derive(Debug, Default)]
pub struct PortMemory {
    entries: Vec<MemEntry>,
}

impl PortMemory {
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Registers the next entry, returning its assigned id. Ids are
    /// consecutive starting at 0 within a single `use_buffers` call, which
    /// holds as long as callers always `clear` before registering a fresh
    /// set.
    pub fn register(
        &mut self,
        data_type: WireDataType,
        fd: Option<OwnedFd>,
        flags: u32,
        offset: u64,
        size: u64,
    ) -> u32 {
        let mem_id = self.entries.len() as u32;
        self.entries.push(MemEntry {
            mem_id,
            data_type,
            fd,
            flags,
            offset,
            size,
        });
        mem_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_consecutive_from_zero() {
        let mut mem = PortMemory::default();
        let a = mem.register(WireDataType::MemFd, None, 0, 0, 4096);
        let b = mem.register(WireDataType::MemFd, None, 0, 0, 4096);
        assert_eq!((a, b), (0, 1));
        assert_eq!(mem.len(), 2);
    }

    #[test]
    fn clear_resets_numbering() {
        let mut mem = PortMemory::default();
        mem.register(WireDataType::MemFd, None, 0, 0, 4096);
        mem.clear();
        let a = mem.register(WireDataType::MemFd, None, 0, 0, 4096);
        assert_eq!(a, 0);
    }
}
