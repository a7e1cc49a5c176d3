//! Port state (C3): per-port possible-formats list, negotiated format, port
//! info, installed `io` slot, and buffer table.

use node_api::{NodeError, PortIoHandle};
use spa_support::pod::{Format, PortInfo};

use crate::memory::PortMemory;

pub const MAX_PORTS: u32 = 64;
pub const MAX_BUFFERS: usize = 64;
pub const MAX_BUFFER_METAS: usize = 4;
pub const MAX_BUFFER_DATAS: usize = 4;

pub const CHANGE_POSSIBLE_FORMATS: u32 = 1 << 0;
pub const CHANGE_FORMAT: u32 = 1 << 1;
pub const CHANGE_PROPS: u32 = 1 << 2;
pub const CHANGE_INFO: u32 = 1 << 3;
pub const CHANGE_ALL: u32 = CHANGE_POSSIBLE_FORMATS | CHANGE_FORMAT | CHANGE_PROPS | CHANGE_INFO;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortLifecycle {
    Unused,
    Configured,
    Buffered,
}

/// A mirrored copy of one client-owned buffer: embedded fixed-capacity meta
/// and data arrays (more than `MAX_BUFFER_METAS`/`MAX_BUFFER_DATAS` entries
/// is rejected at construction), the `Shared` block's total size, and an
/// `outstanding` flag set while the buffer has been handed to the client and
/// not yet reused.
#[derive(Debug, Clone)]
pub struct ProxyBuffer {
    pub metas: Vec<client_rpc::WireMeta>,
    pub datas: Vec<client_rpc::WireData>,
    pub shared_size: u64,
    pub outstanding: bool,
}

impl ProxyBuffer {
    pub fn new(metas: Vec<client_rpc::WireMeta>, datas: Vec<client_rpc::WireData>, shared_size: u64) -> Result<Self, NodeError> {
        if metas.len() > MAX_BUFFER_METAS || datas.len() > MAX_BUFFER_DATAS {
            return Err(NodeError::Error("buffer exceeds embedded meta/data capacity".into()));
        }
        Ok(Self {
            metas,
            datas,
            shared_size,
            outstanding: false,
        })
    }
}

#[derive(Default)]
pub struct Port {
    valid: bool,
    lifecycle_buffered: bool,
    pub possible_formats: Vec<Format>,
    pub format: Option<Format>,
    pub info: PortInfo,
    pub io: Option<PortIoHandle>,
    pub buffers: Vec<ProxyBuffer>,
    pub registered_mem: PortMemory,
}

impl Port {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn lifecycle(&self) -> PortLifecycle {
        if !self.valid {
            PortLifecycle::Unused
        } else if self.lifecycle_buffered {
            PortLifecycle::Buffered
        } else {
            PortLifecycle::Configured
        }
    }

    /// Marks the port as belonging to the proxy's port set. Returns `true`
    /// iff this is the transition from invalid to valid (the caller uses
    /// that to bump its input/output counter).
    pub fn mark_valid(&mut self) -> bool {
        if self.valid {
            return false;
        }
        self.valid = true;
        true
    }

    /// Applies the masked subset of fields from a port update, same shape
    /// whether driven locally (`add_port`) or by a client reverse op.
    /// Returns `true` iff this is the transition from invalid to valid.
    pub fn update(
        &mut self,
        change_mask: u32,
        possible_formats: Option<Vec<Format>>,
        format: Option<Option<Format>>,
        info: Option<PortInfo>,
    ) -> bool {
        if change_mask & CHANGE_POSSIBLE_FORMATS != 0 {
            self.possible_formats = possible_formats.unwrap_or_default();
        }
        if change_mask & CHANGE_FORMAT != 0 {
            let new_format = format.unwrap_or(None);
            if new_format.is_none() {
                self.clear_buffers();
                if self.lifecycle_buffered {
                    self.lifecycle_buffered = false;
                }
            }
            self.format = new_format;
        }
        if change_mask & CHANGE_INFO != 0 {
            if let Some(info) = info {
                self.info = info;
            }
        }
        self.mark_valid()
    }

    /// Clears all fields, decrements-owning caller responsibility aside,
    /// and returns the port to `Unused`.
    pub fn uninit(&mut self) {
        self.valid = false;
        self.lifecycle_buffered = false;
        self.possible_formats.clear();
        self.format = None;
        self.info = PortInfo::default();
        self.io = None;
        self.clear_buffers();
    }

    pub(crate) fn clear_buffers(&mut self) {
        self.buffers.clear();
        self.registered_mem.clear();
    }

    pub fn enum_formats(&self, filter: Option<&Format>, index: u32) -> Result<Format, NodeError> {
        let mut seen = 0u32;
        for candidate in self.possible_formats.iter().skip(index as usize) {
            let matched = match filter {
                Some(filter) => filter.filter(candidate),
                None => Some(candidate.clone()),
            };
            if let Some(matched) = matched {
                return Ok(matched);
            }
            seen += 1;
        }
        let _ = seen;
        Err(NodeError::EnumEnd)
    }

    pub fn set_io(&mut self, io: Option<PortIoHandle>) {
        self.io = io;
    }

    /// Replaces the buffer table wholesale. `format == none` must never
    /// reach here with a non-empty `buffers` — callers check that first.
    pub fn set_buffers(&mut self, buffers: Vec<ProxyBuffer>) {
        self.lifecycle_buffered = !buffers.is_empty();
        self.buffers = buffers;
    }
}
