//! The messages that actually cross the socket, split into outbound
//! notifications the proxy sends to drive the remote node
//! (`node_command`, `set_format`, `add_mem`, `use_buffers`, `transport`) and
//! inbound reverse operations the remote node uses to describe itself
//! (`node_update`, `port_update`, `event`, plus the node-state transitions
//! `client-node.c`'s dispatch func treats specially).
//!
//! Buffer descriptors never carry raw fds on the wire: a `data`/`meta`
//! references a `mem_id` that was handed out by a prior `AddMem`, and the
//! actual fd for that registration travels once, out of band, as ancillary
//! data on the message that introduced it (`transport.rs`).

use spa_support::pod::{Format, PortInfo};

#[derive(Copy, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum WireDirection {
    Input,
    Output,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum WireNodeCommand {
    Invalid,
    Start,
    Pause,
    Flush,
    Drain,
    Marker,
    ClockUpdate,
}

/// The underlying node's own run state, as the original's
/// `PINOS_MESSAGE_NODE_STATE_CHANGE` reports it. Distinct from
/// `client-node`'s own lifecycle (`ClientNode`'s New/Initialised/.../Freed)
/// — this is what the *remote node implementation* says about itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum WireNodeState {
    Init,
    Configure,
    Ready,
    Paused,
    Streaming,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum WireDataType {
    Invalid,
    MemPtr,
    MemFd,
    DmaBuf,
    Id,
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub enum WireMeta {
    Shared {
        mem_id: u32,
        flags: u32,
        offset: u64,
        size: u64,
    },
    Other(u32, Vec<u8>),
}

#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub struct WireData {
    pub data_type: WireDataType,
    pub mem_id: u32,
    pub map_offset: u64,
    pub max_size: u32,
    pub flags: u32,
}

#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct WireBuffer {
    pub metas: Vec<WireMeta>,
    pub datas: Vec<WireData>,
}

/// Messages the proxy side sends to drive the remote node. None of these
/// get a reply on this same channel: completion is reported back later,
/// either as a `NodeStateChange` (for the very first one) or is simply
/// assumed once the call returns — there is no outstanding-op table.
#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub enum ServerToClient {
    /// Sent once, right after the data connection is established: the
    /// memfd backing the transport region travels as ancillary data on this
    /// same message.
    Transport { offset: u64, size: u64 },
    SetFormat {
        direction: WireDirection,
        port_id: u32,
        flags: u32,
        format: Option<Format>,
    },
    /// Registers one piece of memory under `mem_id` for later buffers to
    /// reference. The fd (when `data_type` is `MemFd`/`DmaBuf`) travels as
    /// ancillary data on this message.
    AddMem {
        direction: WireDirection,
        port_id: u32,
        mem_id: u32,
        data_type: WireDataType,
        flags: u32,
    },
    UseBuffers {
        direction: WireDirection,
        port_id: u32,
        buffers: Vec<WireBuffer>,
    },
    NodeCommand {
        seq: Option<u32>,
        command: WireNodeCommand,
    },
}

/// Reverse operations: the remote node describing itself back to the proxy.
#[derive(Clone, Debug, bincode::Encode, bincode::Decode)]
pub enum ClientToServer {
    NodeUpdate {
        change_mask: u32,
        max_input_ports: u32,
        max_output_ports: u32,
    },
    /// `change_mask == 0` means "remove this port", mirroring
    /// `client_node_dispatch_func`'s `PINOS_MESSAGE_PORT_UPDATE` handling.
    PortUpdate {
        direction: WireDirection,
        port_id: u32,
        change_mask: u32,
        possible_formats: Vec<Format>,
        format: Option<Format>,
        info: Option<PortInfo>,
    },
    NodeStateChange {
        state: WireNodeState,
    },
    /// Forwarded verbatim to the installed node callback's event handler;
    /// the proxy does not interpret the payload.
    Event { payload: Vec<u8> },
    /// The remote node asking to be torn down while keeping its socket
    /// open; handled the same way as the socket simply closing.
    Destroy,
}
