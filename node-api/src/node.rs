//! The `Node` trait itself: the generic node interface a client proxy (or
//! any other node implementation) must answer to, plus the buffer/command/
//! event vocabulary those operations speak in.

use std::os::fd::OwnedFd;

use spa_support::pod::{AllocParam, Format, PortInfo, Props};

use crate::error::NodeResult;
use crate::io::PortIoHandle;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// `spa_proxy_node_send_command`'s command set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeCommand {
    Invalid,
    Start,
    Pause,
    Flush,
    Drain,
    Marker,
    ClockUpdate,
}

impl NodeCommand {
    /// `ClockUpdate` is forwarded to the client as a notification and never
    /// gets a `seq`/`async_complete` round trip; every other command does.
    pub fn is_async(self) -> bool {
        !matches!(self, NodeCommand::ClockUpdate)
    }
}

/// What kind of memory a buffer's data region names. Mirrors the original's
/// `SpaDataType`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataType {
    Invalid,
    MemPtr,
    MemFd,
    DmaBuf,
    Id,
}

/// One data region inside a `RawBuffer`, as handed to `port_use_buffers` by
/// whoever actually owns the backing memory (a local producer, or — for the
/// client-node proxy — memory registered on behalf of a remote peer).
#[derive(Debug, Default)]
pub struct DataDescriptor {
    pub data_type: DataType,
    pub fd: Option<OwnedFd>,
    pub map_offset: u64,
    pub max_size: u32,
    pub flags: u32,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Invalid
    }
}

/// Buffer metadata. Only `Shared` (the memory-backing descriptor every
/// buffer must carry) is structurally meaningful here; other meta kinds are
/// opaque payloads the core does not interpret.
#[derive(Debug)]
pub enum MetaDescriptor {
    Shared {
        fd: OwnedFd,
        flags: u32,
        offset: u64,
        size: u64,
    },
    Other(u32, Vec<u8>),
}

#[derive(Debug, Default)]
pub struct RawBuffer {
    pub metas: Vec<MetaDescriptor>,
    pub datas: Vec<DataDescriptor>,
}

/// Outcome of a `process_output` poll: either there's nothing ready, or a
/// buffer is available on some output port (the node's own bookkeeping says
/// which one; this just signals that a look is worthwhile).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessResult {
    NoData,
    HaveOutput,
}

/// Data-path callbacks a node invokes on its owner. Installed once via
/// `Node::set_callbacks`; the node holds onto it for its whole lifetime.
pub trait NodeCallbacks: Send {
    fn have_output(&mut self);
    fn need_input(&mut self);
    fn reuse_buffer(&mut self, port_id: u32, buffer_id: u32);
    fn event(&mut self, event: NodeEvent);
}

/// Events a node reports back to its callbacks outside the plain
/// have-output/need-input/reuse-buffer triad: async completions, and a
/// generic passthrough for whatever the remote side layers on top (the
/// original's `client_node_dispatch_func` `NODE_EVENT` case forwards without
/// interpreting the payload).
#[derive(Debug)]
pub enum NodeEvent {
    AsyncComplete { seq: u32, result: Result<(), crate::NodeError> },
    Generic(Vec<u8>),
}

/// The generic node contract. `client-node`'s proxy node is the one concrete
/// implementation this crate ships; anything else a scheduler wants to talk
/// to the same way implements it too.
pub trait Node: Send {
    fn get_props(&self) -> NodeResult<Props>;
    fn set_props(&mut self, props: &Props) -> NodeResult<()>;

    fn send_command(&mut self, command: NodeCommand) -> NodeResult<()>;

    fn set_callbacks(&mut self, callbacks: Box<dyn NodeCallbacks>) -> NodeResult<()>;

    /// `(n_input_ports, max_input_ports, n_output_ports, max_output_ports)`.
    fn get_n_ports(&self) -> (u32, u32, u32, u32);

    fn get_port_ids(&self, max_input_ids: usize, max_output_ids: usize) -> (Vec<u32>, Vec<u32>);

    fn add_port(&mut self, direction: Direction, port_id: u32) -> NodeResult<()>;
    fn remove_port(&mut self, direction: Direction, port_id: u32) -> NodeResult<()>;

    fn port_enum_formats(
        &self,
        direction: Direction,
        port_id: u32,
        filter: Option<&Format>,
        index: u32,
    ) -> Result<Format, crate::NodeError>;

    fn port_set_format(
        &mut self,
        direction: Direction,
        port_id: u32,
        flags: u32,
        format: Option<Format>,
    ) -> NodeResult<()>;

    fn port_get_format(
        &self,
        direction: Direction,
        port_id: u32,
    ) -> Result<Format, crate::NodeError>;

    fn port_get_info(
        &self,
        direction: Direction,
        port_id: u32,
    ) -> Result<PortInfo, crate::NodeError>;

    fn port_use_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        buffers: Vec<RawBuffer>,
    ) -> NodeResult<()>;

    fn port_alloc_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        params: Vec<AllocParam>,
    ) -> NodeResult<Vec<RawBuffer>>;

    fn port_set_io(
        &mut self,
        direction: Direction,
        port_id: u32,
        io: Option<PortIoHandle>,
    ) -> NodeResult<()>;

    fn port_reuse_buffer(&mut self, port_id: u32, buffer_id: u32) -> NodeResult<()>;

    fn process_input(&mut self) -> NodeResult<()>;
    fn process_output(&mut self) -> Result<ProcessResult, crate::NodeError>;
}
