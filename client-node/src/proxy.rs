//! Proxy node (C4): the one concrete `Node` implementation this crate ships.
//! Every call either answers synchronously from local port state or emits a
//! control message over the owning client's connection and hands back an
//! async handle; the reply is correlated later by the sequence number the
//! client echoes in its `async_complete`.

use std::sync::{Arc, Mutex};

use client_rpc::{Connection, ServerToClient, WireDirection, WireNodeCommand, WireNodeState};
use node_api::{
    DataDescriptor, DataType, Direction, MetaDescriptor, Node, NodeCallbacks, NodeCommand,
    NodeError, NodeEvent, NodeResult, Outcome, ProcessResult, RawBuffer,
};
use spa_support::pod::{AllocParam, Format, Props};
use spa_support::EventLoop;

use crate::port::{Port, PortLifecycle, ProxyBuffer, CHANGE_ALL, MAX_BUFFERS, MAX_PORTS};
use crate::transport::{DataFds, Event, RingDirection, Transport};

fn to_wire_direction(d: Direction) -> WireDirection {
    match d {
        Direction::Input => WireDirection::Input,
        Direction::Output => WireDirection::Output,
    }
}

fn to_wire_command(c: NodeCommand) -> WireNodeCommand {
    match c {
        NodeCommand::Invalid => WireNodeCommand::Invalid,
        NodeCommand::Start => WireNodeCommand::Start,
        NodeCommand::Pause => WireNodeCommand::Pause,
        NodeCommand::Flush => WireNodeCommand::Flush,
        NodeCommand::Drain => WireNodeCommand::Drain,
        NodeCommand::Marker => WireNodeCommand::Marker,
        NodeCommand::ClockUpdate => WireNodeCommand::ClockUpdate,
    }
}

/// A resource bound to the owning client: the connection calls are sent on,
/// plus the transport the data path operates over. Absent until a client
/// resource is actually bound (`ClientNode` may exist before that point).
pub struct Resource {
    pub connection: Arc<Connection>,
    pub transport: Arc<Transport>,
    pub data_fds: Arc<DataFds>,
    /// The main loop this proxy is scheduled on; control messages are sent
    /// by spawning onto it rather than blocking the caller of `Node` methods
    /// on the connection's async send.
    pub loop_: EventLoop,
}

/// Backing storage is always the full `MAX_PORTS` array, same as the
/// original's hardcoded `in_ports[MAX_INPUTS]`/`out_ports[MAX_OUTPUTS]`;
/// `max_ports` is an advisory counter the client reports for its own
/// capacity and is used only for `get_n_ports` reporting and `add_port`
/// admission, never as the array bound.
struct PortTable {
    ports: Vec<Port>,
    n_valid: u32,
    max_ports: u32,
}

impl PortTable {
    fn new(max_ports: u32) -> Self {
        let mut ports = Vec::with_capacity(MAX_PORTS as usize);
        ports.resize_with(MAX_PORTS as usize, Port::default);
        Self {
            ports,
            n_valid: 0,
            max_ports: max_ports.min(MAX_PORTS),
        }
    }

    fn get(&self, port_id: u32) -> Result<&Port, NodeError> {
        self.ports.get(port_id as usize).filter(|p| p.is_valid()).ok_or(NodeError::InvalidPort)
    }

    fn get_mut(&mut self, port_id: u32) -> Result<&mut Port, NodeError> {
        self.ports
            .get_mut(port_id as usize)
            .filter(|p| p.is_valid())
            .ok_or(NodeError::InvalidPort)
    }

    fn slot_mut(&mut self, port_id: u32) -> Result<&mut Port, NodeError> {
        self.ports.get_mut(port_id as usize).ok_or(NodeError::InvalidPort)
    }
}

/// Node-update mask bit: `max_input_ports`/`max_output_ports` should be
/// applied from this call.
pub const NODE_CHANGE_MAX_PORTS: u32 = 1 << 0;

/// The proxy node itself. Owns the two port tables, the current sequence
/// counter, and (once bound) the resource connecting it to its client.
pub struct ProxyNode {
    in_ports: PortTable,
    out_ports: PortTable,
    seq: u32,
    resource: Option<Resource>,
    callbacks: Option<Box<dyn NodeCallbacks>>,
    node_state: WireNodeState,
}

impl ProxyNode {
    pub fn new(max_input_ports: u32, max_output_ports: u32) -> Self {
        Self {
            in_ports: PortTable::new(max_input_ports),
            out_ports: PortTable::new(max_output_ports),
            seq: 0,
            resource: None,
            callbacks: None,
            node_state: WireNodeState::Init,
        }
    }

    /// `(max_input_ports, max_output_ports, n_valid_input_ports, n_valid_output_ports)`.
    pub fn port_capacities_and_counts(&self) -> (u32, u32, u32, u32) {
        (
            self.in_ports.max_ports,
            self.out_ports.max_ports,
            self.in_ports.n_valid,
            self.out_ports.n_valid,
        )
    }

    /// Uninits every valid port in both directions, as part of the
    /// destroy cascade's "release port state" step.
    pub fn uninit_all_ports(&mut self) {
        for port in self.in_ports.ports.iter_mut() {
            port.uninit();
        }
        self.in_ports.n_valid = 0;
        for port in self.out_ports.ports.iter_mut() {
            port.uninit();
        }
        self.out_ports.n_valid = 0;
    }

    pub fn bind_resource(&mut self, resource: Resource) {
        self.resource = Some(resource);
    }

    pub fn resource(&self) -> Option<&Resource> {
        self.resource.as_ref()
    }

    pub fn take_resource(&mut self) -> Option<Resource> {
        self.resource.take()
    }

    pub fn transport_handle(&self) -> Option<Arc<Transport>> {
        self.resource.as_ref().map(|r| r.transport.clone())
    }

    /// Drains every event currently queued in the inbound (client-to-proxy)
    /// ring and dispatches it to the installed callbacks, same shape as the
    /// outbound direction's `process_input`/`process_output`.
    pub fn drain_from_client(&mut self) {
        let transport = match self.transport_handle() {
            Some(t) => t,
            None => return,
        };
        while transport.next_event(RingDirection::FromClient) {
            match transport.parse_event(RingDirection::FromClient) {
                Some(Event::HaveOutput) => self.deliver_have_output(&transport),
                Some(Event::NeedInput) => self.deliver_need_input(),
                Some(Event::ReuseBuffer { port_id, buffer_id }) => {
                    self.deliver_reuse_buffer(port_id, buffer_id)
                }
                None => log::warn!("proxy: unrecognized event in inbound ring, skipping"),
            }
        }
    }

    fn deliver_have_output(&mut self, transport: &Transport) {
        for (index, port) in self.out_ports.ports.iter().enumerate() {
            if let Some(io) = &port.io {
                if let Some(slot) = transport.output_io(index as u32) {
                    slot.copy_to(io);
                }
            }
        }
        if let Some(cbs) = &mut self.callbacks {
            cbs.have_output();
        }
    }

    fn deliver_need_input(&mut self) {
        if let Some(cbs) = &mut self.callbacks {
            cbs.need_input();
        }
    }

    fn deliver_reuse_buffer(&mut self, port_id: u32, buffer_id: u32) {
        if let Some(cbs) = &mut self.callbacks {
            cbs.reuse_buffer(port_id, buffer_id);
        }
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn table(&self, direction: Direction) -> &PortTable {
        match direction {
            Direction::Input => &self.in_ports,
            Direction::Output => &self.out_ports,
        }
    }

    fn table_mut(&mut self, direction: Direction) -> &mut PortTable {
        match direction {
            Direction::Input => &mut self.in_ports,
            Direction::Output => &mut self.out_ports,
        }
    }

    fn send(&self, msg: &ServerToClient) {
        if let Some(resource) = &self.resource {
            let connection = resource.connection.clone();
            let msg = msg.clone();
            resource.loop_.spawn(async move {
                if let Err(err) = connection.send(&msg).await {
                    log::warn!("proxy: failed to send control message: {err}");
                }
            });
        }
    }

    fn inject_and_signal(&self, dir: RingDirection, event: Event) {
        if let Some(resource) = &self.resource {
            resource.transport.add_event(dir, event);
        }
    }

    /// Client-driven reverse op: the remote node describing its own port
    /// capacities. Only applies `max_input_ports`/`max_output_ports` when
    /// `change_mask` carries `NODE_CHANGE_MAX_PORTS`.
    pub fn node_update(&mut self, change_mask: u32, max_input_ports: u32, max_output_ports: u32) {
        if change_mask & NODE_CHANGE_MAX_PORTS != 0 {
            self.in_ports.max_ports = max_input_ports.min(MAX_PORTS);
            self.out_ports.max_ports = max_output_ports.min(MAX_PORTS);
        }
        // max_ports is advisory only; the backing arrays are always MAX_PORTS
        // long, so raising it here never needs a resize.
    }

    /// Client-driven reverse op. `change_mask == 0` removes the port.
    pub fn port_update(
        &mut self,
        direction: Direction,
        port_id: u32,
        change_mask: u32,
        possible_formats: Vec<Format>,
        format: Option<Format>,
        info: Option<node_api::PortInfo>,
    ) -> Result<(), NodeError> {
        let table = self.table_mut(direction);
        let port = table.slot_mut(port_id)?;
        if change_mask == 0 {
            port.uninit();
            table.n_valid = table.n_valid.saturating_sub(1);
            return Ok(());
        }
        let became_valid = port.update(change_mask, Some(possible_formats), Some(format), info);
        if became_valid {
            table.n_valid += 1;
        }
        Ok(())
    }

    /// Client-driven reverse op: forwarded verbatim to the installed node
    /// callback.
    pub fn client_event(&mut self, payload: Vec<u8>) {
        if let Some(cbs) = &mut self.callbacks {
            cbs.event(NodeEvent::Generic(payload));
        }
    }

    /// Client-driven reverse op: the remote node's own run-state report.
    /// The very first transition away from `Init` synthesizes an
    /// `AsyncComplete{seq: 0, ..}` completion event, mirroring the original
    /// dispatcher's one-shot behavior.
    pub fn node_state_change(&mut self, state: WireNodeState) {
        let previous = self.node_state;
        self.node_state = state;
        if previous == WireNodeState::Init && state != WireNodeState::Init {
            if let Some(cbs) = &mut self.callbacks {
                cbs.event(NodeEvent::AsyncComplete { seq: 0, result: Ok(()) });
            }
        }
    }
}

impl Node for ProxyNode {
    fn get_props(&self) -> NodeResult<Props> {
        Err(NodeError::NotImplemented)
    }

    fn set_props(&mut self, _props: &Props) -> NodeResult<()> {
        Err(NodeError::NotImplemented)
    }

    fn send_command(&mut self, command: NodeCommand) -> NodeResult<()> {
        if self.resource.is_none() {
            return Ok(Outcome::Done(()));
        }
        if !command.is_async() {
            let seq = self.next_seq();
            self.send(&ServerToClient::NodeCommand {
                seq: Some(seq),
                command: to_wire_command(command),
            });
            return Ok(Outcome::Done(()));
        }
        let seq = self.next_seq();
        self.send(&ServerToClient::NodeCommand {
            seq: Some(seq),
            command: to_wire_command(command),
        });
        if command == NodeCommand::Start {
            self.inject_and_signal(RingDirection::ToClient, Event::NeedInput);
            if let Some(resource) = &self.resource {
                let _ = resource_signal_to_client(resource);
            }
        }
        Ok(Outcome::Async(node_api::AsyncSeq(seq)))
    }

    fn set_callbacks(&mut self, callbacks: Box<dyn NodeCallbacks>) -> NodeResult<()> {
        self.callbacks = Some(callbacks);
        Ok(Outcome::Done(()))
    }

    fn get_n_ports(&self) -> (u32, u32, u32, u32) {
        (
            self.in_ports.n_valid,
            self.in_ports.max_ports,
            self.out_ports.n_valid,
            self.out_ports.max_ports,
        )
    }

    fn get_port_ids(&self, max_input_ids: usize, max_output_ids: usize) -> (Vec<u32>, Vec<u32>) {
        let input_ids = self
            .in_ports
            .ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_valid())
            .map(|(i, _)| i as u32)
            .take(max_input_ids)
            .collect();
        let output_ids = self
            .out_ports
            .ports
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_valid())
            .map(|(i, _)| i as u32)
            .take(max_output_ids)
            .collect();
        (input_ids, output_ids)
    }

    fn add_port(&mut self, direction: Direction, port_id: u32) -> NodeResult<()> {
        let table = self.table_mut(direction);
        if port_id >= table.max_ports {
            return Err(NodeError::InvalidPort);
        }
        let port = table.slot_mut(port_id)?;
        if port.is_valid() {
            return Err(NodeError::InvalidPort);
        }
        port.update(CHANGE_ALL, Some(Vec::new()), Some(None), Some(node_api::PortInfo::default()));
        table.n_valid += 1;
        Ok(Outcome::Done(()))
    }

    fn remove_port(&mut self, direction: Direction, port_id: u32) -> NodeResult<()> {
        let table = self.table_mut(direction);
        let port = table.get_mut(port_id)?;
        port.uninit();
        table.n_valid = table.n_valid.saturating_sub(1);
        Ok(Outcome::Done(()))
    }

    fn port_enum_formats(
        &self,
        direction: Direction,
        port_id: u32,
        filter: Option<&Format>,
        index: u32,
    ) -> Result<Format, NodeError> {
        self.table(direction).get(port_id)?.enum_formats(filter, index)
    }

    fn port_set_format(
        &mut self,
        direction: Direction,
        port_id: u32,
        flags: u32,
        format: Option<Format>,
    ) -> NodeResult<()> {
        self.table(direction).get(port_id)?;
        if self.resource.is_none() {
            return Ok(Outcome::Done(()));
        }
        let seq = self.next_seq();
        self.send(&ServerToClient::SetFormat {
            direction: to_wire_direction(direction),
            port_id,
            flags,
            format,
        });
        Ok(Outcome::Async(node_api::AsyncSeq(seq)))
    }

    fn port_get_format(&self, direction: Direction, port_id: u32) -> Result<Format, NodeError> {
        self.table(direction)
            .get(port_id)?
            .format
            .clone()
            .ok_or(NodeError::NoFormat)
    }

    fn port_get_info(&self, direction: Direction, port_id: u32) -> Result<node_api::PortInfo, NodeError> {
        Ok(self.table(direction).get(port_id)?.info.clone())
    }

    fn port_use_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        buffers: Vec<RawBuffer>,
    ) -> NodeResult<()> {
        if buffers.len() > MAX_BUFFERS {
            return Err(NodeError::Error("too many buffers".into()));
        }
        {
            let port = self.table(direction).get(port_id)?;
            if port.format.is_none() {
                return Err(NodeError::NoFormat);
            }
        }

        let mut mirrored = Vec::with_capacity(buffers.len());
        let mut wire_buffers = Vec::with_capacity(buffers.len());

        {
            let port = self.table_mut(direction).get_mut(port_id)?;
            port.clear_buffers();

            for raw in &buffers {
                let shared = raw
                    .metas
                    .iter()
                    .find_map(|m| match m {
                        MetaDescriptor::Shared { fd: _, flags, offset, size } => Some((*flags, *offset, *size)),
                        MetaDescriptor::Other(..) => None,
                    });
                if shared.is_none() {
                    port.clear_buffers();
                    return Err(NodeError::Error("missing shared metadata on buffer".into()));
                }
            }

            let mut wire_metas_all = Vec::new();
            let mut wire_datas_all = Vec::new();

            for raw in buffers {
                let shared_meta = raw.metas.into_iter().find_map(|m| match m {
                    MetaDescriptor::Shared { fd, flags, offset, size } => Some((fd, flags, offset, size)),
                    MetaDescriptor::Other(..) => None,
                });
                let (shared_fd, shared_flags, shared_offset, shared_size) = shared_meta.unwrap();

                let mem_id = port.registered_mem.register(
                    client_rpc::WireDataType::MemFd,
                    Some(shared_fd),
                    shared_flags,
                    shared_offset,
                    shared_size,
                );
                wire_metas_all.push(client_rpc::WireMeta::Shared {
                    mem_id,
                    flags: shared_flags,
                    offset: shared_offset,
                    size: shared_size,
                });

                let mut accumulated_offset = 0u64;
                let mut wire_datas = Vec::with_capacity(raw.datas.len());
                for d in raw.datas {
                    match d.data_type {
                        DataType::DmaBuf | DataType::MemFd => {
                            let wire_type = if d.data_type == DataType::DmaBuf {
                                client_rpc::WireDataType::DmaBuf
                            } else {
                                client_rpc::WireDataType::MemFd
                            };
                            let new_id = port.registered_mem.register(
                                wire_type,
                                d.fd,
                                d.flags,
                                d.map_offset,
                                d.max_size as u64,
                            );
                            wire_datas.push(client_rpc::WireData {
                                data_type: client_rpc::WireDataType::Id,
                                mem_id: new_id,
                                map_offset: 0,
                                max_size: d.max_size,
                                flags: d.flags,
                            });
                        }
                        DataType::MemPtr => {
                            wire_datas.push(client_rpc::WireData {
                                data_type: client_rpc::WireDataType::MemPtr,
                                mem_id: u32::MAX,
                                map_offset: accumulated_offset,
                                max_size: d.max_size,
                                flags: d.flags,
                            });
                            accumulated_offset += d.max_size as u64;
                        }
                        _ => {
                            log::error!("proxy: invalid memory type on buffer data descriptor");
                            wire_datas.push(client_rpc::WireData {
                                data_type: client_rpc::WireDataType::Invalid,
                                mem_id: u32::MAX,
                                map_offset: 0,
                                max_size: 0,
                                flags: 0,
                            });
                        }
                    }
                }

                mirrored.push(ProxyBuffer::new(vec![], vec![], shared_size)?);
                wire_buffers.push(client_rpc::WireBuffer {
                    metas: vec![client_rpc::WireMeta::Shared {
                        mem_id,
                        flags: shared_flags,
                        offset: 0,
                        size: shared_size,
                    }],
                    datas: wire_datas,
                });
            }
        }

        let port = self.table_mut(direction).get_mut(port_id)?;
        port.set_buffers(mirrored);

        if self.resource.is_none() {
            return Ok(Outcome::Done(()));
        }

        let seq = self.next_seq();
        self.send(&ServerToClient::UseBuffers {
            direction: to_wire_direction(direction),
            port_id,
            buffers: wire_buffers,
        });
        Ok(Outcome::Async(node_api::AsyncSeq(seq)))
    }

    fn port_alloc_buffers(
        &mut self,
        direction: Direction,
        port_id: u32,
        _params: Vec<AllocParam>,
    ) -> NodeResult<Vec<RawBuffer>> {
        let port = self.table(direction).get(port_id)?;
        if port.format.is_none() {
            return Err(NodeError::NoFormat);
        }
        Err(NodeError::NotImplemented)
    }

    fn port_set_io(
        &mut self,
        direction: Direction,
        port_id: u32,
        io: Option<node_api::PortIoHandle>,
    ) -> NodeResult<()> {
        self.table_mut(direction).get_mut(port_id)?.set_io(io);
        Ok(Outcome::Done(()))
    }

    fn port_reuse_buffer(&mut self, port_id: u32, buffer_id: u32) -> NodeResult<()> {
        self.out_ports.get(port_id)?;
        self.inject_and_signal(RingDirection::ToClient, Event::ReuseBuffer { port_id, buffer_id });
        if let Some(resource) = &self.resource {
            let _ = resource_signal_to_client(resource);
        }
        Ok(Outcome::Done(()))
    }

    fn process_input(&mut self) -> NodeResult<()> {
        let resource = match &self.resource {
            Some(r) => r,
            None => return Ok(Outcome::Done(())),
        };
        for (index, port) in self.in_ports.ports.iter().enumerate() {
            if port.lifecycle() != PortLifecycle::Buffered {
                continue;
            }
            let io = match &port.io {
                Some(io) => io,
                None => continue,
            };
            if let Some(slot) = resource.transport.input_io(index as u32) {
                slot.copy_from(io);
                io.set_status(node_api::IoStatus::Ok);
            }
        }
        resource.transport.add_event(RingDirection::ToClient, Event::HaveOutput);
        let _ = resource_signal_to_client(resource);
        Ok(Outcome::Done(()))
    }

    fn process_output(&mut self) -> Result<ProcessResult, NodeError> {
        let resource = match &self.resource {
            Some(r) => r,
            None => return Ok(ProcessResult::NoData),
        };
        let mut need_input = false;
        let mut any_event = false;
        for (index, port) in self.out_ports.ports.iter().enumerate() {
            if port.lifecycle() != PortLifecycle::Buffered {
                continue;
            }
            let io = match &port.io {
                Some(io) => io,
                None => continue,
            };
            let slot = match resource.transport.output_io(index as u32) {
                Some(slot) => slot,
                None => continue,
            };
            if io.buffer_id() != node_api::INVALID_BUFFER_ID {
                resource.transport.add_event(
                    RingDirection::ToClient,
                    Event::ReuseBuffer {
                        port_id: index as u32,
                        buffer_id: io.buffer_id(),
                    },
                );
                io.set_buffer_id(node_api::INVALID_BUFFER_ID);
                any_event = true;
            }
            slot.swap_with(io);
            if io.status() == node_api::IoStatus::NeedBuffer {
                need_input = true;
            }
        }
        if need_input {
            resource.transport.add_event(RingDirection::ToClient, Event::NeedInput);
            any_event = true;
        }
        if any_event {
            let _ = resource_signal_to_client(resource);
        }
        Ok(ProcessResult::HaveOutput)
    }
}

fn resource_signal_to_client(resource: &Resource) -> std::io::Result<()> {
    resource.data_fds.signal_client()
}

/// Guards re-entrant use of a `ProxyNode` from both loops; `ClientNode`
/// hands out clones of this to the main-loop scheduler and the data-loop
/// wakeup bridge.
pub type SharedProxy = std::sync::Arc<Mutex<ProxyNode>>;
