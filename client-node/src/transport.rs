//! Transport ring (C1): one memfd-backed shared-memory region published to
//! the client once, holding a header, two per-direction event rings, and two
//! arrays of per-port `io` slots.
//!
//! Layout is computed by hand rather than derived with `#[repr(C)]` on a
//! single struct, since the port `io` arrays are sized at runtime from the
//! node's declared port capacities. Every accessor hands back a reference
//! computed from a raw offset into the mapping; that's the unavoidable cost
//! of describing memory two unrelated processes both touch concurrently —
//! the byte layout has to be a contract, not a Rust type.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;
use rustix::fs::{fcntl_add_seals, ftruncate, memfd_create, MemfdFlags, SealFlags};

use node_api::PortIo;
use spa_support::ringbuffer::RingBuffer;

use crate::error::Error;

const PAGE_SIZE: u64 = 4096;

/// One ring slot: a 4-byte type tag followed by up to 8 bytes of payload,
/// padded to 16 bytes. Sized to the largest event variant (`ReuseBuffer`,
/// two `u32`s).
const EVENT_SLOT_SIZE: usize = 16;
/// Ring depth; kept generous since it's cheap and avoids the producer ever
/// blocking on a stalled peer.
const EVENT_RING_SLOTS: usize = 16;
const EVENT_RING_DATA_BYTES: usize = EVENT_SLOT_SIZE * EVENT_RING_SLOTS;
const RING_HEADER_BYTES: usize = std::mem::size_of::<RingBuffer>();
const PORTIO_BYTES: usize = std::mem::size_of::<TransportPortIo>();

const EVENT_TYPE_NEED_INPUT: u32 = 1;
const EVENT_TYPE_HAVE_OUTPUT: u32 = 2;
const EVENT_TYPE_REUSE_BUFFER: u32 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    NeedInput,
    HaveOutput,
    ReuseBuffer { port_id: u32, buffer_id: u32 },
}

impl Event {
    fn encode(self) -> [u8; EVENT_SLOT_SIZE] {
        let mut slot = [0u8; EVENT_SLOT_SIZE];
        match self {
            Event::NeedInput => slot[0..4].copy_from_slice(&EVENT_TYPE_NEED_INPUT.to_ne_bytes()),
            Event::HaveOutput => slot[0..4].copy_from_slice(&EVENT_TYPE_HAVE_OUTPUT.to_ne_bytes()),
            Event::ReuseBuffer { port_id, buffer_id } => {
                slot[0..4].copy_from_slice(&EVENT_TYPE_REUSE_BUFFER.to_ne_bytes());
                slot[4..8].copy_from_slice(&port_id.to_ne_bytes());
                slot[8..12].copy_from_slice(&buffer_id.to_ne_bytes());
            }
        }
        slot
    }

    fn decode(slot: &[u8; EVENT_SLOT_SIZE]) -> Option<Event> {
        let ty = u32::from_ne_bytes(slot[0..4].try_into().unwrap());
        match ty {
            EVENT_TYPE_NEED_INPUT => Some(Event::NeedInput),
            EVENT_TYPE_HAVE_OUTPUT => Some(Event::HaveOutput),
            EVENT_TYPE_REUSE_BUFFER => Some(Event::ReuseBuffer {
                port_id: u32::from_ne_bytes(slot[4..8].try_into().unwrap()),
                buffer_id: u32::from_ne_bytes(slot[8..12].try_into().unwrap()),
            }),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RingDirection {
    /// Proxy -> client: `NeedInput`/`ReuseBuffer` requests driven by
    /// `process_output`/`port_reuse_buffer`/`send_command(Start)`.
    ToClient,
    /// Client -> proxy: the remote node's own `HaveOutput`/`NeedInput`/
    /// `ReuseBuffer` reports, drained by the wakeup bridge.
    FromClient,
}

/// A port `io` slot as it lives inside the shared region: the same four
/// fields as `node_api::PortIo`, laid out `#[repr(C)]` so both processes
/// agree on the bytes.
#[repr(C)]
#[derive(Default)]
pub struct TransportPortIo {
    status: AtomicU32,
    buffer_id: AtomicU32,
    range_offset: AtomicU32,
    range_size: AtomicU32,
}

impl TransportPortIo {
    fn snapshot(&self) -> (u32, u32, u32, u32) {
        (
            self.status.load(Ordering::Acquire),
            self.buffer_id.load(Ordering::Acquire),
            self.range_offset.load(Ordering::Acquire),
            self.range_size.load(Ordering::Acquire),
        )
    }

    fn store(&self, status: u32, buffer_id: u32, range_offset: u32, range_size: u32) {
        self.status.store(status, Ordering::Release);
        self.buffer_id.store(buffer_id, Ordering::Release);
        self.range_offset.store(range_offset, Ordering::Release);
        self.range_size.store(range_size, Ordering::Release);
    }

    pub fn copy_from(&self, io: &PortIo) {
        let (off, size) = io.range();
        self.store(io.status().as_u32(), io.buffer_id(), off, size);
    }

    pub fn copy_to(&self, io: &PortIo) {
        let (status, buffer_id, off, size) = self.snapshot();
        io.set_status(node_api::IoStatus::from_u32(status));
        io.set_buffer_id(buffer_id);
        io.set_range(off, size);
    }

    /// After the swap, `io` holds what the transport held just before the
    /// call, and the transport holds what `io` held just before the call.
    pub fn swap_with(&self, io: &PortIo) {
        let transport_before = self.snapshot();
        let (io_off, io_size) = io.range();
        let io_before = (io.status().as_u32(), io.buffer_id(), io_off, io_size);
        io.set_status(node_api::IoStatus::from_u32(transport_before.0));
        io.set_buffer_id(transport_before.1);
        io.set_range(transport_before.2, transport_before.3);
        self.store(io_before.0, io_before.1, io_before.2, io_before.3);
    }

    pub fn buffer_id(&self) -> u32 {
        self.buffer_id.load(Ordering::Acquire)
    }

    pub fn clear_buffer_id(&self) {
        self.buffer_id.store(node_api::INVALID_BUFFER_ID, Ordering::Release);
    }
}

struct Layout {
    to_client_ring: usize,
    from_client_ring: usize,
    input_io: usize,
    output_io: usize,
    total: u64,
}

fn layout(max_input_ports: u32, max_output_ports: u32) -> Layout {
    let ring_bytes = RING_HEADER_BYTES + EVENT_RING_DATA_BYTES;
    let header_bytes = 8; // n_inputs: u32, n_outputs: u32
    let to_client_ring = header_bytes;
    let from_client_ring = to_client_ring + ring_bytes;
    let input_io = from_client_ring + ring_bytes;
    let output_io = input_io + PORTIO_BYTES * max_input_ports as usize;
    let end = output_io + PORTIO_BYTES * max_output_ports as usize;
    Layout {
        to_client_ring,
        from_client_ring,
        input_io,
        output_io,
        total: round_up_to_page(end as u64),
    }
}

fn round_up_to_page(n: u64) -> u64 {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// The shared-memory transport region, plus the eventfd pair used to wake
/// each side (a dedicated eventfd per direction rather than a socketpair).
pub struct Transport {
    mmap: MmapMut,
    memfd: OwnedFd,
    layout: Layout,
    max_input_ports: u32,
    max_output_ports: u32,
}

impl Transport {
    pub fn new(max_input_ports: u32, max_output_ports: u32) -> Result<Self, Error> {
        let layout = layout(max_input_ports, max_output_ports);

        let memfd = memfd_create(
            "client-node-transport",
            MemfdFlags::ALLOW_SEALING | MemfdFlags::CLOEXEC,
        )?;
        ftruncate(&memfd, layout.total)?;

        let mut mmap = unsafe { MmapMut::map_mut(&memfd)? };

        // SAFETY: `to_client_ring`/`from_client_ring` point at freshly
        // zeroed, correctly aligned, `ring_bytes`-sized regions reserved by
        // `layout()` for exactly this purpose; nothing else reads them until
        // this write completes.
        unsafe {
            write_ring_header(&mut mmap, layout.to_client_ring, EVENT_RING_DATA_BYTES as u32)?;
            write_ring_header(&mut mmap, layout.from_client_ring, EVENT_RING_DATA_BYTES as u32)?;
        }

        fcntl_add_seals(&memfd, SealFlags::SHRINK | SealFlags::GROW)?;
        fcntl_add_seals(&memfd, SealFlags::SEAL)?;

        let transport = Self {
            mmap,
            memfd,
            layout,
            max_input_ports,
            max_output_ports,
        };

        // `ftruncate` zero-fills the region, which leaves every `buffer_id`
        // at 0 — a valid id, not the "no buffer" sentinel. Stamp the real
        // sentinel into every slot before anyone can observe a zeroed one.
        for port_id in 0..max_input_ports {
            transport.input_io(port_id).unwrap().clear_buffer_id();
        }
        for port_id in 0..max_output_ports {
            transport.output_io(port_id).unwrap().clear_buffer_id();
        }

        Ok(transport)
    }

    pub fn set_port_counts(&mut self, n_inputs: u32, n_outputs: u32) {
        self.mmap[0..4].copy_from_slice(&n_inputs.to_ne_bytes());
        self.mmap[4..8].copy_from_slice(&n_outputs.to_ne_bytes());
    }

    pub fn memfd(&self) -> BorrowedFd {
        self.memfd.as_fd()
    }

    /// A fresh fd for the same memfd, for handing to the client; the
    /// transport keeps its own fd open regardless of what the client does
    /// with its copy.
    pub fn dup_memfd(&self) -> std::io::Result<OwnedFd> {
        self.memfd.try_clone()
    }

    pub fn size(&self) -> u64 {
        self.layout.total
    }

    fn ring_offset(&self, dir: RingDirection) -> usize {
        match dir {
            RingDirection::ToClient => self.layout.to_client_ring,
            RingDirection::FromClient => self.layout.from_client_ring,
        }
    }

    fn ring(&self, dir: RingDirection) -> &RingBuffer {
        let offset = self.ring_offset(dir);
        // SAFETY: a `RingBuffer` was written at `offset` by `new` and never
        // moved or reinterpreted since.
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const RingBuffer) }
    }

    fn ring_data(&self, dir: RingDirection) -> &mut [u8] {
        let offset = self.ring_offset(dir) + RING_HEADER_BYTES;
        // SAFETY: disjoint from every other accessor's region; the ring's
        // own read/write index discipline is what keeps concurrent
        // producer/consumer access to these bytes race-free.
        unsafe {
            std::slice::from_raw_parts_mut(self.mmap.as_ptr().add(offset) as *mut u8, EVENT_RING_DATA_BYTES)
        }
    }

    /// Copies `event` into the ring and advances the write index with
    /// release ordering.
    pub fn add_event(&self, dir: RingDirection, event: Event) {
        let ring = self.ring(dir);
        let (widx, _) = ring.write_index();
        let data = self.ring_data(dir);
        ring.write_data(data, widx, &event.encode());
        ring.write_update(widx.wrapping_add(EVENT_SLOT_SIZE as u32));
    }

    /// `next_event`: true iff at least one full slot is available to parse.
    pub fn next_event(&self, dir: RingDirection) -> bool {
        let (_, avail) = self.ring(dir).read_index();
        avail >= EVENT_SLOT_SIZE as i32
    }

    /// `parse_event`: copies the next slot out and advances the read index
    /// with release ordering. `None` if the ring was empty or held an
    /// unrecognized type tag (logged and skipped by the caller).
    pub fn parse_event(&self, dir: RingDirection) -> Option<Event> {
        if !self.next_event(dir) {
            return None;
        }
        let ring = self.ring(dir);
        let (ridx, _) = ring.read_index();
        let mut slot = [0u8; EVENT_SLOT_SIZE];
        ring.read_data(self.ring_data(dir), ridx, &mut slot);
        ring.read_update(ridx.wrapping_add(EVENT_SLOT_SIZE as u32));
        Event::decode(&slot)
    }

    pub fn input_io(&self, port_id: u32) -> Option<&TransportPortIo> {
        if port_id >= self.max_input_ports {
            return None;
        }
        let offset = self.layout.input_io + port_id as usize * PORTIO_BYTES;
        // SAFETY: within the reserved input-io array; slots are
        // zero-initialized by `ftruncate` and never moved.
        Some(unsafe { &*(self.mmap.as_ptr().add(offset) as *const TransportPortIo) })
    }

    pub fn output_io(&self, port_id: u32) -> Option<&TransportPortIo> {
        if port_id >= self.max_output_ports {
            return None;
        }
        let offset = self.layout.output_io + port_id as usize * PORTIO_BYTES;
        Some(unsafe { &*(self.mmap.as_ptr().add(offset) as *const TransportPortIo) })
    }
}

unsafe fn write_ring_header(mmap: &mut MmapMut, offset: usize, data_bytes: u32) -> Result<(), Error> {
    let ring = RingBuffer::new(data_bytes)?;
    let ptr = mmap.as_mut_ptr().add(offset) as *mut RingBuffer;
    ptr.write(ring);
    Ok(())
}

/// The wakeup fd pair: one eventfd the proxy signals to wake the client, one
/// the client signals to wake the proxy's wakeup bridge.
pub struct DataFds {
    pub to_client: OwnedFd,
    pub from_client: OwnedFd,
}

impl DataFds {
    pub fn new() -> Result<Self, Error> {
        use rustix::event::{eventfd, EventfdFlags};
        Ok(Self {
            to_client: eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?,
            from_client: eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?,
        })
    }

    /// Writes the 8-byte wakeup token to the peer's fd after every event
    /// enqueued.
    pub fn signal_client(&self) -> std::io::Result<()> {
        write_token(&self.to_client)
    }

    pub fn client_dup_to_client(&self) -> std::io::Result<OwnedFd> {
        self.to_client.try_clone()
    }

    pub fn client_dup_from_client(&self) -> std::io::Result<OwnedFd> {
        self.from_client.try_clone()
    }
}

fn write_token(fd: &OwnedFd) -> std::io::Result<()> {
    let token: u64 = 1;
    rustix::io::write(fd, &token.to_ne_bytes())?;
    Ok(())
}
