//! End-to-end proxy-node behavior that doesn't need the wakeup bridge or a
//! live data path: port/format negotiation, buffer registration and its
//! shared-metadata requirement, invalid-port rejection, and format-removal
//! teardown. Drives `ProxyNode` directly through the `Node` trait, the way
//! a scheduler would.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use client_node::{DataFds, ProxyNode, Resource, Transport};
use node_api::{DataDescriptor, DataType, Direction, MetaDescriptor, Node, NodeError, RawBuffer};
use spa_support::pod::Format;
use spa_support::EventLoop;

fn unique_socket_path() -> std::path::PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("client-node-scenario-{}-{n}.sock", std::process::id()))
}

fn shared_buffer(size: u64) -> RawBuffer {
    let fd: OwnedFd = rustix::fs::memfd_create("scenario-buffer", rustix::fs::MemfdFlags::empty())
        .unwrap()
        .into();
    RawBuffer {
        metas: vec![MetaDescriptor::Shared {
            fd,
            flags: 0,
            offset: 0,
            size,
        }],
        datas: vec![DataDescriptor {
            data_type: DataType::MemFd,
            fd: None,
            map_offset: 0,
            max_size: size as u32,
            flags: 0,
        }],
    }
}

fn confirm_format(proxy: &mut ProxyNode, direction: Direction, port_id: u32, format: Format) {
    proxy
        .port_update(direction, port_id, client_node::port::CHANGE_FORMAT, vec![], Some(format), None)
        .unwrap();
}

async fn bind_resource(proxy: &mut ProxyNode, loop_: &EventLoop) -> (Arc<Transport>, client_rpc::Connection) {
    let (max_in, max_out, _, _) = proxy.port_capacities_and_counts();
    let path = unique_socket_path();
    let listener = client_rpc::Listener::bind(&path, 4).unwrap();
    let client = client_rpc::Connection::connect(&path).await.unwrap();
    let server = listener.accept().await.unwrap();

    let transport = Arc::new(Transport::new(max_in, max_out).unwrap());
    let data_fds = Arc::new(DataFds::new().unwrap());
    proxy.bind_resource(Resource {
        connection: Arc::new(server),
        transport: transport.clone(),
        data_fds,
        loop_: loop_.clone(),
    });
    let _ = std::fs::remove_file(&path);
    (transport, client)
}

/// Adding a port, negotiating a format, and registering buffers with
/// shared metadata moves the port all the way to `Buffered`.
#[test]
fn port_negotiation_and_buffer_registration() {
    let mut proxy = ProxyNode::new(0, 2);
    proxy.add_port(Direction::Output, 0).unwrap();

    confirm_format(&mut proxy, Direction::Output, 0, Format::new(1, 1));
    assert_eq!(proxy.port_get_format(Direction::Output, 0).unwrap(), Format::new(1, 1));

    let outcome = proxy
        .port_use_buffers(Direction::Output, 0, vec![shared_buffer(4096), shared_buffer(4096)])
        .unwrap();
    assert!(matches!(outcome, node_api::Outcome::Done(())));
}

/// Once a resource and transport are bound, starting the
/// node enqueues a `NeedInput` on the to-client ring. A later
/// `process_output` poll, finding the port's `io` slot holding a buffer
/// the client already consumed, swaps it out (enqueuing `ReuseBuffer`) and,
/// if the swapped-in transport state asked for more, a follow-up
/// `NeedInput`.
#[tokio::test]
async fn start_and_first_frame_drive_the_ring() {
    let loop_ = EventLoop::new("scenario-start").unwrap();
    let mut proxy = ProxyNode::new(0, 1);
    proxy.add_port(Direction::Output, 0).unwrap();
    confirm_format(&mut proxy, Direction::Output, 0, Format::new(1, 1));
    proxy
        .port_use_buffers(Direction::Output, 0, vec![shared_buffer(4096)])
        .unwrap();

    let io = Arc::new(node_api::PortIo::default());
    proxy.port_set_io(Direction::Output, 0, Some(io.clone())).unwrap();

    let (transport, client) = bind_resource(&mut proxy, &loop_).await;

    proxy.send_command(node_api::NodeCommand::Start).unwrap();
    assert_eq!(
        transport.parse_event(client_node::RingDirection::ToClient),
        Some(client_node::Event::NeedInput)
    );

    // The client, writing directly into the shared region, flags the slot
    // as needing a buffer before the proxy gets to poll it.
    let scratch = node_api::PortIo::default();
    scratch.set_status(node_api::IoStatus::NeedBuffer);
    transport.output_io(0).unwrap().copy_from(&scratch);
    io.set_buffer_id(0);

    let result = proxy.process_output().unwrap();
    assert_eq!(result, node_api::ProcessResult::HaveOutput);
    assert_eq!(
        transport.parse_event(client_node::RingDirection::ToClient),
        Some(client_node::Event::ReuseBuffer { port_id: 0, buffer_id: 0 })
    );
    assert_eq!(
        transport.parse_event(client_node::RingDirection::ToClient),
        Some(client_node::Event::NeedInput)
    );

    drop(client);
}

/// A client reusing a buffer it's done with goes out as a
/// `ReuseBuffer` event on the to-client ring.
#[tokio::test]
async fn reuse_buffer_enqueues_ring_event() {
    let loop_ = EventLoop::new("scenario-reuse").unwrap();
    let mut proxy = ProxyNode::new(0, 1);
    proxy.add_port(Direction::Output, 0).unwrap();
    confirm_format(&mut proxy, Direction::Output, 0, Format::new(1, 1));
    proxy
        .port_use_buffers(Direction::Output, 0, vec![shared_buffer(4096)])
        .unwrap();

    let (transport, client) = bind_resource(&mut proxy, &loop_).await;

    proxy.port_reuse_buffer(0, 0).unwrap();
    assert_eq!(
        transport.parse_event(client_node::RingDirection::ToClient),
        Some(client_node::Event::ReuseBuffer { port_id: 0, buffer_id: 0 })
    );

    drop(client);
}

/// A buffer with no `Shared` meta is rejected, and the port is left
/// with no registered buffers.
#[test]
fn buffer_without_shared_metadata_is_rejected() {
    let mut proxy = ProxyNode::new(0, 1);
    proxy.add_port(Direction::Output, 0).unwrap();
    confirm_format(&mut proxy, Direction::Output, 0, Format::new(1, 1));

    let bad = RawBuffer {
        metas: vec![MetaDescriptor::Other(0, vec![])],
        datas: vec![],
    };
    let err = proxy.port_use_buffers(Direction::Output, 0, vec![bad]).unwrap_err();
    assert!(matches!(err, NodeError::Error(_)));
}

/// More buffers than the fixed per-port capacity is rejected outright,
/// before anything is registered against the port.
#[test]
fn buffer_count_over_capacity_is_rejected() {
    let mut proxy = ProxyNode::new(0, 1);
    proxy.add_port(Direction::Output, 0).unwrap();
    confirm_format(&mut proxy, Direction::Output, 0, Format::new(1, 1));

    let too_many: Vec<_> = (0..65).map(|_| shared_buffer(4096)).collect();
    let err = proxy.port_use_buffers(Direction::Output, 0, too_many).unwrap_err();
    assert!(matches!(err, NodeError::Error(_)));
}

/// Raising the declared port capacity through `node_update` admits ports
/// up to the new advisory count without ever needing to resize anything
/// underneath — the backing table was sized to the fixed per-direction
/// maximum from construction.
#[test]
fn raising_declared_capacity_admits_new_ports() {
    let mut proxy = ProxyNode::new(1, 1);
    assert!(matches!(proxy.add_port(Direction::Output, 6), Err(NodeError::InvalidPort)));

    proxy.node_update(client_node::proxy::NODE_CHANGE_MAX_PORTS, 1, 8);
    proxy.add_port(Direction::Output, 6).unwrap();
    confirm_format(&mut proxy, Direction::Output, 6, Format::new(1, 1));
    assert_eq!(proxy.port_get_format(Direction::Output, 6).unwrap(), Format::new(1, 1));
}

/// Every port-scoped operation on an out-of-range or unregistered port
/// id reports `InvalidPort` rather than panicking.
#[test]
fn invalid_port_is_rejected_everywhere() {
    let mut proxy = ProxyNode::new(1, 1);

    assert!(matches!(proxy.add_port(Direction::Output, 5), Err(NodeError::InvalidPort)));
    assert!(matches!(
        proxy.port_get_format(Direction::Output, 0),
        Err(NodeError::NoFormat) | Err(NodeError::InvalidPort)
    ));
    assert!(matches!(
        proxy.port_set_format(Direction::Output, 0, 0, Some(Format::new(1, 1))),
        Err(NodeError::InvalidPort)
    ));
    assert!(matches!(proxy.port_get_info(Direction::Input, 9), Err(NodeError::InvalidPort)));
    assert!(matches!(
        proxy.port_reuse_buffer(9, 0),
        Err(NodeError::InvalidPort)
    ));
}

/// Withdrawing a port's format (an empty reverse-op `port_update`)
/// drops its buffers and returns it to `Configured`, observable through
/// `port_get_format`/`port_use_buffers` now requiring a fresh negotiation.
#[test]
fn format_removal_tears_down_buffers() {
    let mut proxy = ProxyNode::new(0, 1);
    proxy.add_port(Direction::Output, 0).unwrap();
    confirm_format(&mut proxy, Direction::Output, 0, Format::new(1, 1));
    proxy
        .port_use_buffers(Direction::Output, 0, vec![shared_buffer(4096)])
        .unwrap();
    assert!(proxy.port_get_format(Direction::Output, 0).is_ok());

    proxy
        .port_update(Direction::Output, 0, client_node::port::CHANGE_FORMAT, vec![], None, None)
        .unwrap();

    assert!(matches!(
        proxy.port_get_format(Direction::Output, 0),
        Err(NodeError::NoFormat)
    ));
    let err = proxy
        .port_use_buffers(Direction::Output, 0, vec![shared_buffer(4096)])
        .unwrap_err();
    assert!(matches!(err, NodeError::NoFormat));
}
