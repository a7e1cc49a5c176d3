//! `ClientNode`: the entity tying the transport (C1), port state (C3),
//! proxy node (C4), and wakeup bridge (C5) together, and driving the
//! control-channel dispatch loop that turns incoming reverse operations
//! into calls on the proxy.

use std::sync::{Arc, Mutex, Weak};

use client_rpc::{ClientToServer, Connection, ServerToClient};
use node_api::Direction;
use spa_support::EventLoop;

use crate::port::MAX_PORTS;
use crate::proxy::{ProxyNode, Resource, SharedProxy};
use crate::signal::{Signal, Subscription};
use crate::transport::{DataFds, Transport};
use crate::wakeup::WakeupBridge;

fn from_wire_direction(d: client_rpc::WireDirection) -> Direction {
    match d {
        client_rpc::WireDirection::Input => Direction::Input,
        client_rpc::WireDirection::Output => Direction::Output,
    }
}

/// `ClientNode`'s own lifecycle, distinct from the remote node's run state
/// (`WireNodeState`) reported over the wire. `Resourced` can be reached
/// before `Initialised` — a resource bound early just defers the
/// `transport` notification until both have happened.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    New,
    Initialised,
    Resourced,
    Destroying,
    Freed,
}

/// The four collaborator signals `ClientNode` subscribes to on construction
/// and drops on destruction. The collaborators themselves (the generic
/// Node, the loop, the core) are out of core here, so this is just the
/// capability surface a real owner would wire up.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub node_free: Signal<()>,
    pub node_initialized: Signal<()>,
    pub loop_changed: Signal<()>,
    pub core_global_added: Signal<()>,
}

struct Subscriptions {
    node_free: Subscription<()>,
    node_initialized: Subscription<()>,
    loop_changed: Subscription<()>,
    core_global_added: Subscription<()>,
}

pub struct ClientNode {
    proxy: SharedProxy,
    main_loop: EventLoop,
    data_loop: EventLoop,
    transport: Option<Arc<Transport>>,
    data_fds: Option<Arc<DataFds>>,
    pending_connection: Option<Arc<Connection>>,
    wakeup: Option<WakeupBridge>,
    initialised: bool,
    resourced: bool,
    destroying: bool,
    freed: bool,
    destroy_signal: Signal<()>,
    subs: Option<Subscriptions>,
    weak_self: Weak<Mutex<ClientNode>>,
}

pub type SharedClientNode = Arc<Mutex<ClientNode>>;

impl ClientNode {
    /// Builds a new `ClientNode` in `New` state and subscribes it to the
    /// four collaborator signals.
    pub fn new(
        main_loop: EventLoop,
        data_loop: EventLoop,
        max_input_ports: u32,
        max_output_ports: u32,
        collaborators: &Collaborators,
    ) -> SharedClientNode {
        let node = Arc::new_cyclic(|weak_self| {
            Mutex::new(ClientNode {
                proxy: Arc::new(Mutex::new(ProxyNode::new(
                    max_input_ports.min(MAX_PORTS),
                    max_output_ports.min(MAX_PORTS),
                ))),
                main_loop,
                data_loop,
                transport: None,
                data_fds: None,
                pending_connection: None,
                wakeup: None,
                initialised: false,
                resourced: false,
                destroying: false,
                freed: false,
                destroy_signal: Signal::new(),
                subs: None,
                weak_self: weak_self.clone(),
            })
        });

        let subs = Subscriptions {
            node_initialized: {
                let weak = Arc::downgrade(&node);
                collaborators.node_initialized.subscribe(move |_| {
                    if let Some(node) = weak.upgrade() {
                        node.lock().unwrap().handle_node_initialized();
                    }
                })
            },
            node_free: {
                let weak = Arc::downgrade(&node);
                collaborators.node_free.subscribe(move |_| {
                    if let Some(node) = weak.upgrade() {
                        node.lock().unwrap().begin_destroy("node free");
                    }
                })
            },
            loop_changed: {
                let weak = Arc::downgrade(&node);
                collaborators.loop_changed.subscribe(move |_| {
                    if weak.upgrade().is_some() {
                        log::debug!("client-node: loop-changed signal observed");
                    }
                })
            },
            core_global_added: {
                let weak = Arc::downgrade(&node);
                collaborators.core_global_added.subscribe(move |_| {
                    if weak.upgrade().is_some() {
                        log::debug!("client-node: core-global-added signal observed");
                    }
                })
            },
        };
        node.lock().unwrap().subs = Some(subs);
        node
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.freed {
            Lifecycle::Freed
        } else if self.destroying {
            Lifecycle::Destroying
        } else if self.resourced {
            Lifecycle::Resourced
        } else if self.initialised {
            Lifecycle::Initialised
        } else {
            Lifecycle::New
        }
    }

    pub fn proxy(&self) -> SharedProxy {
        self.proxy.clone()
    }

    /// Subscribes to this node's own `destroy` signal, fired once on entry
    /// to `Destroying`.
    pub fn subscribe_destroy(&self, cb: impl FnMut(&()) + Send + 'static) -> Subscription<()> {
        self.destroy_signal.subscribe(cb)
    }

    /// Fires on the generic Node's `initialized` signal: allocates the
    /// transport sized to the node's declared port capacities, stamps
    /// current port counts into its header, installs the wakeup bridge,
    /// and — if a resource is already bound — sends the `transport`
    /// notification immediately.
    fn handle_node_initialized(&mut self) {
        if self.initialised || self.destroying {
            return;
        }
        self.initialised = true;

        let (max_in, max_out, n_in, n_out) = self.proxy.lock().unwrap().port_capacities_and_counts();

        let mut transport = match Transport::new(max_in, max_out) {
            Ok(t) => t,
            Err(err) => {
                log::error!("client-node: failed to allocate transport: {err}");
                return;
            }
        };
        transport.set_port_counts(n_in, n_out);
        let transport = Arc::new(transport);

        let data_fds = match DataFds::new() {
            Ok(d) => Arc::new(d),
            Err(err) => {
                log::error!("client-node: failed to allocate data fds: {err}");
                return;
            }
        };

        match data_fds.from_client.try_clone() {
            Ok(fd) => {
                let proxy = self.proxy.clone();
                let weak = self.weak_self.clone();
                match WakeupBridge::install(&self.data_loop, fd, proxy, move || {
                    if let Some(node) = weak.upgrade() {
                        node.lock().unwrap().begin_destroy("data fd error");
                    }
                }) {
                    Ok(bridge) => self.wakeup = Some(bridge),
                    Err(err) => log::error!("client-node: failed to install wakeup bridge: {err}"),
                }
            }
            Err(err) => log::error!("client-node: failed to duplicate wakeup fd: {err}"),
        }

        self.transport = Some(transport);
        self.data_fds = Some(data_fds);
        self.try_complete_resource();
    }

    /// Binds a control-channel connection, entering `Resourced`. Permitted
    /// before `Initialised`; completion (binding the proxy's resource and
    /// sending the `transport` notification) is deferred until the
    /// transport has also been allocated.
    pub fn bind_resource(&mut self, connection: Connection) {
        if self.destroying {
            return;
        }
        self.resourced = true;
        let connection = Arc::new(connection);
        self.pending_connection = Some(connection.clone());
        self.try_complete_resource();
        self.spawn_dispatch_loop(connection);
    }

    fn try_complete_resource(&mut self) {
        if !self.resourced {
            return;
        }
        let (transport, data_fds, connection) =
            match (&self.transport, &self.data_fds, &self.pending_connection) {
                (Some(t), Some(d), Some(c)) => (t.clone(), d.clone(), c.clone()),
                _ => return,
            };
        {
            let mut proxy = self.proxy.lock().unwrap();
            if proxy.resource().is_some() {
                return;
            }
            proxy.bind_resource(Resource {
                connection,
                transport: transport.clone(),
                data_fds,
                loop_: self.main_loop.clone(),
            });
        }
        self.notify_transport(&transport);
    }

    fn notify_transport(&self, transport: &Transport) {
        let fd = match transport.dup_memfd() {
            Ok(fd) => fd,
            Err(err) => {
                log::error!("client-node: failed to duplicate transport memfd: {err}");
                return;
            }
        };
        let size = transport.size();
        let connection = match self.proxy.lock().unwrap().resource() {
            Some(r) => r.connection.clone(),
            None => return,
        };
        self.main_loop.spawn(async move {
            if let Err(err) = connection
                .send_with_fds(&ServerToClient::Transport { offset: 0, size }, &[fd])
                .await
            {
                log::warn!("client-node: failed to send transport notification: {err}");
            }
        });
    }

    /// Drives the control channel: every reverse op received is applied to
    /// the proxy; a closed/errored connection begins the destroy cascade,
    /// mirroring resource-destroy observed through the RPC layer.
    fn spawn_dispatch_loop(&self, connection: Arc<Connection>) {
        let proxy = self.proxy.clone();
        let weak = self.weak_self.clone();
        self.main_loop.spawn(async move {
            loop {
                match connection.recv::<ClientToServer>().await {
                    Ok((ClientToServer::Destroy, _fds)) => {
                        log::info!("client-node: client requested destroy");
                        if let Some(node) = weak.upgrade() {
                            node.lock().unwrap().begin_destroy("client requested destroy");
                        }
                        break;
                    }
                    Ok((msg, _fds)) => dispatch_reverse_op(&proxy, msg),
                    Err(err) => {
                        log::warn!("client-node: control channel closed: {err}");
                        if let Some(node) = weak.upgrade() {
                            node.lock().unwrap().begin_destroy("resource destroyed");
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Explicit destroy entry point; behaves identically to any other
    /// trigger (resource loss, node-free signal, data-fd error) thanks to
    /// the idempotence guard in `begin_destroy`.
    pub fn destroy(&mut self) {
        self.begin_destroy("explicit destroy");
    }

    /// Cascades through the teardown described for `Destroying`: nulls the
    /// resource first (so nothing re-enters client notification code from a
    /// destroy triggered by resource loss), emits `destroy`, detaches the
    /// data source, unsubscribes from collaborator signals, releases port
    /// state, and drops the transport and retained data fds. Idempotent —
    /// a second call after the first is a no-op.
    fn begin_destroy(&mut self, reason: &'static str) {
        if self.destroying || self.freed {
            return;
        }
        self.destroying = true;
        log::info!("client-node: destroying ({reason})");

        {
            let mut proxy = self.proxy.lock().unwrap();
            proxy.take_resource();
            proxy.uninit_all_ports();
        }

        self.destroy_signal.emit(&());

        self.wakeup = None;
        self.subs = None;
        self.transport = None;
        self.data_fds = None;
        self.pending_connection = None;

        self.freed = true;
    }
}

impl Drop for ClientNode {
    fn drop(&mut self) {
        self.begin_destroy("client-node dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_socket_path() -> std::path::PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("client-node-test-{}-{n}.sock", std::process::id()))
    }

    fn loops() -> (EventLoop, EventLoop) {
        (
            EventLoop::new("test-main").unwrap(),
            EventLoop::new("test-data").unwrap(),
        )
    }

    #[test]
    fn starts_in_new_lifecycle() {
        let (main_loop, data_loop) = loops();
        let collaborators = Collaborators::default();
        let node = ClientNode::new(main_loop, data_loop, 4, 4, &collaborators);
        assert_eq!(node.lock().unwrap().lifecycle(), Lifecycle::New);
    }

    #[test]
    fn node_initialized_signal_allocates_transport_and_wakeup() {
        let (main_loop, data_loop) = loops();
        let collaborators = Collaborators::default();
        let node = ClientNode::new(main_loop, data_loop, 2, 2, &collaborators);

        collaborators.node_initialized.emit(&());

        let guard = node.lock().unwrap();
        assert_eq!(guard.lifecycle(), Lifecycle::Initialised);
        assert!(guard.transport.is_some());
        assert!(guard.wakeup.is_some());
    }

    #[tokio::test]
    async fn resourced_before_initialised_defers_completion() {
        let (main_loop, data_loop) = loops();
        let collaborators = Collaborators::default();
        let node = ClientNode::new(main_loop, data_loop, 2, 2, &collaborators);

        let path = unique_socket_path();
        let listener = client_rpc::Listener::bind(&path, 4).unwrap();
        let client = client_rpc::Connection::connect(&path).await.unwrap();
        let server = listener.accept().await.unwrap();

        node.lock().unwrap().bind_resource(server);
        {
            let guard = node.lock().unwrap();
            assert_eq!(guard.lifecycle(), Lifecycle::Resourced);
            assert!(guard.proxy().lock().unwrap().resource().is_none());
        }

        collaborators.node_initialized.emit(&());
        {
            let guard = node.lock().unwrap();
            assert!(guard.proxy().lock().unwrap().resource().is_some());
        }

        drop(client);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn destroy_is_idempotent() {
        let (main_loop, data_loop) = loops();
        let collaborators = Collaborators::default();
        let node = ClientNode::new(main_loop, data_loop, 2, 2, &collaborators);
        collaborators.node_initialized.emit(&());

        node.lock().unwrap().destroy();
        assert_eq!(node.lock().unwrap().lifecycle(), Lifecycle::Freed);
        node.lock().unwrap().destroy();
        assert_eq!(node.lock().unwrap().lifecycle(), Lifecycle::Freed);
    }

    #[test]
    fn node_free_signal_begins_destroy() {
        let (main_loop, data_loop) = loops();
        let collaborators = Collaborators::default();
        let node = ClientNode::new(main_loop, data_loop, 2, 2, &collaborators);

        collaborators.node_free.emit(&());

        assert_eq!(node.lock().unwrap().lifecycle(), Lifecycle::Freed);
    }

    #[test]
    fn destroy_signal_fires_once() {
        let (main_loop, data_loop) = loops();
        let collaborators = Collaborators::default();
        let node = ClientNode::new(main_loop, data_loop, 2, 2, &collaborators);

        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let count2 = count.clone();
        let _sub = node.lock().unwrap().subscribe_destroy(move |_| {
            count2.fetch_add(1, Ordering::Relaxed);
        });

        node.lock().unwrap().destroy();
        node.lock().unwrap().destroy();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}

fn dispatch_reverse_op(proxy: &SharedProxy, msg: ClientToServer) {
    let mut proxy = proxy.lock().unwrap();
    match msg {
        ClientToServer::NodeUpdate {
            change_mask,
            max_input_ports,
            max_output_ports,
        } => {
            proxy.node_update(change_mask, max_input_ports, max_output_ports);
        }
        ClientToServer::PortUpdate {
            direction,
            port_id,
            change_mask,
            possible_formats,
            format,
            info,
        } => {
            let direction = from_wire_direction(direction);
            if let Err(err) = proxy.port_update(direction, port_id, change_mask, possible_formats, format, info) {
                log::warn!("client-node: port_update rejected: {err}");
            }
        }
        ClientToServer::NodeStateChange { state } => proxy.node_state_change(state),
        ClientToServer::Event { payload } => proxy.client_event(payload),
        ClientToServer::Destroy => {
            // Handled by the caller, which has access to the owning node;
            // this function only ever sees reverse ops applied to the proxy.
        }
    }
}
