//! The client-node subsystem: a server-side object representing a node
//! whose actual processing code lives in a remote client process. Exposes
//! the generic `Node` interface locally, marshals every call to the owning
//! client over a control socket, and runs a realtime data path over a
//! shared-memory transport and a pair of eventfds.

pub mod client_node;
pub mod error;
pub mod memory;
pub mod port;
pub mod proxy;
pub mod signal;
pub mod transport;
pub mod wakeup;

pub use client_node::{ClientNode, Collaborators, Lifecycle, SharedClientNode};
pub use error::Error;
pub use memory::{MemEntry, PortMemory};
pub use port::{Port, PortLifecycle, ProxyBuffer};
pub use proxy::{ProxyNode, Resource, SharedProxy};
pub use signal::{Signal, Subscription};
pub use transport::{DataFds, Event, RingDirection, Transport};
pub use wakeup::WakeupBridge;
