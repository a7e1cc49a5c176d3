//! Wire protocol between a proxy node and the remote process that actually
//! implements it: message shapes (`wire`) and the socket/fd-passing
//! mechanics to move them (`transport`).

pub mod transport;
pub mod wire;

pub use transport::{Connection, Error, Listener};
pub use wire::{
    ClientToServer, ServerToClient, WireBuffer, WireData, WireDataType, WireDirection, WireMeta,
    WireNodeCommand, WireNodeState,
};
