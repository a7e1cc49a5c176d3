//! The generic node contract: the interface a client proxy implements and a
//! scheduler calls, independent of whatever concrete thing sits behind it.

mod error;
mod io;
mod node;

pub use error::{AsyncSeq, NodeError, NodeResult, Outcome};
pub use io::{IoStatus, PortIo, PortIoHandle, INVALID_BUFFER_ID};
pub use node::{
    DataDescriptor, DataType, Direction, MetaDescriptor, Node, NodeCallbacks, NodeCommand,
    NodeEvent, ProcessResult, RawBuffer,
};
