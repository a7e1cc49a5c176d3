//! Support library for the out-of-core collaborators the client-node
//! subsystem consumes but does not define: an event loop abstraction, a
//! lock-free SPSC ring buffer, a type-id interner, and minimal typed
//! data-object (POD) plumbing.
//!
//! None of this crate implements policy; it exists so `client-node` has
//! something concrete to build and test against, the way a real daemon would
//! hand it a loop implementation and a POD library at runtime.

pub mod loop_;
pub mod pod;
pub mod ringbuffer;
pub mod typemap;

pub use loop_::{EventLoop, IoMask, SourceId};
pub use ringbuffer::RingBuffer;
pub use typemap::TypeMap;
