//! Result plumbing shared by every `Node` operation. Most operations either
//! complete synchronously or return `async(seq)` for the caller to
//! correlate against a later `async_complete`; that's a successful outcome,
//! not a failure, so it lives in `Outcome<T>` rather than as an error
//! variant.

/// A sequence number handed out for an operation that will complete later.
/// The caller correlates it against the `seq` echoed back on
/// `async_complete`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsyncSeq(pub u32);

/// The two legal shapes of a successful `Node` call: it either finished
/// immediately with `T`, or it's still in flight under `seq`.
#[derive(Debug)]
pub enum Outcome<T> {
    Done(T),
    Async(AsyncSeq),
}

impl<T> Outcome<T> {
    pub fn done(self) -> Option<T> {
        match self {
            Outcome::Done(v) => Some(v),
            Outcome::Async(_) => None,
        }
    }
}

pub type NodeResult<T> = Result<Outcome<T>, NodeError>;

/// The error taxonomy surfaced by `Node` operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    InvalidArgs,
    InvalidPort,
    NoFormat,
    NotImplemented,
    NoPermission,
    /// A format enumeration walked past the last candidate.
    EnumEnd,
    Error(String),
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
