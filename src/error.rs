//! Error types for the co-simulation runtime.
//!
//! The whole crate shares one error enum.  Callback-style components
//! (reactor handlers, future completion handlers, RFSM response handlers)
//! return `Result<(), Error>`; an error returned from a handler propagates
//! out of the reactor's `run()` loop unless an intermediate layer routes it
//! elsewhere (e.g. a chained future's `catch` sink).

use thiserror::Error;

/// Errors that can occur anywhere in the runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// A precondition on an operation input was violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An invalid mutation of the simulation graph was attempted.
    /// The model builder remains usable afterwards.
    #[error("model construction error: {0}")]
    ModelConstruction(String),

    /// A referenced slave or variable does not exist.
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// `set_value` or `set_exception` was called on an already satisfied
    /// promise.
    #[error("promise already satisfied")]
    PromiseAlreadySatisfied,

    /// `get_future` was called more than once on the same promise.
    #[error("future already retrieved")]
    FutureAlreadyRetrieved,

    /// The promise was dropped without being satisfied.
    #[error("broken promise")]
    BrokenPromise,

    /// An expected message or event did not arrive in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A request was issued while another one was still outstanding.
    #[error("busy: a request is already outstanding")]
    Busy,

    /// Malformed frames or an unexpected state tag.  The transport that
    /// produced this is tainted and must be rebuilt.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The wrapped slave instance failed.  Fatal for the affected slave.
    #[error("slave instance broken: {0}")]
    InstanceBroken(String),

    /// A payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("socket error: {0}")]
    Socket(#[from] zmq::Error),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
