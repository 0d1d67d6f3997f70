//! Error types for the configuration-space engine.

use thiserror::Error;

use crate::protocol::NotifyEvent;

/// Failure reported by a [`FrameTransport`](crate::transport::FrameTransport).
///
/// Kept separate from [`TbError`] and `Clone` so it can be stored in a
/// command's terminal state and handed to more than one observer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Ring capacity is exhausted; the submission may succeed later.
    #[error("transport busy")]
    Busy,

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,

    /// Any other submission or registration failure.
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Main error type for all engine operations.
#[derive(Debug, Error)]
pub enum TbError {
    /// No router is attached at the requested route or handle.
    #[error("router not found")]
    NotFound,

    /// The route is malformed or out of range for the parent router.
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// The parent's adapter slot is already occupied.
    #[error("router already exists")]
    AlreadyExists,

    /// The router still has queued or inflight commands.
    #[error("router has outstanding commands")]
    Busy,

    /// No response arrived within the retry budget.
    #[error("command timed out")]
    Timeout,

    /// An asynchronous notification interrupted the transaction. The data
    /// returned with it (if any) is unreliable and has been discarded.
    #[error("invalid operation: asynchronous {0} event")]
    AsyncEvent(NotifyEvent),

    /// A transport frame or command object could not be allocated.
    #[error("resources exhausted")]
    ResourceExhausted,

    /// Malformed packet, register contents, or capability chain.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Caller-supplied addressing is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The router is in its low-power state and does not accept commands.
    #[error("router is suspended")]
    Suspended,

    /// The transport rejected a submission.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration document could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result type alias using [`TbError`].
pub type Result<T> = std::result::Result<T, TbError>;
