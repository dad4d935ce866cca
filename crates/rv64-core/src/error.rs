//! Host-observable error surface.
//!
//! Architectural exceptions (misaligned fetch, page fault, illegal instruction, ...)
//! never reach this type: they are caught by [`crate::interp`] and folded into CSR
//! state by [`crate::trap`]. `CoreError` is only for operations the host calls
//! directly — construction, (de)serialization, snapshot I/O, and the state
//! accessors exposed while the machine is paused.
use thiserror::Error;

/// One of the host-facing error surfaces.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad configuration, bad log, bad address.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// CSR address or value out of the domain the operation expects.
    #[error("domain error: {0}")]
    DomainError(String),
    /// Epoch or cycle counter would overflow.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// API misuse, e.g. calling a paused-only accessor while running.
    #[error("logic error: {0}")]
    LogicError(String),
    /// I/O failure, missing file, image-size mismatch.
    #[error("runtime error: {0}")]
    RuntimeError(String),
    /// Unwritable storage, directory collision on snapshot.
    #[error("aborted: {0}")]
    Aborted(String),
    /// Reserved for the RPC layer; this crate never constructs it.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    /// Catch-all for anything that doesn't fit the above.
    #[error("unknown error: {0}")]
    Unknown(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
