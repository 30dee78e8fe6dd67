//! Error types for the zone allocator core.
//!
//! Every fallible operation in the crate returns [`ZbdError`]. The taxonomy
//! is deliberately small and matchable: callers route on the kind (a full
//! device is handled very differently from a torn busy flag), and the
//! deferred-error latch on the device needs to store a cloned copy of the
//! first failure it sees. Backend transports speak `std::io::Error`; the
//! core maps those into [`ZbdError::Io`] at the boundary so the errno text
//! survives into logs and latched status.

use thiserror::Error;

/// Result type alias using the crate error type.
pub type Result<T> = std::result::Result<T, ZbdError>;

/// Errors surfaced by the zoned block device core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZbdError {
    /// No meta or IO zone can satisfy the request, or an append exceeds the
    /// remaining capacity of its zone.
    #[error("no space: {0}")]
    NoSpace(String),

    /// A backend call failed. Carries the errno text of the underlying
    /// operation.
    #[error("io error: {0}")]
    Io(String),

    /// The caller asked for something the device cannot express, such as a
    /// non-exclusive write open or a lifetime outside the configured
    /// classes.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing device is unusable for this crate, e.g. it exposes fewer
    /// zones than the minimum the allocator needs.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An internal invariant was violated. The busy-flag lease protocol is
    /// the usual source; callers must treat this as fatal.
    #[error("corruption: {0}")]
    Corruption(String),
}

impl From<std::io::Error> for ZbdError {
    fn from(err: std::io::Error) -> Self {
        ZbdError::Io(err.to_string())
    }
}
