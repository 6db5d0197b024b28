//! Error taxonomy for the device core.
//!
//! Malformed packets are never reported through this type; they are flagged
//! `DROPPED` on the buffer and surface only through device statistics. The
//! variants here cover structural failures and lookup misses.

use thiserror::Error;

/// Errors returned by buffer, cache and fragment operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Zero-sized operation, empty source or malformed address.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A zone allocation request above [`crate::buffer::MAX_ZONE_SIZE`].
    #[error("resource exhausted")]
    ResourceExhausted,

    /// An event wait elapsed without a wake (see
    /// [`crate::stack::Stack::wait_for_work`]). Resolution timeouts are
    /// not errors; they surface as drop counters.
    #[error("timed out")]
    Timeout,

    /// The key is already present: a resolution under way for the same
    /// address, or a listener registered for the same protocol id.
    #[error("already in progress")]
    AlreadyInProgress,

    /// Cache entry, listener or fragment bucket lookup miss.
    #[error("not found")]
    NotFound,
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
