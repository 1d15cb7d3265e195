//! Error types for the collector.

use thiserror::Error;

use crate::Space;

/// Recoverable failures surfaced to the embedding runtime.
///
/// Collector protocol violations are not represented here: they abort.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    /// A [`crate::HeapSettings`] field is out of range.
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),

    /// Not even the minimum heap size could be reserved.
    #[error(
        "could not reserve heap: requested {requested} bytes, minimum {minimum} bytes"
    )]
    ReservationFailed { requested: usize, minimum: usize },

    /// Allocation failed even after a full major collection.
    #[error("out of memory: {requested} bytes in {space:?} space")]
    OutOfMemory { space: Space, requested: usize },

    /// The type cannot be used with the requested allocation entry point.
    #[error("invalid type: {0}")]
    InvalidType(&'static str),
}

/// Convenient `Result` alias for fallible heap operations.
pub type HeapResult<T> = Result<T, HeapError>;
