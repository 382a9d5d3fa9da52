//! # Batch - buffers exchanged between pipeline stages
//!
//! A [`NodeStateEntryBatch`] is a fixed-capacity byte arena of
//! length-prefixed records plus one [`entry::SortKey`] per record. Batches
//! are allocated once by the [`BufferPool`] and then circulate:
//!
//! ```text
//!            acquire_empty()                 submit_full()
//!  ┌────────────┐  ───────────▶  TRANSFORM  ───────────▶  ┌────────────┐
//!  │   EMPTY    │                 WORKERS                 │    FULL    │
//!  │   queue    │                                         │   queue    │
//!  └────────────┘  ◀───────────    SORT    ◀───────────   └────────────┘
//!                    release()     STAGE     next_full()
//! ```
//!
//! Both queues are bounded by the buffer count, so a slow sort stage stalls
//! the transform workers instead of letting memory grow. A batch is always
//! *moved* through a queue: it has exactly one owner at any time.
//!
//! Every blocking operation also waits on a [`CancellationToken`]; cancelling
//! the token wakes all blocked threads.

mod arena;
mod cancel;
mod pool;

use entry::EntryError;
use thiserror::Error;

pub use arena::NodeStateEntryBatch;
pub use cancel::CancellationToken;
pub use pool::{BufferPool, SortSide, TransformSide};

/// Errors raised by a [`NodeStateEntryBatch`].
#[derive(Debug, Error)]
pub enum BatchError {
    /// The batch cannot take this record; the caller must roll over.
    #[error("batch full: {entries} entries, {remaining} bytes left, {needed} bytes needed")]
    Full {
        entries: usize,
        remaining: usize,
        needed: usize,
    },

    /// The record does not fit even into an empty batch.
    #[error("record of {needed} bytes exceeds batch capacity of {capacity} bytes")]
    EntryTooLarge { needed: usize, capacity: usize },

    /// A sort key points outside the written region or at a torn record.
    #[error("invalid record offset {0}")]
    BadOffset(u32),

    #[error(transparent)]
    Entry(#[from] EntryError),
}

/// Errors raised by blocking [`BufferPool`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The operation was interrupted by a [`CancellationToken`].
    #[error("cancelled")]
    Cancelled,

    /// Every handle on the other side of the named queue is gone.
    #[error("{0} queue closed")]
    Closed(&'static str),
}
