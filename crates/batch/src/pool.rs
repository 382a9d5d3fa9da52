use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::{CancellationToken, NodeStateEntryBatch, PoolError};

/// Fixed set of batches circulating between an `empty` and a `full` queue.
///
/// Construct once per pipeline run and [`split`](Self::split) into the two
/// handle types. When every [`TransformSide`] is dropped and the full queue
/// has drained, [`SortSide::next_full`] returns `None`: the closed channel is
/// the end-of-input signal, so no sentinel batch is needed.
pub struct BufferPool {
    empty_tx: Sender<NodeStateEntryBatch>,
    empty_rx: Receiver<NodeStateEntryBatch>,
    full_tx: Sender<NodeStateEntryBatch>,
    full_rx: Receiver<NodeStateEntryBatch>,
    count: usize,
}

impl BufferPool {
    /// Allocates `count` batches of `capacity` bytes / `max_entries` entries
    /// and places them all in the empty queue.
    pub fn new(count: usize, capacity: usize, max_entries: usize) -> Self {
        let count = count.max(1);
        let (empty_tx, empty_rx) = bounded(count);
        let (full_tx, full_rx) = bounded(count);
        for _ in 0..count {
            // Cannot fail: capacity == count and we hold the receiver.
            let _ = empty_tx.try_send(NodeStateEntryBatch::new(capacity, max_entries));
        }
        tracing::debug!(
            count,
            capacity,
            max_entries,
            total_bytes = count.saturating_mul(capacity),
            "allocated batch buffers"
        );
        Self {
            empty_tx,
            empty_rx,
            full_tx,
            full_rx,
            count,
        }
    }

    /// Number of batches owned by the pool.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Hands the producer half to transform workers and the consumer half
    /// to sort workers. Both halves are cheap to clone.
    pub fn split(self) -> (TransformSide, SortSide) {
        (
            TransformSide {
                empty_rx: self.empty_rx,
                empty_tx: self.empty_tx.clone(),
                full_tx: self.full_tx,
            },
            SortSide {
                full_rx: self.full_rx,
                empty_tx: self.empty_tx,
            },
        )
    }
}

/// Transform-worker handle: takes empty batches, gives back full ones.
#[derive(Clone)]
pub struct TransformSide {
    empty_rx: Receiver<NodeStateEntryBatch>,
    empty_tx: Sender<NodeStateEntryBatch>,
    full_tx: Sender<NodeStateEntryBatch>,
}

impl TransformSide {
    /// Blocks until an empty batch is available.
    pub fn acquire_empty(
        &self,
        cancel: &CancellationToken,
    ) -> Result<NodeStateEntryBatch, PoolError> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        select! {
            recv(self.empty_rx) -> msg => msg.map_err(|_| PoolError::Closed("empty")),
            recv(cancel.signal()) -> _ => Err(PoolError::Cancelled),
        }
    }

    /// Takes an empty batch if one is ready right now.
    pub fn try_acquire_empty(&self) -> Option<NodeStateEntryBatch> {
        self.empty_rx.try_recv().ok()
    }

    /// Blocks until the full queue has room for `batch`.
    ///
    /// On cancellation the batch is dropped along with the error; the
    /// pipeline is shutting down and nobody will need it.
    pub fn submit_full(
        &self,
        batch: NodeStateEntryBatch,
        cancel: &CancellationToken,
    ) -> Result<(), PoolError> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        select! {
            send(self.full_tx, batch) -> res => res.map_err(|_| PoolError::Closed("full")),
            recv(cancel.signal()) -> _ => Err(PoolError::Cancelled),
        }
    }

    /// Puts back a batch that was acquired but never filled.
    ///
    /// Never blocks: the empty queue has room for every batch in the pool.
    pub fn return_empty(&self, mut batch: NodeStateEntryBatch) {
        batch.reset();
        if self.empty_tx.try_send(batch).is_err() {
            tracing::trace!("empty queue unavailable, dropping returned batch");
        }
    }

    /// Full batches waiting for the sort stage.
    pub fn full_len(&self) -> usize {
        self.full_tx.len()
    }

    /// Empty batches ready to be acquired.
    pub fn empty_len(&self) -> usize {
        self.empty_rx.len()
    }
}

/// Sort-worker handle: takes full batches, returns them once persisted.
#[derive(Clone)]
pub struct SortSide {
    full_rx: Receiver<NodeStateEntryBatch>,
    empty_tx: Sender<NodeStateEntryBatch>,
}

impl SortSide {
    /// Blocks for the next full batch.
    ///
    /// Returns `Ok(None)` once every [`TransformSide`] is dropped and the
    /// queue is drained.
    pub fn next_full(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<NodeStateEntryBatch>, PoolError> {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        select! {
            recv(self.full_rx) -> msg => Ok(msg.ok()),
            recv(cancel.signal()) -> _ => Err(PoolError::Cancelled),
        }
    }

    /// Resets `batch` and puts it back in the empty queue.
    ///
    /// If all transform workers are already gone the batch is simply
    /// dropped: nobody is left to acquire it.
    pub fn release(
        &self,
        mut batch: NodeStateEntryBatch,
        cancel: &CancellationToken,
    ) -> Result<(), PoolError> {
        batch.reset();
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        select! {
            send(self.empty_tx, batch) -> res => {
                if res.is_err() {
                    tracing::trace!("no transform workers left, dropping released batch");
                }
                Ok(())
            },
            recv(cancel.signal()) -> _ => Err(PoolError::Cancelled),
        }
    }

    pub fn full_len(&self) -> usize {
        self.full_rx.len()
    }

    pub fn empty_len(&self) -> usize {
        self.empty_tx.len()
    }
}
