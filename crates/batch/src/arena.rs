use byteorder::{ByteOrder, LittleEndian};
use entry::{write_record, SortKey, LENGTH_PREFIX_BYTES};

use crate::BatchError;

/// Fixed-capacity arena of length-prefixed records plus their sort keys.
///
/// # Invariants
///
/// - `buffer.len() <= capacity` at all times; the arena never reallocates.
/// - Every key's offset points at the length prefix of a complete record
///   inside `buffer[..buffer.len()]`.
/// - Records are only appended; nothing is overwritten until [`reset`].
///
/// [`reset`]: NodeStateEntryBatch::reset
#[derive(Debug)]
pub struct NodeStateEntryBatch {
    buffer: Vec<u8>,
    capacity: usize,
    sort_keys: Vec<SortKey>,
    max_entries: usize,
}

impl NodeStateEntryBatch {
    /// Allocates an empty batch. `capacity` must fit in a `u32` offset.
    pub fn new(capacity: usize, max_entries: usize) -> Self {
        debug_assert!(capacity <= u32::MAX as usize);
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
            sort_keys: Vec::with_capacity(max_entries.min(64 * 1024)),
            max_entries,
        }
    }

    /// `true` once the entry limit is reached.
    pub fn is_at_max_entries(&self) -> bool {
        self.sort_keys.len() >= self.max_entries
    }

    /// Bytes still free in the arena.
    pub fn remaining(&self) -> usize {
        self.capacity - self.buffer.len()
    }

    /// Returns `true` if a record with a body of `body_len` bytes fits now.
    pub fn has_room_for(&self, body_len: usize) -> bool {
        !self.is_at_max_entries() && body_len + LENGTH_PREFIX_BYTES <= self.remaining()
    }

    /// Appends one record and its sort key.
    ///
    /// Fails with [`BatchError::Full`] (batch unchanged) when the record does
    /// not fit, or [`BatchError::EntryTooLarge`] when it would not fit even
    /// an empty batch.
    pub fn add_entry(&mut self, path: &str, body: &[u8]) -> Result<(), BatchError> {
        let needed = body.len() + LENGTH_PREFIX_BYTES;
        if needed > self.capacity {
            return Err(BatchError::EntryTooLarge {
                needed,
                capacity: self.capacity,
            });
        }
        if !self.has_room_for(body.len()) {
            return Err(BatchError::Full {
                entries: self.sort_keys.len(),
                remaining: self.remaining(),
                needed,
            });
        }
        let offset = self.buffer.len() as u32;
        write_record(&mut self.buffer, body)?;
        self.sort_keys.push(SortKey::new(path, offset));
        Ok(())
    }

    /// Sorts the keys into hierarchical path order.
    pub fn sort(&mut self) {
        self.sort_keys.sort_unstable();
    }

    /// The full record (prefix + body) starting at `offset`.
    pub fn record_at(&self, offset: u32) -> Result<&[u8], BatchError> {
        let start = offset as usize;
        let written = self.written();
        let body_len = read_len(written, start).ok_or(BatchError::BadOffset(offset))?;
        let end = start + LENGTH_PREFIX_BYTES + body_len;
        written.get(start..end).ok_or(BatchError::BadOffset(offset))
    }

    /// Records in key order. Call [`sort`](Self::sort) first for sorted output.
    pub fn records(&self) -> impl Iterator<Item = Result<&[u8], BatchError>> + '_ {
        self.sort_keys.iter().map(|k| self.record_at(k.offset()))
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort_keys
    }

    /// The written region of the arena.
    pub fn written(&self) -> &[u8] {
        &self.buffer
    }

    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.sort_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sort_keys.is_empty()
    }

    /// Bytes written so far.
    pub fn size_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Rewinds the arena and drops all keys, keeping both allocations.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.sort_keys.clear();
    }
}

/// Reads the length prefix at `start`, if the whole prefix is in `buf`.
fn read_len(buf: &[u8], start: usize) -> Option<usize> {
    let prefix = buf.get(start..start.checked_add(LENGTH_PREFIX_BYTES)?)?;
    Some(LittleEndian::read_u32(prefix) as usize)
}
