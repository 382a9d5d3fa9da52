//! K-way merge over sorted spill files.
//!
//! Produces record bodies in ascending hierarchical path order. Paths are
//! unique at a fixed revision, so equal paths should never meet; if they do,
//! both records are kept and the one from the lower-indexed file comes
//! first, which keeps the output deterministic.

use anyhow::{bail, Result};
use entry::{body_path, compare_paths, RecordReader};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::file::AtomicFile;
use crate::SpillReader;

/// The current record of one spill file, ordered for the merge heap.
///
/// Both buffers are reused: when a source is advanced, its next record is
/// read into the entry that was just popped.
struct HeapEntry {
    path: String,
    body: Vec<u8>,
    /// Index into `readers`.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest path pops first.
        // On tie, the lower source index pops first.
        compare_paths(&other.path, &self.path).then_with(|| other.source.cmp(&self.source))
    }
}

/// Streams the records of several sorted spill files in global path order.
pub struct MergeIterator {
    readers: Vec<SpillReader>,
    heap: BinaryHeap<HeapEntry>,
    /// Entry returned by the previous call; its source is advanced lazily.
    last: Option<HeapEntry>,
}

impl MergeIterator {
    /// Opens every file and primes the heap with its first record.
    pub fn open(files: &[PathBuf]) -> Result<Self> {
        let mut readers = Vec::with_capacity(files.len());
        for f in files {
            readers.push(SpillReader::open(f)?);
        }
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (source, reader) in readers.iter_mut().enumerate() {
            let mut body = Vec::new();
            if reader.read_into(&mut body)? {
                let path = body_path(&body)?.to_string();
                heap.push(HeapEntry { path, body, source });
            }
        }
        Ok(Self {
            readers,
            heap,
            last: None,
        })
    }

    /// Returns the next record body, or `None` once every file is drained.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, corrupt records, or a spill file whose records
    /// are not in ascending order.
    pub fn next_record(&mut self) -> Result<Option<&[u8]>> {
        if let Some(mut entry) = self.last.take() {
            let reader = &mut self.readers[entry.source];
            if reader.read_into(&mut entry.body)? {
                let next_path = body_path(&entry.body)?;
                if compare_paths(next_path, &entry.path) == Ordering::Less {
                    bail!(
                        "spill file {} is not sorted: {} follows {} at record {}",
                        reader.path().display(),
                        next_path,
                        entry.path,
                        reader.records_read()
                    );
                }
                entry.path.clear();
                entry.path.push_str(next_path);
                self.heap.push(entry);
            }
        }

        match self.heap.pop() {
            Some(top) => {
                if let Some(peek) = self.heap.peek() {
                    if compare_paths(&peek.path, &top.path) == Ordering::Equal {
                        tracing::warn!(path = %top.path, "duplicate path across spill files");
                    }
                }
                self.last = Some(top);
                Ok(self.last.as_ref().map(|e| e.body.as_slice()))
            }
            None => Ok(None),
        }
    }

    /// Number of input files.
    pub fn source_count(&self) -> usize {
        self.readers.len()
    }
}

/// Outcome of [`merge_spill_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeStats {
    pub entries: u64,
    pub files_merged: usize,
    pub bytes_written: u64,
}

/// Merges `files` into one sorted file at `output`.
///
/// The output is written atomically. Only after it is in place are the
/// inputs removed (when `delete_inputs` is set); on any error the inputs are
/// left untouched and no output file exists, so the merge can be retried.
pub fn merge_spill_files(files: &[PathBuf], output: &Path, delete_inputs: bool) -> Result<MergeStats> {
    let start = Instant::now();
    let mut merge = MergeIterator::open(files)?;
    let mut out = AtomicFile::create(output)?;

    let mut entries = 0u64;
    while let Some(body) = merge.next_record()? {
        out.write_record(body)?;
        entries += 1;
    }
    drop(merge);
    let bytes_written = out.commit()?;

    if delete_inputs {
        for f in files {
            if let Err(e) = std::fs::remove_file(f) {
                tracing::warn!(file = %f.display(), error = %e, "could not delete spill file");
            }
        }
    }

    tracing::info!(
        output = %output.display(),
        files = files.len(),
        entries,
        bytes_written,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "merged spill files"
    );
    Ok(MergeStats {
        entries,
        files_merged: files.len(),
        bytes_written,
    })
}

/// Reads `path` end to end and checks that paths are strictly ascending.
///
/// Returns the number of records. Used to verify the final flat file.
pub fn check_sorted(path: &Path) -> Result<u64> {
    let mut reader = RecordReader::open(path)?;
    let mut prev: Option<String> = None;
    let mut count = 0u64;
    while let Some(body) = reader.next_record()? {
        count += 1;
        let current = body_path(body)?;
        if let Some(p) = &prev {
            if compare_paths(p, current) != Ordering::Less {
                bail!(
                    "{} is not sorted: {} follows {} at record {}",
                    path.display(),
                    current,
                    p,
                    count
                );
            }
        }
        match prev.as_mut() {
            Some(p) => {
                p.clear();
                p.push_str(current);
            }
            None => prev = Some(current.to_string()),
        }
    }
    Ok(count)
}
