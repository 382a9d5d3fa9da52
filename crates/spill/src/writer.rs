use anyhow::Result;
use batch::NodeStateEntryBatch;
use std::path::{Path, PathBuf};

use crate::file::AtomicFile;

/// Summary of one spill file written by [`SpillWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillFileInfo {
    pub path: PathBuf,
    pub entries: usize,
    pub bytes: u64,
}

/// Turns a full batch buffer into a sorted spill file.
///
/// Stateless, like the sort stage that drives it: all work happens in
/// [`write_batch`](SpillWriter::write_batch).
pub struct SpillWriter;

impl SpillWriter {
    /// Sorts `batch` and writes its records to `path` in key order.
    ///
    /// Records are copied verbatim (length prefix included) by following
    /// each key's offset into the batch arena; nothing is decoded.
    ///
    /// # Crash Safety
    ///
    /// Writes to `path.tmp`, calls `sync_all()`, then atomically renames.
    /// On error the temp file is removed and `path` is never created.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch is empty (an empty spill file indicates
    /// a logic bug upstream), if a key points at a torn record, or on any
    /// I/O failure.
    pub fn write_batch(path: &Path, batch: &mut NodeStateEntryBatch) -> Result<SpillFileInfo> {
        if batch.is_empty() {
            anyhow::bail!("refusing to write an empty spill file (empty batch)");
        }
        batch.sort();

        let mut file = AtomicFile::create(path)?;
        for record in batch.records() {
            file.write_framed(record?)?;
        }
        let bytes = file.commit()?;

        tracing::debug!(
            path = %path.display(),
            entries = batch.len(),
            bytes,
            "wrote spill file"
        );
        Ok(SpillFileInfo {
            path: path.to_path_buf(),
            entries: batch.len(),
            bytes,
        })
    }
}
