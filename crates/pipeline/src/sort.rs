use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use batch::{CancellationToken, SortSide};
use spill::{SpillWriter, SPILL_EXTENSION};

use crate::PipelineError;

/// One spill file and its position in the run-wide spill sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpillFile {
    pub seq: usize,
    pub path: PathBuf,
}

/// Totals reported by a finished [`SortTask`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SortResult {
    pub worker: usize,
    pub spill_files: Vec<SpillFile>,
    pub entry_count: u64,
    pub bytes_written: u64,
}

/// Takes full buffers, writes each as one sorted spill file and returns the
/// buffer to the pool.
///
/// Several sort workers may share one pool; `spill_seq` keeps their file
/// names unique.
pub struct SortTask {
    worker: usize,
    pool: SortSide,
    spill_dir: PathBuf,
    spill_seq: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl SortTask {
    pub fn new(
        worker: usize,
        pool: SortSide,
        spill_dir: PathBuf,
        spill_seq: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            pool,
            spill_dir,
            spill_seq,
            cancel,
        }
    }

    pub fn run(self) -> Result<SortResult, PipelineError> {
        let start = Instant::now();
        let mut result = SortResult {
            worker: self.worker,
            ..SortResult::default()
        };

        while let Some(mut batch) = self.pool.next_full(&self.cancel)? {
            if batch.is_empty() {
                self.pool.release(batch, &self.cancel)?;
                continue;
            }
            let seq = self.spill_seq.fetch_add(1, Ordering::Relaxed);
            let path = self
                .spill_dir
                .join(format!("spill-{seq:06}.{SPILL_EXTENSION}"));

            let sort_start = Instant::now();
            let info = SpillWriter::write_batch(&path, &mut batch).map_err(|source| {
                PipelineError::Sort {
                    worker: self.worker,
                    source,
                }
            })?;
            tracing::info!(
                file = %info.path.display(),
                entries = info.entries,
                bytes = info.bytes,
                elapsed_ms = sort_start.elapsed().as_millis() as u64,
                "spilled buffer"
            );
            self.pool.release(batch, &self.cancel)?;

            result.entry_count += info.entries as u64;
            result.bytes_written += info.bytes;
            result.spill_files.push(SpillFile { seq, path: info.path });
        }

        tracing::info!(
            files = result.spill_files.len(),
            entries = result.entry_count,
            bytes = result.bytes_written,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sort worker finished"
        );
        Ok(result)
    }
}
