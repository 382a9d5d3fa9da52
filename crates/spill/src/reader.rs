use anyhow::{Context, Result};
use entry::RecordReader;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Sequential reader over one spill file, feeding the merge.
pub struct SpillReader {
    /// Kept for error messages.
    path: PathBuf,
    records: RecordReader<File>,
}

impl SpillReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = RecordReader::open(&path)
            .with_context(|| format!("opening spill file {}", path.display()))?;
        Ok(Self { path, records })
    }

    /// Copies the next record body into `out` (replacing its contents).
    ///
    /// Returns `Ok(false)` at the end of the file.
    pub fn read_into(&mut self, out: &mut Vec<u8>) -> Result<bool> {
        let next = self
            .records
            .next_record()
            .with_context(|| format!("reading spill file {}", self.path.display()))?;
        match next {
            Some(body) => {
                out.clear();
                out.extend_from_slice(body);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records consumed so far.
    pub fn records_read(&self) -> u64 {
        self.records.records_read()
    }
}
