//! Temp-file + rename helper shared by the spill writer and the merge.

use anyhow::Result;
use entry::LENGTH_PREFIX_BYTES;
use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// A file written under `<path>.tmp` and moved into place by [`commit`].
///
/// Dropping it without committing removes the temp file, so an aborted
/// write never leaves a partial file behind under either name.
///
/// [`commit`]: AtomicFile::commit
pub(crate) struct AtomicFile {
    target: PathBuf,
    tmp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes: u64,
}

impl AtomicFile {
    pub(crate) fn create(target: &Path) -> Result<Self> {
        let mut tmp_name = target.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        let raw = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(Self {
            target: target.to_path_buf(),
            tmp_path,
            writer: Some(BufWriter::with_capacity(1 << 20, raw)),
            bytes: 0,
        })
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        match self.writer.as_mut() {
            Some(w) => Ok(w),
            None => anyhow::bail!("write after commit to {}", self.target.display()),
        }
    }

    /// Appends one already-framed record (prefix included).
    pub(crate) fn write_framed(&mut self, record: &[u8]) -> Result<()> {
        self.writer()?.write_all(record)?;
        self.bytes += record.len() as u64;
        Ok(())
    }

    /// Frames `body` with its length prefix and appends it.
    pub(crate) fn write_record(&mut self, body: &[u8]) -> Result<()> {
        entry::write_record(self.writer()?, body)?;
        self.bytes += (LENGTH_PREFIX_BYTES + body.len()) as u64;
        Ok(())
    }

    /// Flushes, fsyncs, renames into place and fsyncs the parent directory.
    /// Returns the number of bytes written.
    pub(crate) fn commit(mut self) -> Result<u64> {
        let writer = match self.writer.take() {
            Some(w) => w,
            None => anyhow::bail!("double commit of {}", self.target.display()),
        };
        writer.into_inner()?.sync_all()?;
        rename(&self.tmp_path, &self.target)?;

        // A crash after rename but before the directory sync can lose the
        // entry on ext4/XFS.
        if let Some(parent) = self.target.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(self.bytes)
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
