//! # Config - pipeline tuning knobs
//!
//! [`PipelineConfig`] gathers every size and thread count the pipelined
//! flat-file builder needs. Values come from [`Default`], may be overridden
//! through `FLATFILE_*` environment variables ([`PipelineConfig::from_env`]),
//! and are checked by [`PipelineConfig::validate`] before a run starts.
//!
//! ## Environment variables
//!
//! ```text
//! FLATFILE_WORK_DIR          work directory for spill + output files (default: "flatfile-work")
//! FLATFILE_OUTPUT            output file name inside the work dir     (default: "store-sorted.ffs")
//! FLATFILE_TRANSFORM_THREADS transform worker count                   (default: 2)
//! FLATFILE_SORT_THREADS      sort-and-spill worker count              (default: 1)
//! FLATFILE_BUFFER_COUNT      number of batch buffers in the pool      (default: 3)
//! FLATFILE_BUFFER_MB         size of each batch buffer in MiB         (default: 32)
//! FLATFILE_MEMORY_MB         total buffer memory, overrides BUFFER_MB (unset by default)
//! FLATFILE_MAX_ENTRIES       max entries per batch buffer             (default: 1000000)
//! FLATFILE_DOC_BATCH         documents per raw-document batch         (default: 1000)
//! FLATFILE_PAGE_SIZE         documents per store page                 (default: 10000)
//! FLATFILE_DOC_QUEUE         raw-document queue capacity (batches)    (default: 8)
//! FLATFILE_KEEP_SPILL        keep spill files after merge             (default: "false")
//! ```
//!
//! Unparsable values fall back to the default and are logged at `warn`.

use std::path::PathBuf;
use thiserror::Error;

const MIB: usize = 1024 * 1024;

/// Smallest accepted batch buffer: a 4-byte prefix plus a minimal body.
pub const MIN_BUFFER_BYTES: usize = 64;

/// Errors reported by [`PipelineConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A count that must be at least one was zero.
    #[error("{0} must be at least 1")]
    Zero(&'static str),

    /// The batch buffer is too small to hold any record.
    #[error("buffer_size_bytes {0} is below the minimum of {MIN_BUFFER_BYTES}")]
    BufferTooSmall(usize),

    /// The batch buffer cannot be addressed with 32-bit record offsets.
    #[error("buffer_size_bytes {0} exceeds u32::MAX")]
    BufferTooLarge(usize),
}

/// Sizes and thread counts for one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Directory holding spill files and the final output.
    pub work_dir: PathBuf,
    /// File name of the merged output inside `work_dir`.
    pub output_file_name: String,
    pub transform_threads: usize,
    pub sort_threads: usize,
    /// Number of batch buffers cycling between transform and sort.
    pub buffer_count: usize,
    /// Byte capacity of each batch buffer.
    pub buffer_size_bytes: usize,
    pub max_entries_per_buffer: usize,
    /// Documents per raw-document batch handed to a transform worker.
    pub download_batch_size: usize,
    /// Documents requested per store page.
    pub page_size: usize,
    /// Capacity (in batches) of the raw-document queue.
    pub doc_queue_capacity: usize,
    /// Leave spill files on disk after a successful merge.
    pub keep_spill_files: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("flatfile-work"),
            output_file_name: "store-sorted.ffs".to_string(),
            transform_threads: 2,
            sort_threads: 1,
            buffer_count: 3,
            buffer_size_bytes: 32 * MIB,
            max_entries_per_buffer: 1_000_000,
            download_batch_size: 1000,
            page_size: 10_000,
            doc_queue_capacity: 8,
            keep_spill_files: false,
        }
    }
}

impl PipelineConfig {
    /// Builds a config from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup.
    ///
    /// Split out from [`from_env`](Self::from_env) so tests can feed a map
    /// instead of mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let mut cfg = Self {
            work_dir: lookup("FLATFILE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.work_dir),
            output_file_name: lookup("FLATFILE_OUTPUT").unwrap_or(d.output_file_name),
            transform_threads: parse_or(&lookup, "FLATFILE_TRANSFORM_THREADS", d.transform_threads),
            sort_threads: parse_or(&lookup, "FLATFILE_SORT_THREADS", d.sort_threads),
            buffer_count: parse_or(&lookup, "FLATFILE_BUFFER_COUNT", d.buffer_count),
            buffer_size_bytes: parse_or(&lookup, "FLATFILE_BUFFER_MB", d.buffer_size_bytes / MIB)
                .saturating_mul(MIB),
            max_entries_per_buffer: parse_or(&lookup, "FLATFILE_MAX_ENTRIES", d.max_entries_per_buffer),
            download_batch_size: parse_or(&lookup, "FLATFILE_DOC_BATCH", d.download_batch_size),
            page_size: parse_or(&lookup, "FLATFILE_PAGE_SIZE", d.page_size),
            doc_queue_capacity: parse_or(&lookup, "FLATFILE_DOC_QUEUE", d.doc_queue_capacity),
            keep_spill_files: parse_or(&lookup, "FLATFILE_KEEP_SPILL", d.keep_spill_files),
        };
        if lookup("FLATFILE_MEMORY_MB").is_some() {
            let memory_mb: usize = parse_or(&lookup, "FLATFILE_MEMORY_MB", 0);
            if memory_mb > 0 {
                cfg = cfg.with_memory_budget(memory_mb.saturating_mul(MIB));
            }
        }
        cfg
    }

    /// Splits `total_bytes` evenly across the pool's buffers.
    ///
    /// Total buffer memory is `buffer_count * buffer_size_bytes`, so this is
    /// the knob that bounds the pipeline's steady-state footprint.
    #[must_use]
    pub fn with_memory_budget(mut self, total_bytes: usize) -> Self {
        let per_buffer = total_bytes / self.buffer_count.max(1);
        self.buffer_size_bytes = per_buffer.clamp(MIN_BUFFER_BYTES, u32::MAX as usize);
        self
    }

    /// Full path of the merged output file.
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join(&self.output_file_name)
    }

    /// Upper bound on memory held by batch buffers.
    #[must_use]
    pub fn buffer_memory_bytes(&self) -> usize {
        self.buffer_count.saturating_mul(self.buffer_size_bytes)
    }

    /// Checks every count and size. Called by the pipeline before any thread
    /// is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("transform_threads", self.transform_threads),
            ("sort_threads", self.sort_threads),
            ("buffer_count", self.buffer_count),
            ("max_entries_per_buffer", self.max_entries_per_buffer),
            ("download_batch_size", self.download_batch_size),
            ("page_size", self.page_size),
            ("doc_queue_capacity", self.doc_queue_capacity),
        ];
        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.buffer_size_bytes < MIN_BUFFER_BYTES {
            return Err(ConfigError::BufferTooSmall(self.buffer_size_bytes));
        }
        if self.buffer_size_bytes > u32::MAX as usize {
            return Err(ConfigError::BufferTooLarge(self.buffer_size_bytes));
        }
        if self.buffer_count < self.transform_threads {
            // Legal, but some workers will sit idle waiting for a buffer.
            tracing::warn!(
                buffer_count = self.buffer_count,
                transform_threads = self.transform_threads,
                "fewer batch buffers than transform workers"
            );
        }
        Ok(())
    }
}

/// Parses `key` from `lookup`, falling back to `default` when unset or
/// invalid. An invalid value is logged at `warn`.
pub fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, ?default, "ignoring unparsable setting");
                default
            }
        },
        None => default,
    }
}
