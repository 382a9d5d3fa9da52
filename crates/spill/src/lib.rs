//! # Spill - sorted runs on disk and their k-way merge
//!
//! The external half of the external sort. Each full batch buffer becomes
//! one **spill file**: the batch is sorted in memory and its records are
//! copied verbatim, in key order, to disk. Once every batch has been
//! spilled, [`merge_spill_files`] streams all spill files through a min-heap
//! into the final flat file.
//!
//! ## File layout
//!
//! Spill files and the merged output share one format, a plain sequence of
//! records with no header or footer:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ body_len (u32 LE) | body                      │
//! │ body_len (u32 LE) | body                      │
//! │ ...  (ascending hierarchical path order) ...  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! See the [`entry`] crate for the body layout.
//!
//! ## Crash safety
//!
//! Every file is written to `<name>.tmp`, fsynced and atomically renamed, so
//! a file with its final name is always complete. A failed merge removes its
//! partial output and leaves every spill file in place for a retry.

mod file;
mod merge;
mod reader;
mod writer;

pub use merge::{check_sorted, merge_spill_files, MergeIterator, MergeStats};
pub use reader::SpillReader;
pub use writer::{SpillFileInfo, SpillWriter};

/// Extension of spill and output files.
pub const SPILL_EXTENSION: &str = "ffs";

#[cfg(test)]
mod tests;
