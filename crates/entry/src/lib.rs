//! # Entry - node-state entries and their record format
//!
//! A [`NodeStateEntry`] is the unit the flat file is made of: one node of the
//! content tree at a fixed revision. Entries travel through the pipeline as
//! **length-prefixed records**, inside batch buffers, spill files and the
//! final output alike.
//!
//! ## Record Format
//!
//! ```text
//! [body_len: u32 LE][body ...]
//! ```
//!
//! Body:
//!
//! ```text
//! [path_len: u32][path (utf8)]
//! [flags: u8]                      bit 0 = last_modified, bit 1 = id
//! [last_modified: i64]             only if bit 0
//! [id_len: u32][id (utf8)]         only if bit 1
//! [payload_len: u32][payload]
//! ```
//!
//! The path comes first so that sorters and mergers can order records with
//! [`body_path`] without decoding the payload.
//!
//! ## Example
//!
//! ```rust
//! use entry::{NodeStateEntry, RecordReader, write_entry};
//!
//! let e = NodeStateEntry::new("/content/a", b"{}".to_vec()).with_id("2:/content/a");
//! let mut out = Vec::new();
//! write_entry(&mut out, &e).unwrap();
//!
//! let mut r = RecordReader::from_reader(out.as_slice());
//! assert_eq!(r.next_entry().unwrap(), Some(e));
//! ```

mod codec;
pub mod path;

use std::io;
use thiserror::Error;

pub use codec::{
    body_path, decode_body, encode_body, write_entry, write_record, EntryWriter, RecordReader,
    LENGTH_PREFIX_BYTES, MAX_RECORD_BYTES,
};
pub use path::{compare_paths, is_hidden_path, SortKey};

/// One node of the content tree, ready to be written to the flat file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStateEntry {
    /// Absolute path, e.g. `/content/site/page`.
    pub path: String,
    /// Serialized node state (JSON produced by the transform stage).
    pub payload: Vec<u8>,
    /// Last-modified timestamp of the origin document, in seconds.
    pub last_modified: Option<i64>,
    /// Identifier of the document this entry was materialized from.
    pub id: Option<String>,
}

impl NodeStateEntry {
    pub fn new(path: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            payload,
            last_modified: None,
            id: None,
        }
    }

    #[must_use]
    pub fn with_last_modified(mut self, last_modified: i64) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Errors produced while encoding or decoding records.
#[derive(Debug, Error)]
pub enum EntryError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The bytes do not form a valid record.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// A record (or one of its fields) exceeds the format's limits.
    #[error("record too large: {0} bytes")]
    TooLarge(usize),
}
