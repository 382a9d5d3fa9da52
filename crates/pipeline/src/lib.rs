//! # Pipeline - pipelined external sort into a flat file
//!
//! Builds a path-sorted flat file of every node in a document store at one
//! revision. Stages run on their own threads and hand data to each other
//! through bounded queues, so downloading, transforming and sorting overlap
//! and memory stays fixed.
//!
//! ## Architecture
//!
//! ```text
//!  DocumentStore
//!       |  read_documents_page()
//!       v
//! ┌────────────┐  RawDocumentBatch  ┌─────────────────┐
//! │  DOWNLOAD  │ ─────────────────▶ │ TRANSFORM x N   │ ◀── empty buffers ─┐
//! └────────────┘  (bounded queue)   └─────────────────┘                    │
//!                                           │ full buffers                 │
//!                                           v                              │
//!                                   ┌─────────────────┐                    │
//!                                   │ SORT x M        │ ───────────────────┘
//!                                   └─────────────────┘
//!                                           │ spill-NNNNNN.ffs
//!                                           v
//!                                   ┌─────────────────┐
//!                                   │ MERGE           │ ──▶ store-sorted.ffs
//!                                   └─────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module        | Purpose                                                  |
//! |---------------|----------------------------------------------------------|
//! | [`store`]     | Collaborator traits, raw documents, node states, filters |
//! | [`memory`]    | In-memory document store and node state provider         |
//! | `download`    | [`DownloadTask`]: paged traversal into the document queue |
//! | `transform`   | [`TransformTask`]: documents to entries in batch buffers |
//! | `sort`        | [`SortTask`]: sorted spill file per full buffer          |
//! | `merge`       | [`MergeTask`]: k-way merge into the output file          |
//! | `strategy`    | [`PipelinedStrategy`]: wiring, supervision, cancellation |
//!
//! ## Shutdown
//!
//! Completion flows downstream by closing queues: the downloader drops its
//! sender, transform workers drain the document queue and submit their last
//! buffer, and the sort stage stops once every transform worker is gone.
//! Failure flows the other way: the first stage error cancels a shared
//! [`CancellationToken`], which wakes every blocked thread.

mod download;
pub mod memory;
mod merge;
mod sort;
pub mod store;
mod strategy;
mod transform;

use batch::PoolError;
use config::ConfigError;
use thiserror::Error;

pub use batch::CancellationToken;
pub use download::{DownloadResult, DownloadTask};
pub use memory::InMemoryNodeStore;
pub use merge::MergeTask;
pub use sort::{SortResult, SortTask, SpillFile};
pub use store::{
    AcceptAll, DocumentCache, DocumentPage, DocumentStore, InMemoryDocumentCache, NoDocumentCache,
    NodeState, NodeStateProvider, PathFilter, PathPredicate, RawDocument, RawDocumentBatch,
    Revision,
};
pub use strategy::{PipelineOutcome, PipelinedStrategy, SPILL_DIR_NAME};
pub use transform::{TransformContext, TransformResult, TransformTask, PROGRESS_INTERVAL};

/// Errors from a pipeline run. Each variant names the stage it came from.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("preparing work directory: {0}")]
    Setup(#[from] std::io::Error),

    #[error("download failed at cursor {cursor:?}: {source:#}")]
    Download {
        cursor: Option<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("transform worker {worker} failed on document {document}: {source:#}")]
    Transform {
        worker: usize,
        document: String,
        #[source]
        source: anyhow::Error,
    },

    /// A single serialized entry is larger than a whole batch buffer.
    #[error("entry {path} needs {size} bytes but a batch buffer holds {capacity}")]
    EntryTooLarge {
        path: String,
        size: usize,
        capacity: usize,
    },

    #[error("sort worker {worker} failed: {source:#}")]
    Sort {
        worker: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("merge failed: {0:#}")]
    Merge(#[source] anyhow::Error),

    #[error("{stage} thread panicked")]
    Panicked { stage: String },

    /// The stage on the other end of a queue went away.
    #[error("{0} queue closed")]
    QueueClosed(&'static str),

    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// `true` for errors that only echo a failure elsewhere in the pipeline.
    pub fn is_secondary(&self) -> bool {
        matches!(self, PipelineError::Cancelled | PipelineError::QueueClosed(_))
    }
}

impl From<PoolError> for PipelineError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Cancelled => PipelineError::Cancelled,
            PoolError::Closed(queue) => PipelineError::QueueClosed(queue),
        }
    }
}

#[cfg(test)]
mod tests;
