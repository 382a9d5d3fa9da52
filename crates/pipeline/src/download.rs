use crossbeam_channel::{select, Sender};
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use batch::CancellationToken;

use crate::store::{DocumentStore, RawDocument, RawDocumentBatch};
use crate::PipelineError;

/// Totals reported by a finished [`DownloadTask`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadResult {
    pub documents: u64,
    pub pages: u64,
    pub batches: u64,
}

/// Pages through the document store and feeds the document queue.
///
/// The queue is closed when the task returns (its sender is dropped with
/// it), which is how transform workers learn that the traversal is over.
pub struct DownloadTask {
    store: Arc<dyn DocumentStore>,
    page_size: usize,
    batch_size: usize,
    docs: Sender<RawDocumentBatch>,
    cancel: CancellationToken,
}

impl DownloadTask {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        page_size: usize,
        batch_size: usize,
        docs: Sender<RawDocumentBatch>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            batch_size: batch_size.max(1),
            docs,
            cancel,
        }
    }

    pub fn run(self) -> Result<DownloadResult, PipelineError> {
        let result = self.traverse();
        // Cancel while the queue is still open so workers never mistake a
        // failed traversal for a finished one.
        if matches!(&result, Err(e) if !e.is_secondary()) {
            self.cancel.cancel();
        }
        result
    }

    fn traverse(&self) -> Result<DownloadResult, PipelineError> {
        let start = Instant::now();
        let mut result = DownloadResult::default();
        let mut cursor: Option<String> = None;
        let mut pending: Vec<RawDocument> = Vec::with_capacity(self.batch_size);

        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let page = self
                .store
                .read_documents_page(cursor.as_deref(), self.page_size)
                .map_err(|source| PipelineError::Download {
                    cursor: cursor.clone(),
                    source,
                })?;
            result.pages += 1;

            for doc in page.documents {
                pending.push(doc);
                result.documents += 1;
                if pending.len() >= self.batch_size {
                    let full = mem::replace(&mut pending, Vec::with_capacity(self.batch_size));
                    self.send(full)?;
                    result.batches += 1;
                }
            }

            match page.next_cursor {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(PipelineError::Download {
                        cursor: Some(next),
                        source: anyhow::anyhow!("store returned the same cursor twice"),
                    });
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if !pending.is_empty() {
            self.send(pending)?;
            result.batches += 1;
        }

        tracing::info!(
            documents = result.documents,
            pages = result.pages,
            batches = result.batches,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "download complete"
        );
        Ok(result)
    }

    /// Blocks while the document queue is full.
    fn send(&self, batch: RawDocumentBatch) -> Result<(), PipelineError> {
        select! {
            send(self.docs, batch) -> res => res.map_err(|_| PipelineError::QueueClosed("document")),
            recv(self.cancel.signal()) -> _ => Err(PipelineError::Cancelled),
        }
    }
}
