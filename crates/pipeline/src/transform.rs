use anyhow::{anyhow, Context};
use crossbeam_channel::{select, Receiver};
use std::sync::Arc;
use std::time::Instant;

use batch::{CancellationToken, NodeStateEntryBatch, TransformSide};
use entry::{is_hidden_path, EntryWriter, NodeStateEntry, LENGTH_PREFIX_BYTES};

use crate::store::{
    DocumentCache, NodeState, NodeStateProvider, PathPredicate, RawDocument, RawDocumentBatch,
    Revision,
};
use crate::PipelineError;

/// Documents between two progress log lines of one worker.
pub const PROGRESS_INTERVAL: u64 = 10_000;

/// Totals reported by a finished [`TransformTask`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformResult {
    pub worker: usize,
    pub entry_count: u64,
    pub documents_processed: u64,
    pub split_documents: u64,
    /// Buffers this worker handed to the sort stage.
    pub batches_submitted: u64,
}

/// Everything a transform worker shares with its siblings.
#[derive(Clone)]
pub struct TransformContext {
    pub provider: Arc<dyn NodeStateProvider>,
    pub cache: Arc<dyn DocumentCache>,
    pub predicate: Arc<dyn PathPredicate>,
    pub revision: Revision,
}

/// Converts raw documents into serialized entries and packs them into batch
/// buffers.
///
/// A worker holds one buffer at a time. When the next entry does not fit,
/// the buffer goes to the full queue and a fresh one is acquired before the
/// entry is added, so no entry is ever split across buffers.
pub struct TransformTask {
    worker: usize,
    ctx: TransformContext,
    docs: Receiver<RawDocumentBatch>,
    pool: TransformSide,
    cancel: CancellationToken,
}

impl TransformTask {
    pub fn new(
        worker: usize,
        ctx: TransformContext,
        docs: Receiver<RawDocumentBatch>,
        pool: TransformSide,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            ctx,
            docs,
            pool,
            cancel,
        }
    }

    pub fn run(self) -> Result<TransformResult, PipelineError> {
        let start = Instant::now();
        let mut result = TransformResult {
            worker: self.worker,
            ..TransformResult::default()
        };

        tracing::debug!("waiting for an empty buffer");
        let mut batch = self.pool.acquire_empty(&self.cancel)?;
        let mut writer = EntryWriter::new();
        let mut entries: Vec<NodeStateEntry> = Vec::new();

        loop {
            let docs = select! {
                recv(self.docs) -> msg => msg.ok(),
                recv(self.cancel.signal()) -> _ => return Err(PipelineError::Cancelled),
            };
            let Some(docs) = docs else {
                break;
            };

            for doc in &docs {
                result.documents_processed += 1;
                if result.documents_processed % PROGRESS_INTERVAL == 0 {
                    tracing::info!(
                        documents = result.documents_processed,
                        entries = result.entry_count,
                        buffer_entries = batch.len(),
                        buffer_bytes = batch.size_bytes(),
                        buffer_capacity = batch.capacity(),
                        "transform progress"
                    );
                }

                self.ctx.cache.put(doc);
                if doc.is_split_document() {
                    result.split_documents += 1;
                    continue;
                }

                entries.clear();
                self.collect_entries(doc, &mut entries)
                    .map_err(|source| PipelineError::Transform {
                        worker: self.worker,
                        document: doc.id.clone(),
                        source,
                    })?;

                for entry in &entries {
                    let body = writer.serialize(entry).map_err(|e| PipelineError::Transform {
                        worker: self.worker,
                        document: doc.id.clone(),
                        source: e.into(),
                    })?;
                    if body.len() + LENGTH_PREFIX_BYTES > batch.capacity() {
                        return Err(PipelineError::EntryTooLarge {
                            path: entry.path.clone(),
                            size: body.len() + LENGTH_PREFIX_BYTES,
                            capacity: batch.capacity(),
                        });
                    }
                    if !batch.has_room_for(body.len()) {
                        batch = self.rollover(batch, &mut result)?;
                    }
                    batch
                        .add_entry(&entry.path, body)
                        .map_err(|e| PipelineError::Transform {
                            worker: self.worker,
                            document: doc.id.clone(),
                            source: e.into(),
                        })?;
                    result.entry_count += 1;
                }
            }
        }

        // A failed download cancels before closing the queue; the partial
        // buffer must not reach the sort stage then.
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if batch.is_empty() {
            self.pool.return_empty(batch);
        } else {
            self.pool.submit_full(batch, &self.cancel)?;
            result.batches_submitted += 1;
        }

        tracing::info!(
            documents = result.documents_processed,
            entries = result.entry_count,
            split_documents = result.split_documents,
            batches = result.batches_submitted,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "transform worker finished"
        );
        Ok(result)
    }

    /// Submits the current buffer and blocks for an empty one.
    fn rollover(
        &self,
        full: NodeStateEntryBatch,
        result: &mut TransformResult,
    ) -> Result<NodeStateEntryBatch, PipelineError> {
        tracing::debug!(
            entries = full.len(),
            bytes = full.size_bytes(),
            "buffer full, handing to sort stage"
        );
        self.pool.submit_full(full, &self.cancel)?;
        result.batches_submitted += 1;
        Ok(self.pool.acquire_empty(&self.cancel)?)
    }

    /// Appends the entries produced by `doc` (its node plus bundled nodes)
    /// that pass the hidden-path check and the predicate.
    fn collect_entries(&self, doc: &RawDocument, out: &mut Vec<NodeStateEntry>) -> anyhow::Result<()> {
        let path = doc
            .path()
            .ok_or_else(|| anyhow!("cannot derive a path from id {}", doc.id))?;
        let state = self
            .ctx
            .provider
            .resolve_node_state(path, self.ctx.revision)
            .with_context(|| format!("resolving {path} at {}", self.ctx.revision))?;
        let Some(state) = state.filter(|s| s.exists) else {
            return Ok(());
        };

        self.push_entry(doc, &state, out)?;
        for child in self.ctx.provider.bundled_children(&state)? {
            self.push_entry(doc, &child, out)?;
        }
        Ok(())
    }

    fn push_entry(&self, doc: &RawDocument, state: &NodeState, out: &mut Vec<NodeStateEntry>) -> anyhow::Result<()> {
        if is_hidden_path(&state.path) || !self.ctx.predicate.accepts(&state.path) {
            return Ok(());
        }
        let payload = state
            .to_json()
            .with_context(|| format!("serializing node state {}", state.path))?;
        let mut entry = NodeStateEntry::new(state.path.clone(), payload).with_id(doc.id.clone());
        if let Some(modified) = doc.modified {
            entry = entry.with_last_modified(modified);
        }
        out.push(entry);
        Ok(())
    }
}
