use anyhow::{bail, Result};
use config::PipelineConfig;
use entry::{NodeStateEntry, RecordReader};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::*;

pub fn fields(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn doc(path: &str, props: Value) -> RawDocument {
    RawDocument::for_path(path, fields(props))
}

pub fn store_of(docs: Vec<RawDocument>) -> Arc<InMemoryNodeStore> {
    Arc::new(InMemoryNodeStore::from_documents(docs).unwrap())
}

/// Tiny buffers and queues so that every run rolls over and spills often.
pub fn small_config(work_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        work_dir: work_dir.to_path_buf(),
        transform_threads: 2,
        sort_threads: 1,
        buffer_count: 3,
        buffer_size_bytes: 4096,
        max_entries_per_buffer: 2,
        download_batch_size: 2,
        page_size: 3,
        doc_queue_capacity: 2,
        ..PipelineConfig::default()
    }
}

pub fn strategy_for(config: PipelineConfig, store: Arc<InMemoryNodeStore>) -> PipelinedStrategy {
    PipelinedStrategy::new(
        config,
        store.clone(),
        store,
        Arc::new(NoDocumentCache),
        Arc::new(AcceptAll),
        Revision(10),
    )
}

pub fn read_entries(path: &Path) -> Vec<NodeStateEntry> {
    let mut r = RecordReader::open(path).unwrap();
    let mut out = Vec::new();
    while let Some(e) = r.next_entry().unwrap() {
        out.push(e);
    }
    out
}

pub fn read_paths(path: &Path) -> Vec<String> {
    read_entries(path).into_iter().map(|e| e.path).collect()
}

/// Files with the given extension directly inside `dir`.
pub fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let Ok(rd) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = rd
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some(ext))
        .collect();
    out.sort();
    out
}

/// Serves pages from `inner` but fails on page `fail_on_page` (0-based).
pub struct FailingStore {
    pub inner: Arc<InMemoryNodeStore>,
    pub fail_on_page: u64,
    pub pages: AtomicU64,
}

impl DocumentStore for FailingStore {
    fn read_documents_page(&self, cursor: Option<&str>, limit: usize) -> Result<DocumentPage> {
        if self.pages.fetch_add(1, Ordering::SeqCst) == self.fail_on_page {
            bail!("connection reset");
        }
        self.inner.read_documents_page(cursor, limit)
    }
}

/// Resolves through `inner` except for `bad_path`.
pub struct FailingProvider {
    pub inner: Arc<InMemoryNodeStore>,
    pub bad_path: String,
}

impl NodeStateProvider for FailingProvider {
    fn resolve_node_state(&self, path: &str, revision: Revision) -> Result<Option<NodeState>> {
        if path == self.bad_path {
            bail!("malformed node state at {path}");
        }
        self.inner.resolve_node_state(path, revision)
    }

    fn bundled_children(&self, state: &NodeState) -> Result<Vec<NodeState>> {
        self.inner.bundled_children(state)
    }
}

/// A store that never runs out of documents.
pub struct EndlessStore;

impl DocumentStore for EndlessStore {
    fn read_documents_page(&self, cursor: Option<&str>, limit: usize) -> Result<DocumentPage> {
        let start: u64 = match cursor {
            Some(c) => c.trim_start_matches("1:/n").parse::<u64>()? + 1,
            None => 0,
        };
        let documents: Vec<RawDocument> = (start..start + limit as u64)
            .map(|i| RawDocument::new(format!("1:/n{i:012}"), Map::new()))
            .collect();
        let next_cursor = documents.last().map(|d| d.id.clone());
        Ok(DocumentPage {
            documents,
            next_cursor,
        })
    }
}

impl NodeStateProvider for EndlessStore {
    fn resolve_node_state(&self, path: &str, _revision: Revision) -> Result<Option<NodeState>> {
        Ok(Some(NodeState::new(path, BTreeMap::new())))
    }

    fn bundled_children(&self, _state: &NodeState) -> Result<Vec<NodeState>> {
        Ok(Vec::new())
    }
}
