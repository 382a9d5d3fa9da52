//! In-memory document store, used by the CLI for JSON-lines dumps and by
//! tests.
//!
//! Documents follow a small convention:
//!
//! - `_created`: revision at which the node appeared (default 0).
//! - `_deleted`: `true`, or the revision at which the node was removed.
//! - `_bundled`: object of child name to child fields; children may bundle
//!   their own children the same way.
//! - Every field not starting with `_` is a node property.

use anyhow::{bail, Result};
use entry::path::concat;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::store::{
    DocumentCache, DocumentPage, DocumentStore, NodeState, NodeStateProvider, RawDocument, Revision,
};

const CREATED_FIELD: &str = "_created";
const DELETED_FIELD: &str = "_deleted";
const BUNDLED_FIELD: &str = "_bundled";

/// Documents keyed by id, with a path index.
///
/// Pages are served in id order, which is the order a real store's primary
/// index would give.
#[derive(Default)]
pub struct InMemoryNodeStore {
    docs: BTreeMap<String, RawDocument>,
    by_path: HashMap<String, String>,
    cache: Option<Arc<dyn DocumentCache>>,
    fetches: AtomicU64,
}

impl InMemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from `docs`. Fails on a document whose id yields no
    /// path.
    pub fn from_documents<I>(docs: I) -> Result<Self>
    where
        I: IntoIterator<Item = RawDocument>,
    {
        let mut store = Self::new();
        for doc in docs {
            store.insert(doc)?;
        }
        Ok(store)
    }

    /// Consults `cache` before the document map when resolving node states.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn DocumentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn insert(&mut self, doc: RawDocument) -> Result<()> {
        // Split documents carry no node of their own.
        if !doc.is_split_document() {
            let Some(path) = doc.path() else {
                bail!("document {} has no resolvable path", doc.id);
            };
            self.by_path.insert(path.to_string(), doc.id.clone());
        }
        self.docs.insert(doc.id.clone(), doc);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Lookups that missed the cache and went to the document map.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    fn document_at(&self, path: &str) -> Option<RawDocument> {
        let id = self.by_path.get(path)?;
        if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(id)) {
            return Some(cached);
        }
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.docs.get(id).cloned()
    }
}

impl fmt::Debug for InMemoryNodeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryNodeStore")
            .field("documents", &self.docs.len())
            .field("cached", &self.cache.is_some())
            .field("fetches", &self.fetch_count())
            .finish()
    }
}

impl DocumentStore for InMemoryNodeStore {
    fn read_documents_page(&self, cursor: Option<&str>, limit: usize) -> Result<DocumentPage> {
        let lower = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Unbounded,
        };
        let documents: Vec<RawDocument> = self
            .docs
            .range::<str, _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, d)| d.clone())
            .collect();
        let next_cursor = if documents.len() < limit {
            None
        } else {
            documents.last().map(|d| d.id.clone())
        };
        Ok(DocumentPage {
            documents,
            next_cursor,
        })
    }
}

impl NodeStateProvider for InMemoryNodeStore {
    fn resolve_node_state(&self, path: &str, revision: Revision) -> Result<Option<NodeState>> {
        let Some(doc) = self.document_at(path) else {
            return Ok(None);
        };
        if !visible_at(&doc.fields, revision)? {
            return Ok(None);
        }
        Ok(Some(NodeState::new(path, properties(&doc.fields))))
    }

    fn bundled_children(&self, state: &NodeState) -> Result<Vec<NodeState>> {
        let mut out = Vec::new();
        if let Some(doc) = self.document_at(&state.path) {
            collect_bundled(&state.path, &doc.fields, &mut out)?;
        }
        Ok(out)
    }
}

fn visible_at(fields: &Map<String, Value>, revision: Revision) -> Result<bool> {
    let created = match fields.get(CREATED_FIELD) {
        None => 0,
        Some(v) => match v.as_u64() {
            Some(r) => r,
            None => bail!("{CREATED_FIELD} must be a revision number, got {v}"),
        },
    };
    if created > revision.0 {
        return Ok(false);
    }
    let deleted = match fields.get(DELETED_FIELD) {
        None | Some(Value::Bool(false)) => false,
        Some(Value::Bool(true)) => true,
        Some(v) => match v.as_u64() {
            Some(r) => r <= revision.0,
            None => bail!("{DELETED_FIELD} must be a bool or a revision number, got {v}"),
        },
    };
    Ok(!deleted)
}

fn properties(fields: &Map<String, Value>) -> BTreeMap<String, Value> {
    fields
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Pre-order walk of the `_bundled` tree below `fields`.
fn collect_bundled(parent: &str, fields: &Map<String, Value>, out: &mut Vec<NodeState>) -> Result<()> {
    let Some(bundled) = fields.get(BUNDLED_FIELD) else {
        return Ok(());
    };
    let Some(children) = bundled.as_object() else {
        bail!("{BUNDLED_FIELD} of {parent} must be an object");
    };
    for (name, child) in children {
        let Some(child_fields) = child.as_object() else {
            bail!("bundled child {name} of {parent} must be an object");
        };
        let path = concat(parent, name);
        out.push(NodeState::new(path.clone(), properties(child_fields)));
        collect_bundled(&path, child_fields, out)?;
    }
    Ok(())
}
