//! Collaborators the pipeline reads from.
//!
//! The pipeline never talks to a database directly. It pages through raw
//! documents with a [`DocumentStore`], turns each one into node states with a
//! [`NodeStateProvider`], and hands every document to a [`DocumentCache`] so
//! the provider can skip re-fetching it.

use entry::path::{is_same_or_descendant, segments};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;

/// Field marking a split document (a continuation holding overflow history).
pub const SPLIT_DOC_TYPE_FIELD: &str = "_sdType";
/// Field holding the node path when the id is a hash (`<depth>:h...`).
pub const PATH_FIELD: &str = "_path";

/// One document as stored in the backing document store.
///
/// The id is `"<depth>:<path>"` (e.g. `2:/content/site`) for ordinary paths,
/// or `"<depth>:h<hash>"` for long paths, in which case the path lives in
/// the `_path` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    #[serde(rename = "_id")]
    pub id: String,
    /// Last-modified time in seconds, if tracked.
    #[serde(rename = "_modified", default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<i64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            modified: None,
            fields,
        }
    }

    /// Builds a document whose id is derived from `path`.
    pub fn for_path(path: &str, fields: Map<String, Value>) -> Self {
        Self::new(id_for_path(path), fields)
    }

    #[must_use]
    pub fn with_modified(mut self, modified: i64) -> Self {
        self.modified = Some(modified);
        self
    }

    /// The node path this document describes, or `None` if the id is
    /// malformed.
    pub fn path(&self) -> Option<&str> {
        let rest = match self.id.split_once(':') {
            Some((depth, rest)) => {
                depth.parse::<u32>().ok()?;
                rest
            }
            None if self.id.starts_with('h') => &self.id,
            None => return None,
        };
        if rest.starts_with('/') {
            return Some(rest);
        }
        if rest.starts_with('h') {
            return self
                .fields
                .get(PATH_FIELD)
                .and_then(Value::as_str)
                .filter(|p| p.starts_with('/'));
        }
        None
    }

    pub fn is_split_document(&self) -> bool {
        self.fields.contains_key(SPLIT_DOC_TYPE_FIELD)
    }
}

/// Returns the document id for `path`: its depth, a colon, then the path.
pub fn id_for_path(path: &str) -> String {
    format!("{}:{}", segments(path).count(), path)
}

/// A group of documents moved through the document queue as one message.
pub type RawDocumentBatch = Vec<RawDocument>;

/// One page of a store traversal.
#[derive(Debug, Clone, Default)]
pub struct DocumentPage {
    pub documents: Vec<RawDocument>,
    /// Cursor for the next page, `None` when the traversal is complete.
    pub next_cursor: Option<String>,
}

/// Paged, ordered traversal of every document in the store.
pub trait DocumentStore: Send + Sync {
    /// Reads up to `limit` documents after `cursor` (from the start when
    /// `None`).
    fn read_documents_page(&self, cursor: Option<&str>, limit: usize) -> anyhow::Result<DocumentPage>;
}

/// Snapshot revision at which node states are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A node of the content tree as seen at one revision.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub path: String,
    pub exists: bool,
    pub properties: BTreeMap<String, Value>,
}

impl NodeState {
    pub fn new(path: impl Into<String>, properties: BTreeMap<String, Value>) -> Self {
        Self {
            path: path.into(),
            exists: true,
            properties,
        }
    }

    /// The payload written to the flat file: the properties as a JSON object.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.properties)
    }
}

/// Resolves documents into node states.
pub trait NodeStateProvider: Send + Sync {
    /// Node state at `path` as of `revision`; `None` if absent.
    fn resolve_node_state(&self, path: &str, revision: Revision) -> anyhow::Result<Option<NodeState>>;

    /// Every node bundled into the document backing `state`, at any depth.
    fn bundled_children(&self, state: &NodeState) -> anyhow::Result<Vec<NodeState>>;
}

/// Best-effort document cache. Misses are fine; failures must not surface.
pub trait DocumentCache: Send + Sync {
    fn put(&self, doc: &RawDocument);
    fn get(&self, id: &str) -> Option<RawDocument>;
}

/// A cache that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDocumentCache;

impl DocumentCache for NoDocumentCache {
    fn put(&self, _doc: &RawDocument) {}

    fn get(&self, _id: &str) -> Option<RawDocument> {
        None
    }
}

/// Bounded in-memory cache. Once full, new documents are not admitted.
#[derive(Debug)]
pub struct InMemoryDocumentCache {
    docs: Mutex<HashMap<String, RawDocument>>,
    capacity: usize,
}

impl InMemoryDocumentCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentCache for InMemoryDocumentCache {
    fn put(&self, doc: &RawDocument) {
        let Ok(mut docs) = self.docs.lock() else {
            return;
        };
        if docs.len() >= self.capacity && !docs.contains_key(&doc.id) {
            tracing::trace!(id = %doc.id, "document cache full");
            return;
        }
        docs.insert(doc.id.clone(), doc.clone());
    }

    fn get(&self, id: &str) -> Option<RawDocument> {
        self.docs.lock().ok()?.get(id).cloned()
    }
}

/// Decides which paths reach the flat file.
pub trait PathPredicate: Send + Sync {
    fn accepts(&self, path: &str) -> bool;
}

impl<F> PathPredicate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn accepts(&self, path: &str) -> bool {
        self(path)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl PathPredicate for AcceptAll {
    fn accepts(&self, _path: &str) -> bool {
        true
    }
}

/// Subtree filter: a path passes if it lies under some included path (or
/// nothing is included) and under no excluded path.
#[derive(Debug, Default, Clone)]
pub struct PathFilter {
    included: Vec<String>,
    excluded: Vec<String>,
}

impl PathFilter {
    pub fn new(included: Vec<String>, excluded: Vec<String>) -> Self {
        Self { included, excluded }
    }
}

impl PathPredicate for PathFilter {
    fn accepts(&self, path: &str) -> bool {
        let included = self.included.is_empty()
            || self.included.iter().any(|inc| is_same_or_descendant(inc, path));
        included && !self.excluded.iter().any(|exc| is_same_or_descendant(exc, path))
    }
}
