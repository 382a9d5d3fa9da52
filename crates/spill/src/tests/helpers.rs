use batch::NodeStateEntryBatch;
use entry::{encode_body, write_entry, NodeStateEntry, RecordReader};
use std::path::{Path, PathBuf};

use crate::SpillWriter;

pub fn entry_for(path: &str, tag: &str) -> NodeStateEntry {
    NodeStateEntry::new(path, format!("{{\"tag\":\"{tag}\"}}").into_bytes())
}

/// Fills a batch with `paths` (in the given, unsorted order).
pub fn batch_of(paths: &[&str]) -> NodeStateEntryBatch {
    let mut batch = NodeStateEntryBatch::new(64 * 1024, 1000);
    let mut body = Vec::new();
    for p in paths {
        body.clear();
        encode_body(&entry_for(p, "b"), &mut body).unwrap();
        batch.add_entry(p, &body).unwrap();
    }
    batch
}

/// Writes a spill file through the real writer.
pub fn spill(dir: &Path, name: &str, paths: &[&str]) -> PathBuf {
    let path = dir.join(name);
    let mut batch = batch_of(paths);
    SpillWriter::write_batch(&path, &mut batch).unwrap();
    path
}

/// Writes records in exactly the given order, bypassing the sort.
pub fn raw_file(dir: &Path, name: &str, entries: &[NodeStateEntry]) -> PathBuf {
    let path = dir.join(name);
    let mut data = Vec::new();
    for e in entries {
        write_entry(&mut data, e).unwrap();
    }
    std::fs::write(&path, data).unwrap();
    path
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
