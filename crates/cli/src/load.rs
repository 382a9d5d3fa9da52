use anyhow::{Context, Result};
use pipeline::{InMemoryNodeStore, RawDocument};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Loads a JSON-lines document dump: one document object per line.
///
/// Blank lines and lines starting with `#` are skipped.
pub fn load_documents<R: BufRead>(reader: R) -> Result<InMemoryNodeStore> {
    let mut store = InMemoryNodeStore::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let doc: RawDocument =
            serde_json::from_str(text).with_context(|| format!("line {}: invalid document", i + 1))?;
        store
            .insert(doc)
            .with_context(|| format!("line {}", i + 1))?;
    }
    Ok(store)
}

pub fn load_file(path: &Path) -> Result<InMemoryNodeStore> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    load_documents(BufReader::new(file))
}

/// Splits a comma-separated path list, dropping empty items.
pub fn path_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
