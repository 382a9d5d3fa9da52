//! # CLI - flat file builder
//!
//! Builds a path-sorted flat file from a JSON-lines document dump using the
//! pipelined external sort, then re-reads the result to confirm its order.
//!
//! ## Input
//!
//! One document per line, in the store's native shape:
//!
//! ```text
//! {"_id":"1:/content","_modified":1700000000,"title":"Content"}
//! {"_id":"2:/content/page","_bundled":{"jcr:content":{"title":"Page"}}}
//! {"_id":"1:/old","_deleted":true}
//! ```
//!
//! ## Configuration
//!
//! Settings come from environment variables. Pipeline sizing uses the
//! `FLATFILE_*` variables read by [`config::PipelineConfig::from_env`]; the
//! binary adds:
//!
//! ```text
//! FLATFILE_INPUT      JSON-lines document dump                  (required)
//! FLATFILE_REVISION   revision to read nodes at                 (default: latest)
//! FLATFILE_INCLUDE    comma-separated subtrees to keep          (default: all)
//! FLATFILE_EXCLUDE    comma-separated subtrees to drop          (default: none)
//! FLATFILE_CACHE_DOCS document cache capacity, 0 disables it    (default: 10000)
//! RUST_LOG            log filter                                (default: "info")
//! ```
//!
//! ## Example
//!
//! ```text
//! $ FLATFILE_INPUT=docs.jsonl FLATFILE_WORK_DIR=/tmp/ff cargo run -p cli
//! wrote 3 entries from 3 documents (2 spill files) to /tmp/ff/store-sorted.ffs
//! verified 3 entries in order
//! ```

mod load;

use anyhow::{Context, Result};
use config::PipelineConfig;
use pipeline::{
    AcceptAll, DocumentCache, InMemoryDocumentCache, NoDocumentCache, PathFilter, PathPredicate,
    PipelinedStrategy, Revision,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Document cache capacity from `FLATFILE_CACHE_DOCS`; 0 disables the cache.
fn cache_capacity<F>(lookup: &F) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    config::parse_or(lookup, "FLATFILE_CACHE_DOCS", DEFAULT_CACHE_DOCS)
}

const DEFAULT_CACHE_DOCS: usize = 10_000;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let input = std::env::var("FLATFILE_INPUT")
        .map(PathBuf::from)
        .context("FLATFILE_INPUT must name a JSON-lines document dump")?;
    let revision = match std::env::var("FLATFILE_REVISION") {
        Ok(raw) => Revision(
            raw.trim()
                .parse()
                .with_context(|| format!("FLATFILE_REVISION is not a number: {raw}"))?,
        ),
        Err(_) => Revision(u64::MAX),
    };
    let cache_docs = cache_capacity(&|key: &str| std::env::var(key).ok());
    let included = load::path_list(&env_or("FLATFILE_INCLUDE", ""));
    let excluded = load::path_list(&env_or("FLATFILE_EXCLUDE", ""));
    let config = PipelineConfig::from_env();

    let cache: Arc<dyn DocumentCache> = if cache_docs == 0 {
        Arc::new(NoDocumentCache)
    } else {
        Arc::new(InMemoryDocumentCache::new(cache_docs))
    };
    let predicate: Arc<dyn PathPredicate> = if included.is_empty() && excluded.is_empty() {
        Arc::new(AcceptAll)
    } else {
        Arc::new(PathFilter::new(included, excluded))
    };

    let store = Arc::new(load::load_file(&input)?.with_cache(Arc::clone(&cache)));
    tracing::info!(input = %input.display(), documents = store.len(), "loaded document dump");

    let strategy = PipelinedStrategy::new(config, store.clone(), store, cache, predicate, revision);
    let outcome = strategy.create_sorted_store_file()?;
    println!(
        "wrote {} entries from {} documents ({} spill files) to {}",
        outcome.entry_count,
        outcome.documents,
        outcome.spill_files,
        outcome.output.display()
    );

    let verified = spill::check_sorted(&outcome.output)?;
    println!("verified {verified} entries in order");
    Ok(())
}
