use anyhow::Result;
use config::{ConfigError, PipelineConfig};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

use super::helpers::*;
use crate::*;

// -------------------- End to end --------------------

#[test]
fn builds_sorted_flat_file() -> Result<()> {
    let dir = tempdir()?;
    let store = store_of(vec![
        doc("/c", json!({"n": 3})).with_modified(30),
        doc("/a/b", json!({"n": 2})),
        doc("/a", json!({"n": 1})),
    ]);
    let outcome = strategy_for(small_config(dir.path()), store).create_sorted_store_file()?;

    assert_eq!(outcome.entry_count, 3);
    assert_eq!(outcome.documents, 3);
    assert!(outcome.spill_files >= 2, "max 2 entries per buffer forces two spills");
    assert_eq!(read_paths(&outcome.output), vec!["/a", "/a/b", "/c"]);

    let entries = read_entries(&outcome.output);
    assert_eq!(entries[2].payload_str(), Some(r#"{"n":3}"#));
    assert_eq!(entries[2].last_modified, Some(30));
    assert_eq!(entries[2].id.as_deref(), Some("1:/c"));
    Ok(())
}

#[test]
fn hierarchical_order_beats_byte_order() -> Result<()> {
    let dir = tempdir()?;
    let store = store_of(vec![
        doc("/a-b", json!({})),
        doc("/a", json!({})),
        doc("/a/b", json!({})),
    ]);
    let outcome = strategy_for(small_config(dir.path()), store).create_sorted_store_file()?;
    assert_eq!(read_paths(&outcome.output), vec!["/a", "/a/b", "/a-b"]);
    Ok(())
}

#[test]
fn long_path_documents_are_included() -> Result<()> {
    let dir = tempdir()?;
    let long_path = format!("/content/{}", "x".repeat(40));
    let store = store_of(vec![
        doc("/content", json!({})),
        RawDocument::new("2:h3f9a", fields(json!({"_path": long_path, "n": 7}))).with_modified(12),
        doc("/content/z", json!({})),
    ]);
    let outcome = strategy_for(small_config(dir.path()), store).create_sorted_store_file()?;

    assert_eq!(outcome.entry_count, 3);
    assert_eq!(read_paths(&outcome.output), vec!["/content".to_string(), long_path.clone(), "/content/z".to_string()]);
    let entries = read_entries(&outcome.output);
    assert_eq!(entries[1].id.as_deref(), Some("2:h3f9a"));
    assert_eq!(entries[1].payload_str(), Some(r#"{"n":7}"#));
    assert_eq!(entries[1].last_modified, Some(12));
    Ok(())
}

#[test]
fn every_entry_appears_exactly_once() -> Result<()> {
    let dir = tempdir()?;
    let paths: Vec<String> = (0..500).map(|i| format!("/p{}/n{}", i % 13, i)).collect();
    let store = store_of(paths.iter().map(|p| doc(p, json!({"v": p}))).collect());
    let config = PipelineConfig {
        transform_threads: 4,
        sort_threads: 2,
        buffer_count: 5,
        max_entries_per_buffer: 7,
        page_size: 50,
        download_batch_size: 9,
        ..small_config(dir.path())
    };
    let outcome = strategy_for(config, store).create_sorted_store_file()?;

    assert_eq!(outcome.entry_count, 500);
    assert_eq!(spill::check_sorted(&outcome.output)?, 500);
    let got: BTreeSet<String> = read_paths(&outcome.output).into_iter().collect();
    let want: BTreeSet<String> = paths.into_iter().collect();
    assert_eq!(got, want);
    Ok(())
}

#[test]
fn empty_store_gives_empty_file() -> Result<()> {
    let dir = tempdir()?;
    let outcome = strategy_for(small_config(dir.path()), store_of(Vec::new())).create_sorted_store_file()?;
    assert_eq!(outcome.entry_count, 0);
    assert_eq!(outcome.spill_files, 0);
    assert!(outcome.output.exists());
    assert!(read_paths(&outcome.output).is_empty());
    Ok(())
}

// -------------------- Content rules --------------------

#[test]
fn deleted_and_future_nodes_are_absent() -> Result<()> {
    let dir = tempdir()?;
    let store = store_of(vec![
        doc("/kept", json!({})),
        doc("/deleted", json!({"_deleted": true})),
        doc("/future", json!({"_created": 99})),
    ]);
    let outcome = strategy_for(small_config(dir.path()), store).create_sorted_store_file()?;
    assert_eq!(read_paths(&outcome.output), vec!["/kept"]);
    assert_eq!(outcome.documents, 3);
    Ok(())
}

#[test]
fn bundled_nodes_become_entries() -> Result<()> {
    let dir = tempdir()?;
    let store = store_of(vec![
        doc("/page", json!({"_bundled": {"jcr:content": {"title": "t"}}})),
        doc("/other", json!({})),
    ]);
    let outcome = strategy_for(small_config(dir.path()), store).create_sorted_store_file()?;
    assert_eq!(read_paths(&outcome.output), vec!["/other", "/page", "/page/jcr:content"]);

    let entries = read_entries(&outcome.output);
    assert_eq!(entries[2].payload_str(), Some(r#"{"title":"t"}"#));
    assert_eq!(entries[2].id.as_deref(), Some("1:/page"), "bundled entries carry the parent id");
    Ok(())
}

#[test]
fn hidden_paths_and_predicate_filter_entries() -> Result<()> {
    let dir = tempdir()?;
    let store = store_of(vec![
        doc("/:index", json!({})),
        doc("/content/:hidden", json!({})),
        doc("/content/site", json!({})),
        doc("/content/private/x", json!({})),
        doc("/apps/a", json!({})),
    ]);
    let strategy = PipelinedStrategy::new(
        small_config(dir.path()),
        store.clone(),
        store,
        Arc::new(NoDocumentCache),
        Arc::new(PathFilter::new(vec!["/content".into()], vec!["/content/private".into()])),
        Revision(10),
    );
    let outcome = strategy.create_sorted_store_file()?;
    assert_eq!(read_paths(&outcome.output), vec!["/content/site"]);
    Ok(())
}

#[test]
fn split_documents_are_counted_not_written() -> Result<()> {
    let dir = tempdir()?;
    let store = store_of(vec![
        doc("/a", json!({})),
        RawDocument::new("3:p/a/r1-0-1", fields(json!({"_sdType": 40}))),
    ]);
    let outcome = strategy_for(small_config(dir.path()), store).create_sorted_store_file()?;
    assert_eq!(outcome.split_documents, 1);
    assert_eq!(read_paths(&outcome.output), vec!["/a"]);
    Ok(())
}

#[test]
fn documents_are_cached_for_the_provider() -> Result<()> {
    let dir = tempdir()?;
    let cache = Arc::new(InMemoryDocumentCache::new(1024));
    let docs = (0..20).map(|i| doc(&format!("/n{i}"), json!({}))).collect::<Vec<_>>();
    let store = Arc::new(InMemoryNodeStore::from_documents(docs)?.with_cache(cache.clone()));
    let strategy = PipelinedStrategy::new(
        small_config(dir.path()),
        store.clone(),
        store.clone(),
        cache.clone(),
        Arc::new(AcceptAll),
        Revision(10),
    );
    strategy.create_sorted_store_file()?;
    assert_eq!(cache.len(), 20);
    assert_eq!(store.fetch_count(), 0, "every lookup hit the cache");
    Ok(())
}

// -------------------- Files --------------------

#[test]
fn spill_files_removed_unless_kept() -> Result<()> {
    let dir = tempdir()?;
    let docs = || (0..6).map(|i| doc(&format!("/n{i}"), json!({}))).collect::<Vec<_>>();

    let strategy = strategy_for(small_config(dir.path()), store_of(docs()));
    strategy.create_sorted_store_file()?;
    assert!(files_with_extension(&strategy.spill_dir(), "ffs").is_empty());

    let kept_dir = tempdir()?;
    let config = PipelineConfig {
        keep_spill_files: true,
        ..small_config(kept_dir.path())
    };
    let strategy = strategy_for(config, store_of(docs()));
    let outcome = strategy.create_sorted_store_file()?;
    let spills = files_with_extension(&strategy.spill_dir(), "ffs");
    assert_eq!(spills.len(), outcome.spill_files);
    for f in spills {
        assert!(spill::check_sorted(&f)? > 0);
    }
    Ok(())
}

#[test]
fn invalid_config_is_rejected_before_work() -> Result<()> {
    let dir = tempdir()?;
    let config = PipelineConfig {
        transform_threads: 0,
        ..small_config(dir.path())
    };
    let err = strategy_for(config, store_of(Vec::new())).create_sorted_store_file().unwrap_err();
    assert!(matches!(err, PipelineError::Config(ConfigError::Zero("transform_threads"))));
    Ok(())
}

#[test]
fn spill_files_merge_in_sequence_order() {
    let file = |seq: usize| SpillFile {
        seq,
        path: PathBuf::from(format!("spill-{seq:06}.ffs")),
    };
    let ordered = crate::strategy::in_spill_order(vec![file(1_000_000), file(2), file(999_999), file(0)]);
    assert_eq!(
        ordered,
        vec![
            PathBuf::from("spill-000000.ffs"),
            PathBuf::from("spill-000002.ffs"),
            PathBuf::from("spill-999999.ffs"),
            PathBuf::from("spill-1000000.ffs"),
        ]
    );
}

// -------------------- Failures --------------------

#[test]
fn download_failure_aborts_run() -> Result<()> {
    let dir = tempdir()?;
    let inner = store_of((0..10).map(|i| doc(&format!("/n{i}"), json!({}))).collect());
    let store = Arc::new(FailingStore {
        inner: inner.clone(),
        fail_on_page: 2,
        pages: AtomicU64::new(0),
    });
    let config = small_config(dir.path());
    let output = config.output_path();
    let strategy = PipelinedStrategy::new(
        config,
        store,
        inner,
        Arc::new(NoDocumentCache),
        Arc::new(AcceptAll),
        Revision(10),
    );

    let err = strategy.create_sorted_store_file().unwrap_err();
    assert!(matches!(err, PipelineError::Download { .. }), "got {err}");
    assert!(err.to_string().contains("connection reset"));
    assert!(!output.exists());
    Ok(())
}

#[test]
fn transform_failure_names_the_document() -> Result<()> {
    let dir = tempdir()?;
    let store = store_of((0..10).map(|i| doc(&format!("/n{i}"), json!({}))).collect());
    let provider = Arc::new(FailingProvider {
        inner: store.clone(),
        bad_path: "/n4".into(),
    });
    let config = small_config(dir.path());
    let output = config.output_path();
    let strategy = PipelinedStrategy::new(
        config,
        store,
        provider,
        Arc::new(NoDocumentCache),
        Arc::new(AcceptAll),
        Revision(10),
    );

    match strategy.create_sorted_store_file() {
        Err(PipelineError::Transform { document, .. }) => assert_eq!(document, "1:/n4"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!output.exists());
    // Whatever was spilled before the failure is complete and sorted.
    for f in files_with_extension(&dir.path().join(SPILL_DIR_NAME), "ffs") {
        spill::check_sorted(&f)?;
    }
    Ok(())
}

#[test]
fn oversized_entry_fails_run() -> Result<()> {
    let dir = tempdir()?;
    let store = store_of(vec![doc("/a", json!({})), doc("/big", json!({"blob": "x".repeat(8192)}))]);
    let err = strategy_for(small_config(dir.path()), store).create_sorted_store_file().unwrap_err();
    assert!(matches!(err, PipelineError::EntryTooLarge { .. }), "got {err}");
    Ok(())
}

#[test]
fn external_cancel_stops_endless_run() -> Result<()> {
    let dir = tempdir()?;
    let endless = Arc::new(EndlessStore);
    let config = PipelineConfig {
        page_size: 100,
        download_batch_size: 10,
        max_entries_per_buffer: 50,
        ..small_config(dir.path())
    };
    let output = config.output_path();
    let strategy = PipelinedStrategy::new(
        config,
        endless.clone(),
        endless,
        Arc::new(NoDocumentCache),
        Arc::new(AcceptAll),
        Revision(1),
    );
    let token = strategy.cancellation_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        token.cancel();
    });

    let err = strategy.create_sorted_store_file().unwrap_err();
    canceller.join().unwrap();
    assert!(matches!(err, PipelineError::Cancelled), "got {err}");
    assert!(!output.exists());
    for f in files_with_extension(&dir.path().join(SPILL_DIR_NAME), "ffs") {
        spill::check_sorted(&f)?;
    }
    assert!(files_with_extension(&dir.path().join(SPILL_DIR_NAME), "tmp").is_empty());
    Ok(())
}
