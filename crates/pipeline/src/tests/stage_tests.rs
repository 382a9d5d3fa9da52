use anyhow::Result;
use batch::BufferPool;
use crossbeam_channel::bounded;
use entry::{decode_body, EntryWriter, NodeStateEntry, LENGTH_PREFIX_BYTES};
use serde_json::json;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

use super::helpers::*;
use crate::*;

fn context(store: Arc<InMemoryNodeStore>) -> TransformContext {
    TransformContext {
        provider: store,
        cache: Arc::new(NoDocumentCache),
        predicate: Arc::new(AcceptAll),
        revision: Revision(10),
    }
}

// -------------------- Download --------------------

#[test]
fn download_batches_pages_and_closes_queue() -> Result<()> {
    let store = store_of((0..7).map(|i| doc(&format!("/n{i}"), json!({}))).collect());
    let (tx, rx) = bounded(16);
    let result = DownloadTask::new(store, 3, 2, tx, CancellationToken::new()).run()?;

    assert_eq!(result.documents, 7);
    assert_eq!(result.pages, 3);
    let sizes: Vec<usize> = rx.iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![2, 2, 2, 1]);
    assert!(rx.recv().is_err(), "queue closed after the last batch");
    Ok(())
}

#[test]
fn download_failure_reports_cursor_and_cancels() {
    let inner = store_of((0..5).map(|i| doc(&format!("/n{i}"), json!({}))).collect());
    let store = Arc::new(FailingStore {
        inner,
        fail_on_page: 1,
        pages: Default::default(),
    });
    let (tx, _rx) = bounded(16);
    let cancel = CancellationToken::new();
    let err = DownloadTask::new(store, 2, 2, tx, cancel.clone()).run().unwrap_err();

    match err {
        PipelineError::Download { cursor, .. } => assert_eq!(cursor.as_deref(), Some("1:/n1")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(cancel.is_cancelled());
}

#[test]
fn download_stops_when_cancelled() {
    let (tx, _rx) = bounded(1);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    let handle = thread::spawn(move || DownloadTask::new(Arc::new(EndlessStore), 10, 10, tx, cancel).run());
    // The queue holds one batch, so the task soon blocks on a full queue.
    thread::sleep(std::time::Duration::from_millis(50));
    canceller.cancel();
    let err = handle.join().unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
}

// -------------------- Transform --------------------

#[test]
fn transform_rolls_over_full_buffers() -> Result<()> {
    let store = store_of(vec![
        doc("/a", json!({})),
        doc("/b", json!({})),
        doc("/c", json!({})),
    ]);
    let (doc_tx, doc_rx) = bounded(4);
    let (transform, sort) = BufferPool::new(2, 4096, 2).split();
    let cancel = CancellationToken::new();

    let mut page = store.read_documents_page(None, 10)?.documents;
    page.reverse();
    doc_tx.send(page)?;
    drop(doc_tx);

    let result = TransformTask::new(0, context(store), doc_rx, transform, cancel.clone()).run()?;
    assert_eq!(result.entry_count, 3);
    assert_eq!(result.documents_processed, 3);
    assert_eq!(result.batches_submitted, 2);

    let first = sort.next_full(&cancel)?.expect("first buffer");
    let second = sort.next_full(&cancel)?.expect("second buffer");
    assert_eq!((first.len(), second.len()), (2, 1));
    assert!(sort.next_full(&cancel)?.is_none());
    Ok(())
}

#[test]
fn transform_rolls_over_when_bytes_run_out() -> Result<()> {
    let filler = "x".repeat(40);
    let store = store_of(
        ["/a", "/b", "/c"]
            .into_iter()
            .map(|p| doc(p, json!({ "p": filler })))
            .collect(),
    );
    let sample = NodeStateEntry::new("/a", serde_json::to_vec(&json!({ "p": filler }))?).with_id("1:/a");
    let record = EntryWriter::new().serialize(&sample)?.len() + LENGTH_PREFIX_BYTES;
    // Two records fit; the third overflows the bytes long before the entry limit.
    let (transform, sort) = BufferPool::new(2, record * 2 + record / 2, 100).split();
    let (doc_tx, doc_rx) = bounded(4);
    let cancel = CancellationToken::new();

    doc_tx.send(store.read_documents_page(None, 10)?.documents)?;
    drop(doc_tx);

    let result = TransformTask::new(0, context(store), doc_rx, transform, cancel.clone()).run()?;
    assert_eq!(result.entry_count, 3);
    assert_eq!(result.batches_submitted, 2);

    let first = sort.next_full(&cancel)?.expect("first buffer");
    let second = sort.next_full(&cancel)?.expect("second buffer");
    assert_eq!(first.len(), 2);
    assert_eq!(first.size_bytes(), record * 2);

    let spilled: Vec<NodeStateEntry> = second
        .records()
        .map(|r| -> Result<NodeStateEntry> { Ok(decode_body(r?)?) })
        .collect::<Result<_>>()?;
    assert_eq!(spilled.len(), 1);
    assert_eq!(spilled[0].path, "/c");
    assert_eq!(spilled[0].id.as_deref(), Some("1:/c"));
    assert_eq!(spilled[0].payload, sample.payload);
    assert!(sort.next_full(&cancel)?.is_none());
    Ok(())
}

#[test]
fn transform_skips_split_documents() -> Result<()> {
    let store = store_of(vec![doc("/a", json!({}))]);
    let (doc_tx, doc_rx) = bounded(4);
    let (transform, sort) = BufferPool::new(1, 4096, 10).split();
    let cancel = CancellationToken::new();

    doc_tx.send(vec![
        doc("/a", json!({})),
        RawDocument::new("3:p/a/r1-0-1", fields(json!({"_sdType": 40}))),
    ])?;
    drop(doc_tx);

    let result = TransformTask::new(0, context(store), doc_rx, transform, cancel.clone()).run()?;
    assert_eq!(result.split_documents, 1);
    assert_eq!(result.entry_count, 1);
    assert_eq!(sort.next_full(&cancel)?.map(|b| b.len()), Some(1));
    Ok(())
}

#[test]
fn transform_with_no_entries_submits_nothing() -> Result<()> {
    let store = store_of(vec![doc("/gone", json!({"_deleted": true}))]);
    let (doc_tx, doc_rx) = bounded(4);
    let (transform, sort) = BufferPool::new(1, 4096, 10).split();
    let cancel = CancellationToken::new();

    doc_tx.send(store.read_documents_page(None, 10)?.documents)?;
    drop(doc_tx);

    let result = TransformTask::new(0, context(store), doc_rx, transform, cancel.clone()).run()?;
    assert_eq!(result.entry_count, 0);
    assert_eq!(result.batches_submitted, 0);
    assert!(sort.next_full(&cancel)?.is_none());
    Ok(())
}

#[test]
fn transform_rejects_entry_larger_than_buffer() -> Result<()> {
    let big = "x".repeat(1000);
    let store = store_of(vec![doc("/big", json!({ "blob": big }))]);
    let (doc_tx, doc_rx) = bounded(4);
    let (transform, _sort) = BufferPool::new(1, 256, 10).split();

    doc_tx.send(store.read_documents_page(None, 10)?.documents)?;
    drop(doc_tx);

    let err = TransformTask::new(0, context(store), doc_rx, transform, CancellationToken::new())
        .run()
        .unwrap_err();
    match err {
        PipelineError::EntryTooLarge { path, capacity, .. } => {
            assert_eq!(path, "/big");
            assert_eq!(capacity, 256);
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn transform_unblocks_on_cancel() {
    let store = store_of(Vec::new());
    let (_doc_tx, doc_rx) = bounded::<RawDocumentBatch>(4);
    let (transform, _sort) = BufferPool::new(1, 4096, 10).split();
    let cancel = CancellationToken::new();
    let task = TransformTask::new(0, context(store), doc_rx, transform, cancel.clone());

    let handle = thread::spawn(move || task.run());
    thread::sleep(std::time::Duration::from_millis(20));
    cancel.cancel();
    assert!(matches!(handle.join().unwrap(), Err(PipelineError::Cancelled)));
}

// -------------------- Sort --------------------

#[test]
fn sort_spills_each_full_buffer() -> Result<()> {
    let dir = tempdir()?;
    let (transform, sort) = BufferPool::new(2, 4096, 10).split();
    let cancel = CancellationToken::new();
    let mut writer = EntryWriter::new();

    for paths in [["/b", "/a"], ["/d", "/c"]] {
        let mut batch = transform.acquire_empty(&cancel)?;
        for p in paths {
            let body = writer.serialize(&NodeStateEntry::new(p, b"{}".to_vec()))?;
            batch.add_entry(p, body)?;
        }
        transform.submit_full(batch, &cancel)?;
    }
    drop(transform);

    let seq = Arc::new(AtomicUsize::new(0));
    let result = SortTask::new(0, sort, dir.path().to_path_buf(), seq, cancel).run()?;

    assert_eq!(result.entry_count, 4);
    assert_eq!(result.spill_files.len(), 2);
    assert_eq!(result.spill_files[0].seq, 0);
    assert!(result.spill_files[0].path.ends_with("spill-000000.ffs"));
    assert_eq!(result.spill_files[1].seq, 1);
    assert_eq!(read_paths(&result.spill_files[0].path), vec!["/a", "/b"]);
    assert_eq!(read_paths(&result.spill_files[1].path), vec!["/c", "/d"]);
    Ok(())
}
