use crossbeam_channel::{bounded, unbounded, Sender};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use batch::{BufferPool, CancellationToken};
use config::PipelineConfig;
use spill::MergeStats;

use crate::download::{DownloadResult, DownloadTask};
use crate::merge::MergeTask;
use crate::sort::{SortResult, SortTask, SpillFile};
use crate::store::{DocumentCache, DocumentStore, NodeStateProvider, PathPredicate, Revision};
use crate::transform::{TransformContext, TransformResult, TransformTask};
use crate::PipelineError;

/// Subdirectory of the work directory holding spill files.
pub const SPILL_DIR_NAME: &str = "spill";

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub output: PathBuf,
    pub entry_count: u64,
    pub documents: u64,
    pub split_documents: u64,
    pub spill_files: usize,
    pub merge: MergeStats,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Download,
    Transform(usize),
    Sort(usize),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Download => write!(f, "download"),
            Stage::Transform(i) => write!(f, "transform-{i}"),
            Stage::Sort(i) => write!(f, "sort-{i}"),
        }
    }
}

enum StageOutput {
    Download(DownloadResult),
    Transform(TransformResult),
    Sort(SortResult),
}

type Completion = (Stage, Result<StageOutput, PipelineError>);

/// Cancels the pipeline if a stage thread unwinds, so its peers never wait
/// on a queue the dead thread would have fed.
struct CancelOnPanic(CancellationToken);

impl Drop for CancelOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.cancel();
        }
    }
}

/// Wires the stages together, runs them and merges their output.
///
/// ```text
/// create_sorted_store_file()
///   ├─ validate config, create <work_dir>/spill
///   ├─ spawn: 1 download, N transform, M sort threads
///   ├─ wait for every completion (first failure cancels the rest)
///   └─ merge spill files → <work_dir>/<output_file_name>
/// ```
pub struct PipelinedStrategy {
    config: PipelineConfig,
    store: Arc<dyn DocumentStore>,
    provider: Arc<dyn NodeStateProvider>,
    cache: Arc<dyn DocumentCache>,
    predicate: Arc<dyn PathPredicate>,
    revision: Revision,
    cancel: CancellationToken,
}

impl PipelinedStrategy {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn DocumentStore>,
        provider: Arc<dyn NodeStateProvider>,
        cache: Arc<dyn DocumentCache>,
        predicate: Arc<dyn PathPredicate>,
        revision: Revision,
    ) -> Self {
        Self {
            config,
            store,
            provider,
            cache,
            predicate,
            revision,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts a running [`create_sorted_store_file`] from another
    /// thread. The run then fails with [`PipelineError::Cancelled`].
    ///
    /// [`create_sorted_store_file`]: PipelinedStrategy::create_sorted_store_file
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn spill_dir(&self) -> PathBuf {
        self.config.work_dir.join(SPILL_DIR_NAME)
    }

    /// Runs the whole pipeline and returns the path of the sorted flat file.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure. Errors that merely report the
    /// resulting shutdown (`Cancelled`, closed queues) are logged, not
    /// returned. No output file exists after a failure; spill files written
    /// before it stay in the spill directory.
    pub fn create_sorted_store_file(&self) -> Result<PipelineOutcome, PipelineError> {
        let start = Instant::now();
        self.config.validate()?;
        let spill_dir = self.spill_dir();
        fs::create_dir_all(&spill_dir)?;

        tracing::info!(
            revision = %self.revision,
            transform_threads = self.config.transform_threads,
            sort_threads = self.config.sort_threads,
            buffers = self.config.buffer_count,
            buffer_bytes = self.config.buffer_size_bytes,
            memory_bytes = self.config.buffer_memory_bytes(),
            "starting flat file pipeline"
        );

        let (transforms, sorts) = self.run_stages(&spill_dir)?;

        let documents = transforms.iter().map(|t| t.documents_processed).sum();
        let split_documents = transforms.iter().map(|t| t.split_documents).sum();
        let entry_count: u64 = transforms.iter().map(|t| t.entry_count).sum();

        let spill_files = in_spill_order(sorts.into_iter().flat_map(|s| s.spill_files).collect());
        let spill_count = spill_files.len();

        let output = self.config.output_path();
        let merge = MergeTask::new(spill_files, &output, !self.config.keep_spill_files).run()?;
        if merge.entries != entry_count {
            return Err(PipelineError::Merge(anyhow::anyhow!(
                "merged {} entries, expected {entry_count}",
                merge.entries
            )));
        }
        if !self.config.keep_spill_files {
            remove_dir_if_empty(&spill_dir);
        }

        let elapsed = start.elapsed();
        tracing::info!(
            output = %output.display(),
            documents,
            entries = entry_count,
            spill_files = spill_count,
            elapsed_ms = elapsed.as_millis() as u64,
            "flat file complete"
        );
        Ok(PipelineOutcome {
            output,
            entry_count,
            documents,
            split_documents,
            spill_files: spill_count,
            merge,
            elapsed,
        })
    }

    /// Spawns every stage and waits for all of them.
    fn run_stages(&self, spill_dir: &Path) -> Result<(Vec<TransformResult>, Vec<SortResult>), PipelineError> {
        let cfg = &self.config;
        let (doc_tx, doc_rx) = bounded(cfg.doc_queue_capacity);
        let (transform_side, sort_side) =
            BufferPool::new(cfg.buffer_count, cfg.buffer_size_bytes, cfg.max_entries_per_buffer).split();
        let (done_tx, done_rx) = unbounded::<Completion>();
        let spill_seq = Arc::new(AtomicUsize::new(0));
        let ctx = TransformContext {
            provider: Arc::clone(&self.provider),
            cache: Arc::clone(&self.cache),
            predicate: Arc::clone(&self.predicate),
            revision: self.revision,
        };

        thread::scope(|scope| {
            let mut handles = Vec::new();
            let mut spawn_error: Option<PipelineError> = None;

            let mut spawn = |stage: Stage, job: Box<dyn FnOnce() -> Result<StageOutput, PipelineError> + Send>| {
                let done = done_tx.clone();
                let guard = CancelOnPanic(self.cancel.clone());
                let spawned = thread::Builder::new()
                    .name(format!("ffs-{stage}"))
                    .spawn_scoped(scope, move || {
                        let _guard = guard;
                        let span = tracing::info_span!("stage", name = %stage);
                        let _enter = span.enter();
                        let result = job();
                        report(&done, stage, result);
                    });
                match spawned {
                    Ok(h) => handles.push((stage, h)),
                    Err(e) => {
                        self.cancel.cancel();
                        spawn_error.get_or_insert(PipelineError::Setup(e));
                    }
                }
            };

            let download = DownloadTask::new(
                Arc::clone(&self.store),
                cfg.page_size,
                cfg.download_batch_size,
                doc_tx,
                self.cancel.clone(),
            );
            spawn(Stage::Download, Box::new(move || download.run().map(StageOutput::Download)));

            for worker in 0..cfg.transform_threads {
                let task = TransformTask::new(
                    worker,
                    ctx.clone(),
                    doc_rx.clone(),
                    transform_side.clone(),
                    self.cancel.clone(),
                );
                spawn(Stage::Transform(worker), Box::new(move || task.run().map(StageOutput::Transform)));
            }

            for worker in 0..cfg.sort_threads {
                let task = SortTask::new(
                    worker,
                    sort_side.clone(),
                    spill_dir.to_path_buf(),
                    Arc::clone(&spill_seq),
                    self.cancel.clone(),
                );
                spawn(Stage::Sort(worker), Box::new(move || task.run().map(StageOutput::Sort)));
            }
            drop(spawn);

            // Only stage threads may hold queue handles, or the queues never
            // close and the run never ends.
            drop(doc_rx);
            drop(transform_side);
            drop(sort_side);
            drop(done_tx);

            self.collect(done_rx, handles, spawn_error)
        })
    }

    fn collect(
        &self,
        done_rx: crossbeam_channel::Receiver<Completion>,
        handles: Vec<(Stage, thread::ScopedJoinHandle<'_, ()>)>,
        spawn_error: Option<PipelineError>,
    ) -> Result<(Vec<TransformResult>, Vec<SortResult>), PipelineError> {
        let mut first_error = spawn_error;
        let mut transforms = Vec::new();
        let mut sorts = Vec::new();

        for (stage, result) in done_rx.iter() {
            match result {
                Ok(StageOutput::Download(d)) => {
                    tracing::debug!(documents = d.documents, "download stage done");
                }
                Ok(StageOutput::Transform(t)) => transforms.push(t),
                Ok(StageOutput::Sort(s)) => sorts.push(s),
                Err(e) => {
                    self.cancel.cancel();
                    if e.is_secondary() {
                        tracing::debug!(%stage, error = %e, "stage stopped");
                    } else if first_error.is_none() {
                        tracing::error!(%stage, error = %e, "stage failed, cancelling pipeline");
                        first_error = Some(e);
                    } else {
                        tracing::warn!(%stage, error = %e, "further stage failure");
                    }
                }
            }
        }

        for (stage, handle) in handles {
            if handle.join().is_err() {
                tracing::error!(%stage, "stage thread panicked");
                first_error.get_or_insert(PipelineError::Panicked {
                    stage: stage.to_string(),
                });
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok((transforms, sorts))
    }
}

fn report(done: &Sender<Completion>, stage: Stage, result: Result<StageOutput, PipelineError>) {
    // The supervisor outlives every stage; a failed send means it is gone.
    let _ = done.send((stage, result));
}

/// Orders spill files by spill sequence, so that on equal paths the merge
/// favours the file spilled first whichever sort worker wrote it.
pub(crate) fn in_spill_order(mut files: Vec<SpillFile>) -> Vec<PathBuf> {
    files.sort_unstable_by_key(|f| f.seq);
    files.into_iter().map(|f| f.path).collect()
}

fn remove_dir_if_empty(dir: &Path) {
    let empty = fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(false);
    if empty {
        if let Err(e) = fs::remove_dir(dir) {
            tracing::debug!(dir = %dir.display(), error = %e, "could not remove spill directory");
        }
    }
}
