use std::path::{Path, PathBuf};

use spill::{merge_spill_files, MergeStats};

use crate::PipelineError;

/// Final stage: merges every spill file into the output flat file.
pub struct MergeTask {
    files: Vec<PathBuf>,
    output: PathBuf,
    delete_inputs: bool,
}

impl MergeTask {
    /// `files` are merged in the order given; on equal paths the earlier
    /// file wins the tie.
    pub fn new(files: Vec<PathBuf>, output: &Path, delete_inputs: bool) -> Self {
        Self {
            files,
            output: output.to_path_buf(),
            delete_inputs,
        }
    }

    pub fn run(self) -> Result<MergeStats, PipelineError> {
        tracing::info!(
            files = self.files.len(),
            output = %self.output.display(),
            "merging spill files"
        );
        merge_spill_files(&self.files, &self.output, self.delete_inputs).map_err(|source| {
            tracing::error!(
                error = %source,
                "merge failed, spill files kept for retry"
            );
            PipelineError::Merge(source)
        })
    }
}
