//! Local→global record id rewrite over the persisted match results.

use std::path::PathBuf;

use pdca_core::{apply_batch_offset, JobKind, PayloadError};
use pdca_storage::ArtifactStore;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{path} was written with batch size {found}, expected {expected}")]
    BatchSizeMismatch {
        path: PathBuf,
        found: usize,
        expected: usize,
    },
    #[error("{path}: {source}")]
    Payload {
        path: PathBuf,
        #[source]
        source: PayloadError,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Files for batches > 0, written with shifted ids.
    pub files_rewritten: usize,
    /// Batch 0 files, copied with their ids unchanged.
    pub files_unshifted: usize,
    pub rows_shifted: usize,
}

/// For every raw match file, writes the reconciled sibling with
/// `record_id + batch_number * batch_size`.
///
/// Only the raw files are read, so running this again produces the same output.
pub async fn reconcile(store: &ArtifactStore) -> Result<ReconcileSummary, ReconcileError> {
    let layout = store.layout();
    let expected = layout.batch_size();
    let mut summary = ReconcileSummary::default();

    for file in store
        .list_batch_files(&layout.raw_match_dir(), JobKind::Match)
        .await?
    {
        if file.name.batch_size != expected {
            return Err(ReconcileError::BatchSizeMismatch {
                path: file.path,
                found: file.name.batch_size,
                expected,
            });
        }
        let batch_number = file.name.batch_number;
        let mut document = store.read_document(&file.path).await?;
        let shifted = apply_batch_offset(&mut document, batch_number, expected).map_err(
            |source| ReconcileError::Payload {
                path: file.path.clone(),
                source,
            },
        )?;

        let target = layout.reconciled_match_file(batch_number);
        store.write_json(&target, &document, true).await?;
        if batch_number == 0 {
            summary.files_unshifted += 1;
        } else {
            summary.files_rewritten += 1;
            summary.rows_shifted += shifted;
        }
        debug!(batch = batch_number, rows = shifted, path = %target.display(), "reconciled");
    }

    info!(
        rewritten = summary.files_rewritten,
        unshifted = summary.files_unshifted,
        rows = summary.rows_shifted,
        "record ids reconciled"
    );
    Ok(summary)
}
