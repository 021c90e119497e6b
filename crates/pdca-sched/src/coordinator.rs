use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pdca_client::RemoteJobClient;
use pdca_core::{number_of_batches, BatchSplitter, ProgressSnapshot};
use pdca_storage::{ArtifactStore, BatchLayout};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::scheduler::{FailedBatch, RunStats, Scheduler, SchedulerSettings};
use crate::{
    ceiling_label, export, load_input_rows, reconcile, ReconcileError, ReconcileSummary,
    RunConfig, SchedulerError,
};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_file: String,
    pub output_dir: String,
    pub total_rows: usize,
    pub batch_size: usize,
    pub number_of_batches: usize,
    pub finished_batches: usize,
    pub failed_batches: Vec<FailedBatch>,
    pub stats: RunStats,
    pub final_progress: ProgressSnapshot,
    pub manifest: String,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed_batches.is_empty()
    }
}

/// Reads the input once, drives the Scheduler to completion and records the run.
pub struct Coordinator {
    config: RunConfig,
    client: Arc<dyn RemoteJobClient>,
    store: ArtifactStore,
}

impl Coordinator {
    pub fn new(config: RunConfig, client: Arc<dyn RemoteJobClient>) -> Result<Self, SchedulerError> {
        config.validate()?;
        let layout = BatchLayout::new(
            &config.output_dir,
            config.match_schema,
            config.augment_schema,
            config.batch_size,
        );
        Ok(Self {
            config,
            client,
            store: ArtifactStore::new(layout),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Where the match and augment artifacts end up.
    pub fn output_dir(&self) -> &Path {
        self.store.layout().root()
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunSummary, SchedulerError> {
        self.run_with_observer(shutdown, |_| {}).await
    }

    /// Like [`Coordinator::run`], calling `observer` with every progress snapshot that changed.
    pub async fn run_with_observer<F>(
        &self,
        shutdown: CancellationToken,
        observer: F,
    ) -> Result<RunSummary, SchedulerError>
    where
        F: FnMut(&ProgressSnapshot),
    {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("pdca_run", %run_id);
        self.drive(run_id, shutdown, observer).instrument(span).await
    }

    async fn drive<F>(
        &self,
        run_id: Uuid,
        shutdown: CancellationToken,
        mut observer: F,
    ) -> Result<RunSummary, SchedulerError>
    where
        F: FnMut(&ProgressSnapshot),
    {
        let started_at = Utc::now();
        let config = &self.config;

        let rows = load_input_rows(&config.input_file).await?;
        let total_rows = rows.len();
        let batch_count = number_of_batches(total_rows, config.batch_size);
        let match_params = config.load_match_params().await?;
        self.store.ensure_dirs().await?;

        info!(
            input_file = %config.input_file.display(),
            total_rows,
            number_of_batches = batch_count,
            output = %self.output_dir().display(),
            match_schema = config.match_schema,
            augment_schema = config.augment_schema,
            match_params = %serde_json::Value::Object(match_params.clone()),
            "Processing started"
        );

        let settings = SchedulerSettings {
            batch_size: config.batch_size,
            number_of_batches: batch_count,
            max_concurrent_batches: config.simultaneous_batches,
            max_submit_attempts: config.max_submit_attempts,
            match_schema: config.match_schema,
            augment_schema: config.augment_schema,
            match_params,
        };
        let batches = BatchSplitter::new(rows.into_iter(), config.batch_size)?;
        let mut scheduler = Scheduler::new(self.client.clone(), self.store.clone(), settings, batches);

        loop {
            if let Some(snapshot) = scheduler.tick().await? {
                self.report(&snapshot);
                observer(&snapshot);
            }
            if scheduler.is_done() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    let pending = scheduler.pending_batches();
                    warn!(pending, progress = ?scheduler.progress(), "shutdown requested; stopping between ticks");
                    return Err(SchedulerError::Interrupted { pending });
                }
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
        if let Some(snapshot) = scheduler.progress_if_changed() {
            self.report(&snapshot);
            observer(&snapshot);
        }

        let (manifest_path, manifest) = self.store.write_manifest().await?;
        let failed_batches = scheduler.failed_batches();
        for failed in &failed_batches {
            warn!(batch = failed.batch_number, stage = %failed.stage, reason = %failed.reason, "batch failed");
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_file: config.input_file.display().to_string(),
            output_dir: self.output_dir().display().to_string(),
            total_rows,
            batch_size: config.batch_size,
            number_of_batches: batch_count,
            finished_batches: scheduler.finished_batches(),
            failed_batches,
            stats: scheduler.stats().clone(),
            final_progress: scheduler.progress(),
            manifest: manifest_path.display().to_string(),
        };
        self.store
            .write_json(&self.store.layout().run_summary_path(), &summary, true)
            .await?;

        info!(
            finished = summary.finished_batches,
            failed = summary.failed_batches.len(),
            artifacts = manifest.files.len(),
            ticks = summary.stats.ticks,
            "Processing finished"
        );
        Ok(summary)
    }

    fn report(&self, snapshot: &ProgressSnapshot) {
        let limit = ceiling_label(self.config.simultaneous_batches);
        info!(
            "Match: {:.2}%, jobs in progress: {}/{}",
            snapshot.match_percent, snapshot.matching, limit
        );
        info!(
            "Augment: {:.2}%, jobs in progress: {}/{}",
            snapshot.augment_percent, snapshot.augmenting, limit
        );
    }

    /// Rewrites the raw match files into globally numbered siblings.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, ReconcileError> {
        reconcile(&self.store).await
    }

    pub async fn unique_identifiers(
        &self,
    ) -> anyhow::Result<(BTreeSet<String>, BTreeSet<String>)> {
        export::unique_identifiers(&self.store).await
    }

    pub async fn merge(
        &self,
        output_csv: &Path,
        columns: Option<Vec<String>>,
    ) -> anyhow::Result<usize> {
        export::merge(&self.store, output_csv, columns).await
    }

    pub fn run_summary_path(&self) -> PathBuf {
        self.store.layout().run_summary_path()
    }
}
