use std::sync::Arc;

use pdca_client::{PollOutcome, RemoteJobClient, SubmitError};
use pdca_core::{
    augment_request, match_request, Batch, JobEvent, JobKind, JobRecord, JobState,
    MasterDataDocument, ProgressSnapshot, Stage,
};
use pdca_storage::ArtifactStore;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, error, info, warn};

use crate::SchedulerError;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub number_of_batches: usize,
    /// Applied separately to admission, running matches and running augments.
    pub max_concurrent_batches: Option<usize>,
    pub max_submit_attempts: Option<u32>,
    pub match_schema: u32,
    pub augment_schema: u32,
    pub match_params: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub ticks: usize,
    pub match_submissions: usize,
    pub augment_submissions: usize,
    pub rejected_submissions: usize,
    pub resumed_at_augment: usize,
    pub resumed_finished: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedBatch {
    pub batch_number: usize,
    pub stage: Stage,
    pub reason: String,
}

/// Owns every job record and advances them one tick at a time.
pub struct Scheduler {
    client: Arc<dyn RemoteJobClient>,
    store: ArtifactStore,
    settings: SchedulerSettings,
    batches: Box<dyn Iterator<Item = Batch> + Send>,
    batches_exhausted: bool,
    jobs: Vec<JobRecord>,
    last_progress: Option<ProgressSnapshot>,
    stats: RunStats,
}

impl Scheduler {
    pub fn new<I>(
        client: Arc<dyn RemoteJobClient>,
        store: ArtifactStore,
        settings: SchedulerSettings,
        batches: I,
    ) -> Self
    where
        I: Iterator<Item = Batch> + Send + 'static,
    {
        Self {
            client,
            store,
            settings,
            batches: Box::new(batches),
            batches_exhausted: false,
            jobs: Vec::new(),
            last_progress: None,
            stats: RunStats::default(),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot::from_jobs(&self.jobs, self.settings.number_of_batches)
    }

    /// The current snapshot, or `None` when it equals the last one handed out.
    pub fn progress_if_changed(&mut self) -> Option<ProgressSnapshot> {
        let snapshot = self.progress();
        if self.last_progress == Some(snapshot) {
            return None;
        }
        self.last_progress = Some(snapshot);
        Some(snapshot)
    }

    /// All batches pulled and every record FINISHED or FAILED.
    pub fn is_done(&self) -> bool {
        self.batches_exhausted && self.jobs.iter().all(JobRecord::is_terminal)
    }

    pub fn pending_batches(&self) -> usize {
        self.jobs.iter().filter(|job| !job.is_terminal()).count()
    }

    pub fn finished_batches(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| matches!(job.state(), JobState::Finished))
            .count()
    }

    pub fn failed_batches(&self) -> Vec<FailedBatch> {
        self.jobs
            .iter()
            .filter_map(|job| match job.state() {
                JobState::Failed { at, reason } => Some(FailedBatch {
                    batch_number: job.batch_number(),
                    stage: *at,
                    reason: reason.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    fn below_ceiling(&self, count: usize) -> bool {
        self.settings
            .max_concurrent_batches
            .map_or(true, |limit| count < limit)
    }

    fn count(&self, stage: Stage, processing: bool) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.stage() == stage && job.is_processing() == processing)
            .count()
    }

    /// One loop iteration: snapshot, admit, harvest, dispatch. Returns the
    /// snapshot taken at the start of the tick if it differs from the previous one.
    pub async fn tick(&mut self) -> Result<Option<ProgressSnapshot>, SchedulerError> {
        self.stats.ticks += 1;
        let snapshot = self.progress_if_changed();
        self.admit().await?;
        self.harvest().await?;
        self.dispatch().await?;
        Ok(snapshot)
    }

    /// Pulls fresh batches while fewer than the ceiling are waiting to be matched.
    pub async fn admit(&mut self) -> Result<usize, SchedulerError> {
        let mut admitted = 0;
        while !self.batches_exhausted && self.below_ceiling(self.count(Stage::Match, false)) {
            let Some(batch) = self.batches.next() else {
                self.batches_exhausted = true;
                debug!(batches = self.jobs.len(), "all batches pulled");
                break;
            };
            let job = self.open_job(batch).await?;
            self.jobs.push(job);
            admitted += 1;
        }
        Ok(admitted)
    }

    /// Creates the record for a freshly pulled batch, skipping phases whose artifacts exist.
    async fn open_job(&mut self, batch: Batch) -> Result<JobRecord, SchedulerError> {
        let paths = self.store.layout().paths_for(batch.number);
        let mut job = JobRecord::new(batch, paths);

        let event = if self.store.exists(job.match_file()).await? {
            if self.store.exists(job.augment_file()).await? {
                self.stats.resumed_finished += 1;
                JobEvent::ResumedFinished
            } else {
                let match_result = self.store.read_document(job.match_file()).await?;
                self.stats.resumed_at_augment += 1;
                JobEvent::ResumedAtAugment(match_result)
            }
        } else {
            JobEvent::Admitted
        };
        let event_name = event.name();
        job.apply(event)?;
        debug!(batch = job.batch_number(), event = event_name, stage = %job.stage(), "job opened");
        Ok(job)
    }

    /// Polls every outstanding remote job once and persists whatever is ready.
    pub async fn harvest(&mut self) -> Result<usize, SchedulerError> {
        let mut completed = 0;
        for job in self.jobs.iter_mut().filter(|job| job.is_processing()) {
            let batch_number = job.batch_number();
            let (kind, handle) = match (job.match_handle(), job.augment_handle()) {
                (Some(handle), _) => (JobKind::Match, handle.clone()),
                (None, Some(handle)) => (JobKind::Augment, handle.clone()),
                (None, None) => continue,
            };

            let value = match self.client.poll(&handle).await? {
                PollOutcome::NotReady => continue,
                PollOutcome::Ready(value) => value,
            };
            let document = MasterDataDocument::from_value(value)
                .map_err(|source| SchedulerError::Payload {
                    batch_number,
                    source,
                })?;

            match kind {
                JobKind::Match => {
                    let stored = self
                        .store
                        .write_json(job.match_file(), &document, true)
                        .await?;
                    debug!(batch = batch_number, path = %stored.path.display(), rows = document.master_data.len(), "match result stored");
                    job.apply(JobEvent::MatchCompleted(document))?;
                }
                JobKind::Augment => {
                    let stored = self
                        .store
                        .write_json(job.augment_file(), &document, true)
                        .await?;
                    debug!(batch = batch_number, path = %stored.path.display(), rows = document.master_data.len(), "augment result stored");
                    job.apply(JobEvent::AugmentCompleted)?;
                }
            }
            completed += 1;
        }
        Ok(completed)
    }

    /// Submits idle MATCH/AUGMENT jobs in batch order while their stage is below the ceiling.
    ///
    /// A rejection ends this dispatch pass; the remaining jobs wait for the next tick.
    pub async fn dispatch(&mut self) -> Result<usize, SchedulerError> {
        let mut running_match = self.count(Stage::Match, true);
        let mut running_augment = self.count(Stage::Augment, true);
        let limit = self.settings.max_concurrent_batches;
        let below = |running: usize| limit.map_or(true, |max| running < max);

        let mut submitted = 0;
        for job in self.jobs.iter_mut() {
            if job.is_processing() {
                continue;
            }
            let (kind, payload) = match job.state() {
                JobState::AwaitingMatch { rows } if below(running_match) => {
                    (JobKind::Match, match_request(rows, &self.settings.match_params))
                }
                JobState::AwaitingAugment { match_result } if below(running_augment) => {
                    let payload = augment_request(match_result).map_err(|source| {
                        SchedulerError::Payload {
                            batch_number: job.batch_number(),
                            source,
                        }
                    })?;
                    (JobKind::Augment, payload)
                }
                _ => continue,
            };
            let schema = match kind {
                JobKind::Match => self.settings.match_schema,
                JobKind::Augment => self.settings.augment_schema,
            };

            match self.client.submit(kind, &payload, schema).await {
                Ok(handle) => {
                    debug!(batch = job.batch_number(), %kind, %handle, "submitted");
                    match kind {
                        JobKind::Match => {
                            job.apply(JobEvent::MatchSubmitted(handle))?;
                            running_match += 1;
                            self.stats.match_submissions += 1;
                        }
                        JobKind::Augment => {
                            job.apply(JobEvent::AugmentSubmitted(handle))?;
                            running_augment += 1;
                            self.stats.augment_submissions += 1;
                        }
                    }
                    submitted += 1;
                }
                Err(SubmitError::Rejected {
                    status, message, ..
                }) => {
                    self.stats.rejected_submissions += 1;
                    let attempts = job.record_rejection();
                    warn!(
                        batch = job.batch_number(),
                        %kind,
                        status,
                        attempts,
                        %message,
                        "submission rejected"
                    );
                    if let Some(max) = self.settings.max_submit_attempts {
                        if attempts >= max {
                            let reason = format!(
                                "{kind} rejected {attempts} time(s), last with status {status}: {message}"
                            );
                            error!(batch = job.batch_number(), %reason, "giving up on batch");
                            job.apply(JobEvent::SubmissionsExhausted { reason })?;
                        }
                    }
                    break;
                }
                Err(SubmitError::Client(err)) => return Err(err.into()),
            }
        }
        if submitted > 0 {
            info!(submitted, running_match, running_augment, "dispatched");
        }
        Ok(submitted)
    }
}
