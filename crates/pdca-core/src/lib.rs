//! Core domain model for the PDCA match/augment batch runner.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "pdca-core";

pub const IDENTIFIER_FIELD: &str = "dunsnumber";

pub const RECORD_ID_FIELD: &str = "record_id";

pub const MATCH_PROPERTIES: [&str; 14] = [
    "stockTicker",
    "employees",
    "companyName",
    "city",
    "recordId",
    "phone",
    "state",
    "primaryAddress",
    "country",
    "stockExchange",
    "industryCodeSystem",
    "revenue",
    "postal",
    "industryCode",
];

pub type InputRow = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T = InputRow> {
    pub number: usize,
    pub rows: Vec<T>,
}

/// Lazily cuts an ordered row stream into consecutively numbered batches.
#[derive(Debug)]
pub struct BatchSplitter<I> {
    rows: I,
    batch_size: usize,
    next_number: usize,
}

impl<I: Iterator> BatchSplitter<I> {
    pub fn new(rows: I, batch_size: usize) -> Result<Self, ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_size",
                value: "0".to_string(),
            });
        }
        Ok(Self {
            rows,
            batch_size,
            next_number: 0,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl<I: Iterator> Iterator for BatchSplitter<I> {
    type Item = Batch<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let rows: Vec<_> = self.rows.by_ref().take(self.batch_size).collect();
        if rows.is_empty() {
            return None;
        }
        let number = self.next_number;
        self.next_number += 1;
        Some(Batch { number, rows })
    }
}

/// `ceil(total_rows / batch_size)`; zero rows yields zero batches.
pub fn number_of_batches(total_rows: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    total_rows.div_ceil(batch_size)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Initialized,
    Match,
    Augment,
    Finished,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Initialized => "INITIALIZED",
            Stage::Match => "MATCH",
            Stage::Augment => "AUGMENT",
            Stage::Finished => "FINISHED",
            Stage::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Match,
    Augment,
}

impl JobKind {
    pub fn endpoint(self) -> &'static str {
        match self {
            JobKind::Match => "match",
            JobKind::Augment => "augment",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Match/augment result body: a `masterData` array plus whatever else the service sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterDataDocument {
    #[serde(rename = "masterData")]
    pub master_data: Vec<JsonMap<String, JsonValue>>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl MasterDataDocument {
    pub fn from_value(value: JsonValue) -> Result<Self, PayloadError> {
        serde_json::from_value(value).map_err(PayloadError::Shape)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = String> + '_ {
        self.master_data.iter().filter_map(identifier_of)
    }
}

/// Reads the merge identifier; the service sends it either as a string or a number.
pub fn identifier_of(row: &JsonMap<String, JsonValue>) -> Option<String> {
    match row.get(IDENTIFIER_FIELD)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("result document has unexpected shape: {0}")]
    Shape(#[source] serde_json::Error),
    #[error("masterData row {index} has no dunsnumber")]
    MissingIdentifier { index: usize },
    #[error("masterData row {index} has no record_id")]
    MissingRecordId { index: usize },
    #[error("masterData row {index} has non-integer record_id: {value}")]
    RecordIdNotInteger { index: usize, value: JsonValue },
    #[error("record id offset overflows for batch {batch_number} (batch size {batch_size})")]
    OffsetOverflow { batch_number: usize, batch_size: usize },
}

/// Only [`MATCH_PROPERTIES`] with a usable value survive; `""` and `"NA"` are dropped.
pub fn match_request(rows: &[InputRow], params: &JsonMap<String, JsonValue>) -> JsonValue {
    let inputs: Vec<JsonValue> = rows
        .iter()
        .map(|row| {
            let filtered: JsonMap<String, JsonValue> = row
                .iter()
                .filter(|(key, value)| {
                    MATCH_PROPERTIES.contains(&key.as_str())
                        && !value.is_empty()
                        && value.as_str() != "NA"
                })
                .map(|(key, value)| (key.clone(), JsonValue::String(value.clone())))
                .collect();
            JsonValue::Object(filtered)
        })
        .collect();

    let mut body = params.clone();
    body.insert("matchInputs".to_string(), JsonValue::Array(inputs));
    JsonValue::Object(body)
}

pub fn augment_request(match_result: &MasterDataDocument) -> Result<JsonValue, PayloadError> {
    let inputs = match_result
        .master_data
        .iter()
        .enumerate()
        .map(|(index, row)| {
            row.get(IDENTIFIER_FIELD)
                .cloned()
                .map(|duns| serde_json::json!({ "duns": duns }))
                .ok_or(PayloadError::MissingIdentifier { index })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(serde_json::json!({ "augmentInputs": inputs }))
}

/// Rewrites batch-local record ids into dataset-global ones: `id + batch_number * batch_size`.
pub fn apply_batch_offset(
    document: &mut MasterDataDocument,
    batch_number: usize,
    batch_size: usize,
) -> Result<usize, PayloadError> {
    if batch_number == 0 {
        return Ok(0);
    }
    let offset = batch_number
        .checked_mul(batch_size)
        .and_then(|o| i64::try_from(o).ok())
        .ok_or(PayloadError::OffsetOverflow {
            batch_number,
            batch_size,
        })?;

    for (index, row) in document.master_data.iter_mut().enumerate() {
        let value = row
            .get(RECORD_ID_FIELD)
            .ok_or(PayloadError::MissingRecordId { index })?;
        let local = value
            .as_i64()
            .ok_or_else(|| PayloadError::RecordIdNotInteger {
                index,
                value: value.clone(),
            })?;
        let global = local.checked_add(offset).ok_or(PayloadError::OffsetOverflow {
            batch_number,
            batch_size,
        })?;
        row.insert(RECORD_ID_FIELD.to_string(), JsonValue::from(global));
    }
    Ok(document.master_data.len())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPaths {
    pub match_file: PathBuf,
    pub augment_file: PathBuf,
}

/// Per-batch pipeline state. Stage and the in-flight flag are both derived from
/// the variant, so the two can never disagree.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Initialized { rows: Vec<InputRow> },
    AwaitingMatch { rows: Vec<InputRow> },
    Matching { handle: JobHandle },
    AwaitingAugment { match_result: MasterDataDocument },
    Augmenting { handle: JobHandle },
    Finished,
    Failed { at: Stage, reason: String },
}

impl JobState {
    pub fn stage(&self) -> Stage {
        match self {
            JobState::Initialized { .. } => Stage::Initialized,
            JobState::AwaitingMatch { .. } | JobState::Matching { .. } => Stage::Match,
            JobState::AwaitingAugment { .. } | JobState::Augmenting { .. } => Stage::Augment,
            JobState::Finished => Stage::Finished,
            JobState::Failed { .. } => Stage::Failed,
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, JobState::Matching { .. } | JobState::Augmenting { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Admitted,
    ResumedAtAugment(MasterDataDocument),
    ResumedFinished,
    MatchSubmitted(JobHandle),
    MatchCompleted(MasterDataDocument),
    AugmentSubmitted(JobHandle),
    AugmentCompleted,
    SubmissionsExhausted { reason: String },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Admitted => "admitted",
            JobEvent::ResumedAtAugment(_) => "resumed_at_augment",
            JobEvent::ResumedFinished => "resumed_finished",
            JobEvent::MatchSubmitted(_) => "match_submitted",
            JobEvent::MatchCompleted(_) => "match_completed",
            JobEvent::AugmentSubmitted(_) => "augment_submitted",
            JobEvent::AugmentCompleted => "augment_completed",
            JobEvent::SubmissionsExhausted { .. } => "submissions_exhausted",
        }
    }
}

#[derive(Debug)]
pub struct IllegalTransition {
    pub state: JobState,
    pub event: &'static str,
}

/// The whole state machine. Stages only move forward; FINISHED and FAILED are terminal.
pub fn transition(state: JobState, event: JobEvent) -> Result<JobState, IllegalTransition> {
    match (state, event) {
        (JobState::Initialized { rows }, JobEvent::Admitted) => {
            Ok(JobState::AwaitingMatch { rows })
        }
        (JobState::Initialized { .. }, JobEvent::ResumedAtAugment(match_result)) => {
            Ok(JobState::AwaitingAugment { match_result })
        }
        (JobState::Initialized { .. }, JobEvent::ResumedFinished) => Ok(JobState::Finished),
        (JobState::AwaitingMatch { .. }, JobEvent::MatchSubmitted(handle)) => {
            Ok(JobState::Matching { handle })
        }
        (JobState::Matching { .. }, JobEvent::MatchCompleted(match_result)) => {
            Ok(JobState::AwaitingAugment { match_result })
        }
        (JobState::AwaitingAugment { .. }, JobEvent::AugmentSubmitted(handle)) => {
            Ok(JobState::Augmenting { handle })
        }
        (JobState::Augmenting { .. }, JobEvent::AugmentCompleted) => Ok(JobState::Finished),
        (JobState::AwaitingMatch { .. }, JobEvent::SubmissionsExhausted { reason }) => {
            Ok(JobState::Failed {
                at: Stage::Match,
                reason,
            })
        }
        (JobState::AwaitingAugment { .. }, JobEvent::SubmissionsExhausted { reason }) => {
            Ok(JobState::Failed {
                at: Stage::Augment,
                reason,
            })
        }
        (state, event) => Err(IllegalTransition {
            state,
            event: event.name(),
        }),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("batch {batch_number}: event {event} is not valid in stage {stage} (processing={processing})")]
    Illegal {
        batch_number: usize,
        stage: Stage,
        processing: bool,
        event: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    batch_number: usize,
    paths: BatchPaths,
    state: JobState,
    rejected_submissions: u32,
}

impl JobRecord {
    pub fn new(batch: Batch, paths: BatchPaths) -> Self {
        Self {
            batch_number: batch.number,
            paths,
            state: JobState::Initialized { rows: batch.rows },
            rejected_submissions: 0,
        }
    }

    pub fn batch_number(&self) -> usize {
        self.batch_number
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn stage(&self) -> Stage {
        self.state.stage()
    }

    pub fn is_processing(&self) -> bool {
        self.state.is_processing()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Finished | JobState::Failed { .. })
    }

    /// True once the match phase is behind this batch, including a failure during augment.
    pub fn is_match_complete(&self) -> bool {
        matches!(
            self.state,
            JobState::AwaitingAugment { .. }
                | JobState::Augmenting { .. }
                | JobState::Finished
                | JobState::Failed {
                    at: Stage::Augment,
                    ..
                }
        )
    }

    pub fn match_file(&self) -> &Path {
        &self.paths.match_file
    }

    pub fn augment_file(&self) -> &Path {
        &self.paths.augment_file
    }

    pub fn pending_rows(&self) -> Option<&[InputRow]> {
        match &self.state {
            JobState::Initialized { rows } | JobState::AwaitingMatch { rows } => Some(rows),
            _ => None,
        }
    }

    pub fn match_result(&self) -> Option<&MasterDataDocument> {
        match &self.state {
            JobState::AwaitingAugment { match_result } => Some(match_result),
            _ => None,
        }
    }

    pub fn match_handle(&self) -> Option<&JobHandle> {
        match &self.state {
            JobState::Matching { handle } => Some(handle),
            _ => None,
        }
    }

    pub fn augment_handle(&self) -> Option<&JobHandle> {
        match &self.state {
            JobState::Augmenting { handle } => Some(handle),
            _ => None,
        }
    }

    pub fn rejected_submissions(&self) -> u32 {
        self.rejected_submissions
    }

    pub fn record_rejection(&mut self) -> u32 {
        self.rejected_submissions = self.rejected_submissions.saturating_add(1);
        self.rejected_submissions
    }

    /// Feeds one event through [`transition`]. Moving to a new stage resets the rejection count.
    pub fn apply(&mut self, event: JobEvent) -> Result<(), TransitionError> {
        let previous_stage = self.state.stage();
        let current = std::mem::replace(&mut self.state, JobState::Finished);
        match transition(current, event) {
            Ok(next) => {
                if next.stage() != previous_stage {
                    self.rejected_submissions = 0;
                }
                self.state = next;
                Ok(())
            }
            Err(IllegalTransition { state, event }) => {
                let err = TransitionError::Illegal {
                    batch_number: self.batch_number,
                    stage: state.stage(),
                    processing: state.is_processing(),
                    event,
                };
                self.state = state;
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub match_percent: f64,
    pub augment_percent: f64,
    pub matching: usize,
    pub augmenting: usize,
}

impl ProgressSnapshot {
    pub fn from_jobs(jobs: &[JobRecord], number_of_batches: usize) -> Self {
        let matched = jobs.iter().filter(|j| j.is_match_complete()).count();
        let finished = jobs
            .iter()
            .filter(|j| matches!(j.state(), JobState::Finished))
            .count();
        let matching = jobs
            .iter()
            .filter(|j| j.is_processing() && j.stage() == Stage::Match)
            .count();
        let augmenting = jobs
            .iter()
            .filter(|j| j.is_processing() && j.stage() == Stage::Augment)
            .count();

        Self {
            match_percent: percent(matched, number_of_batches),
            augment_percent: percent(finished, number_of_batches),
            matching,
            augmenting,
        }
    }
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, &str)]) -> InputRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn paths(n: usize) -> BatchPaths {
        BatchPaths {
            match_file: PathBuf::from(format!("raw/match_100-{n}.json")),
            augment_file: PathBuf::from(format!("augment_1/augment_100-{n}.json")),
        }
    }

    fn doc(value: JsonValue) -> MasterDataDocument {
        MasterDataDocument::from_value(value).expect("valid document")
    }

    #[test]
    fn splitter_partitions_rows_in_order_without_gaps() {
        for (total, size) in [(0usize, 3usize), (1, 1), (7, 3), (9, 3), (250, 100), (5, 10)] {
            let rows: Vec<usize> = (0..total).collect();
            let batches: Vec<_> = BatchSplitter::new(rows.clone().into_iter(), size)
                .expect("splitter")
                .collect();

            assert_eq!(batches.len(), number_of_batches(total, size), "n={total} s={size}");
            let rebuilt: Vec<usize> = batches.iter().flat_map(|b| b.rows.clone()).collect();
            assert_eq!(rebuilt, rows);
            for (i, batch) in batches.iter().enumerate() {
                assert_eq!(batch.number, i);
                if i + 1 < batches.len() {
                    assert_eq!(batch.rows.len(), size);
                } else {
                    assert!(!batch.rows.is_empty() && batch.rows.len() <= size);
                }
            }
        }
    }

    #[test]
    fn splitter_rejects_zero_batch_size() {
        let err = BatchSplitter::new(Vec::<u8>::new().into_iter(), 0).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "batch_size",
                value: "0".into()
            }
        );
    }

    #[test]
    fn concrete_split_250_by_100() {
        let sizes: Vec<usize> = BatchSplitter::new(0..250, 100)
            .unwrap()
            .map(|b| b.rows.len())
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn full_lifecycle_walks_every_stage_forward() {
        let mut job = JobRecord::new(
            Batch {
                number: 2,
                rows: vec![row(&[("companyName", "ALFA")])],
            },
            paths(2),
        );
        assert_eq!(job.stage(), Stage::Initialized);

        job.apply(JobEvent::Admitted).unwrap();
        assert_eq!((job.stage(), job.is_processing()), (Stage::Match, false));
        assert_eq!(job.pending_rows().map(|r| r.len()), Some(1));

        job.apply(JobEvent::MatchSubmitted(JobHandle("/r/1".into()))).unwrap();
        assert_eq!((job.stage(), job.is_processing()), (Stage::Match, true));
        assert_eq!(job.match_handle().map(JobHandle::as_str), Some("/r/1"));
        assert!(job.pending_rows().is_none());

        let result = doc(json!({"masterData": [{"dunsnumber": "1", "record_id": 1}]}));
        job.apply(JobEvent::MatchCompleted(result.clone())).unwrap();
        assert_eq!((job.stage(), job.is_processing()), (Stage::Augment, false));
        assert_eq!(job.match_result(), Some(&result));

        job.apply(JobEvent::AugmentSubmitted(JobHandle("/r/2".into()))).unwrap();
        assert_eq!((job.stage(), job.is_processing()), (Stage::Augment, true));
        assert!(job.match_result().is_none(), "match result is dropped on augment submit");

        job.apply(JobEvent::AugmentCompleted).unwrap();
        assert_eq!(job.stage(), Stage::Finished);
        assert!(job.is_terminal());
    }

    #[test]
    fn illegal_events_leave_state_untouched() {
        let mut job = JobRecord::new(Batch { number: 0, rows: vec![] }, paths(0));
        job.apply(JobEvent::Admitted).unwrap();
        let before = job.clone();

        let err = job.apply(JobEvent::AugmentCompleted).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                batch_number: 0,
                stage: Stage::Match,
                processing: false,
                event: "augment_completed",
            }
        );
        assert_eq!(job, before);

        job.apply(JobEvent::ResumedFinished).unwrap_err();
        assert_eq!(job, before);
    }

    #[test]
    fn finished_and_failed_are_terminal() {
        for terminal in [
            JobState::Finished,
            JobState::Failed {
                at: Stage::Match,
                reason: "rejected".into(),
            },
        ] {
            for event in [
                JobEvent::Admitted,
                JobEvent::MatchSubmitted(JobHandle("h".into())),
                JobEvent::AugmentCompleted,
                JobEvent::SubmissionsExhausted { reason: "x".into() },
            ] {
                let err = transition(terminal.clone(), event).unwrap_err();
                assert_eq!(err.state, terminal);
            }
        }
    }

    #[test]
    fn resume_events_short_circuit_from_initialized() {
        let mut at_augment = JobRecord::new(Batch { number: 1, rows: vec![] }, paths(1));
        at_augment
            .apply(JobEvent::ResumedAtAugment(doc(json!({"masterData": []}))))
            .unwrap();
        assert_eq!(at_augment.stage(), Stage::Augment);
        assert!(at_augment.is_match_complete());

        let mut finished = JobRecord::new(Batch { number: 1, rows: vec![] }, paths(1));
        finished.apply(JobEvent::ResumedFinished).unwrap();
        assert_eq!(finished.stage(), Stage::Finished);
    }

    #[test]
    fn exhausted_submissions_fail_at_the_current_stage() {
        let mut job = JobRecord::new(Batch { number: 1, rows: vec![] }, paths(1));
        job.apply(JobEvent::ResumedAtAugment(doc(json!({"masterData": []}))))
            .unwrap();
        assert_eq!(job.record_rejection(), 1);
        assert_eq!(job.record_rejection(), 2);
        job.apply(JobEvent::SubmissionsExhausted {
            reason: "HTTP 400".into(),
        })
        .unwrap();
        assert_eq!(job.stage(), Stage::Failed);
        assert!(job.is_terminal());
        assert!(job.is_match_complete(), "augment failure keeps match progress");
    }

    #[test]
    fn progress_counts_stages_and_in_flight_jobs() {
        let mut jobs = Vec::new();
        for n in 0..4 {
            let mut job = JobRecord::new(Batch { number: n, rows: vec![] }, paths(n));
            job.apply(JobEvent::Admitted).unwrap();
            jobs.push(job);
        }
        jobs[0]
            .apply(JobEvent::MatchSubmitted(JobHandle("a".into())))
            .unwrap();
        jobs[1]
            .apply(JobEvent::MatchSubmitted(JobHandle("b".into())))
            .unwrap();
        jobs[1]
            .apply(JobEvent::MatchCompleted(doc(json!({"masterData": []}))))
            .unwrap();
        jobs[1]
            .apply(JobEvent::AugmentSubmitted(JobHandle("c".into())))
            .unwrap();

        let snapshot = ProgressSnapshot::from_jobs(&jobs, 8);
        assert_eq!(
            snapshot,
            ProgressSnapshot {
                match_percent: 12.5,
                augment_percent: 0.0,
                matching: 1,
                augmenting: 1,
            }
        );
        assert_eq!(ProgressSnapshot::from_jobs(&[], 0).match_percent, 100.0);
    }

    #[test]
    fn match_request_filters_columns_and_empty_values() {
        let rows = vec![row(&[
            ("companyName", "ALFA"),
            ("city", "NA"),
            ("phone", ""),
            ("AccountName", "ignored"),
            ("country", "PL"),
        ])];
        let mut params = JsonMap::new();
        params.insert("confidenceLowerLevelThresholdValue".into(), json!(3));
        params.insert("matchInputs".into(), json!("must not win"));

        let body = match_request(&rows, &params);
        assert_eq!(
            body,
            json!({
                "confidenceLowerLevelThresholdValue": 3,
                "matchInputs": [{"companyName": "ALFA", "country": "PL"}],
            })
        );
    }

    #[test]
    fn augment_request_lists_duns_of_every_match_row() {
        let result = doc(json!({"masterData": [
            {"dunsnumber": "001", "record_id": 1},
            {"dunsnumber": 2, "record_id": 2},
        ]}));
        assert_eq!(
            augment_request(&result).unwrap(),
            json!({"augmentInputs": [{"duns": "001"}, {"duns": 2}]})
        );

        let broken = doc(json!({"masterData": [{"record_id": 1}]}));
        assert!(matches!(
            augment_request(&broken),
            Err(PayloadError::MissingIdentifier { index: 0 })
        ));
    }

    #[test]
    fn batch_offset_leaves_first_batch_unchanged() {
        let original = doc(json!({"masterData": [
            {"record_id": 1, "sequence_id": 10, "businessname": "ALFA"},
            {"record_id": 2, "sequence_id": 20, "businessname": "BETA"},
        ]}));
        let mut data = original.clone();
        assert_eq!(apply_batch_offset(&mut data, 0, 100).unwrap(), 0);
        assert_eq!(data, original);
    }

    #[test]
    fn batch_offset_shifts_by_batch_number_times_size() {
        let mut data = doc(json!({
            "masterData": [
                {"record_id": 1, "sequence_id": 10, "businessname": "ALFA"},
                {"record_id": 2, "sequence_id": 20, "businessname": "BETA"},
            ],
            "inquiryDetail": {"n": 2},
        }));
        assert_eq!(apply_batch_offset(&mut data, 3, 100).unwrap(), 2);
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({
                "masterData": [
                    {"record_id": 301, "sequence_id": 10, "businessname": "ALFA"},
                    {"record_id": 302, "sequence_id": 20, "businessname": "BETA"},
                ],
                "inquiryDetail": {"n": 2},
            })
        );
    }

    #[test]
    fn batch_offset_rejects_rows_without_integer_ids() {
        let mut missing = doc(json!({"masterData": [{"dunsnumber": "1"}]}));
        assert!(matches!(
            apply_batch_offset(&mut missing, 1, 10),
            Err(PayloadError::MissingRecordId { index: 0 })
        ));

        let mut text = doc(json!({"masterData": [{"record_id": "7"}]}));
        assert!(matches!(
            apply_batch_offset(&mut text, 1, 10),
            Err(PayloadError::RecordIdNotInteger { index: 0, .. })
        ));
    }

    #[test]
    fn documents_without_master_data_are_rejected() {
        assert!(matches!(
            MasterDataDocument::from_value(json!({"status": "ok"})),
            Err(PayloadError::Shape(_))
        ));
    }
}
