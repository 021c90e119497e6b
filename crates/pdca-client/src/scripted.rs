//! In-memory [`RemoteJobClient`] for scheduler tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use pdca_core::{JobHandle, JobKind, IDENTIFIER_FIELD, RECORD_ID_FIELD};
use serde_json::{json, Value as JsonValue};

use crate::{ClientError, PollOutcome, RemoteJobClient, SubmitError};

#[derive(Debug)]
struct ScriptedJob {
    kind: JobKind,
    polls_until_ready: usize,
    result: JsonValue,
    delivered: bool,
}

#[derive(Debug, Default)]
struct KindCounters {
    submissions: usize,
    rejections_left: usize,
    rejected: usize,
    outstanding: usize,
    max_outstanding: usize,
}

#[derive(Debug, Default)]
struct ScriptState {
    jobs: HashMap<String, ScriptedJob>,
    poll_delays: Vec<usize>,
    next_job: usize,
    next_duns: usize,
    matching: KindCounters,
    augmenting: KindCounters,
    payloads: Vec<(JobKind, JsonValue)>,
}

impl ScriptState {
    fn counters(&mut self, kind: JobKind) -> &mut KindCounters {
        match kind {
            JobKind::Match => &mut self.matching,
            JobKind::Augment => &mut self.augmenting,
        }
    }
}

/// Deterministic stand-in for the remote service.
///
/// Match results number rows `1..=k` in `record_id` and derive `dunsnumber`
/// from the input `recordId` column (`D<recordId>`), falling back to a running
/// counter. Augment results echo each `duns` with a few extra fields.
#[derive(Debug, Default)]
pub struct ScriptedRemoteClient {
    state: Mutex<ScriptState>,
}

impl ScriptedRemoteClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `NotReady` answers before each job turns ready, cycled per submission.
    pub fn with_poll_delays(self, delays: Vec<usize>) -> Self {
        self.lock().poll_delays = delays;
        self
    }

    /// The next `times` submissions of `kind` are rejected with a 429.
    pub fn reject_submissions(&self, kind: JobKind, times: usize) {
        self.lock().counters(kind).rejections_left = times;
    }

    pub fn submission_count(&self, kind: JobKind) -> usize {
        self.lock().counters(kind).submissions
    }

    pub fn rejection_count(&self, kind: JobKind) -> usize {
        self.lock().counters(kind).rejected
    }

    /// Highest number of simultaneously outstanding jobs of `kind` seen so far.
    pub fn max_outstanding(&self, kind: JobKind) -> usize {
        self.lock().counters(kind).max_outstanding
    }

    pub fn outstanding(&self, kind: JobKind) -> usize {
        self.lock().counters(kind).outstanding
    }

    /// Every accepted request body, in submission order.
    pub fn payloads(&self, kind: JobKind) -> Vec<JsonValue> {
        self.lock()
            .payloads
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, body)| body.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn match_result(state: &mut ScriptState, payload: &JsonValue) -> JsonValue {
    let inputs = payload
        .get("matchInputs")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let rows: Vec<JsonValue> = inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            let duns = match input.get("recordId").and_then(JsonValue::as_str) {
                Some(id) => format!("D{id}"),
                None => {
                    state.next_duns += 1;
                    format!("D{}", state.next_duns)
                }
            };
            let company = input.get("companyName").cloned().unwrap_or(JsonValue::Null);
            json!({
                RECORD_ID_FIELD: index + 1,
                IDENTIFIER_FIELD: duns,
                "companyName": company,
                "confidenceCode": 8,
            })
        })
        .collect();
    json!({ "masterData": rows })
}

fn augment_result(payload: &JsonValue) -> JsonValue {
    let inputs = payload
        .get("augmentInputs")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let rows: Vec<JsonValue> = inputs
        .iter()
        .map(|input| {
            let duns = input.get("duns").cloned().unwrap_or(JsonValue::Null);
            let label = match &duns {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            json!({
                IDENTIFIER_FIELD: duns,
                "companyName": format!("Augmented {label}"),
                "employeeCount": 42,
                "active": true,
            })
        })
        .collect();
    json!({ "masterData": rows })
}

#[async_trait]
impl RemoteJobClient for ScriptedRemoteClient {
    async fn submit(
        &self,
        kind: JobKind,
        payload: &JsonValue,
        _schema: u32,
    ) -> Result<JobHandle, SubmitError> {
        let mut state = self.lock();
        let counters = state.counters(kind);
        if counters.rejections_left > 0 {
            counters.rejections_left -= 1;
            counters.rejected += 1;
            return Err(SubmitError::Rejected {
                kind,
                status: 429,
                message: "scripted rejection".to_string(),
            });
        }
        counters.submissions += 1;
        counters.outstanding += 1;
        counters.max_outstanding = counters.max_outstanding.max(counters.outstanding);

        let result = match kind {
            JobKind::Match => match_result(&mut state, payload),
            JobKind::Augment => augment_result(payload),
        };
        let polls_until_ready = if state.poll_delays.is_empty() {
            0
        } else {
            state.poll_delays[state.next_job % state.poll_delays.len()]
        };
        state.next_job += 1;
        let handle = format!("/{}/{}", kind.endpoint(), state.next_job);
        state.jobs.insert(
            handle.clone(),
            ScriptedJob {
                kind,
                polls_until_ready,
                result,
                delivered: false,
            },
        );
        state.payloads.push((kind, payload.clone()));
        Ok(JobHandle(handle))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<PollOutcome, ClientError> {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(handle.as_str()) else {
            return Err(ClientError::HttpStatus {
                status: 404,
                url: handle.to_string(),
                message: "unknown job".to_string(),
            });
        };
        if job.polls_until_ready > 0 {
            job.polls_until_ready -= 1;
            return Ok(PollOutcome::NotReady);
        }
        let result = job.result.clone();
        let first_delivery = !job.delivered;
        job.delivered = true;
        let kind = job.kind;
        if first_delivery {
            let counters = state.counters(kind);
            counters.outstanding = counters.outstanding.saturating_sub(1);
        }
        Ok(PollOutcome::Ready(result))
    }
}
