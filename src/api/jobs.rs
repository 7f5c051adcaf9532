//! Starting jobs and following them.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json,
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use futures::{Stream, StreamExt};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ApiError, AppState, JsonBody};
use crate::{
    model::Job,
    runner::JobSnapshot,
    stream::{JobEvent, watch},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RunRequest {
    #[serde(default)]
    outputs: Vec<String>,
    node_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RunResponse {
    job_id: String,
    status: &'static str,
    node_id: String,
}

pub(super) async fn run(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let job = state.runner.run(&req.outputs, req.node_id.as_deref())?;
    Ok(Json(RunResponse {
        job_id: job.id,
        status: "started",
        node_id: job.node_id,
    }))
}

/// The live view when the runner still holds the job, else the stored one.
pub(super) async fn job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    if let Some(snapshot) = state.runner.snapshot(&id) {
        return Ok(Json(snapshot));
    }

    let job = state
        .storage
        .get_job(&id)?
        .ok_or_else(|| ApiError::not_found(format!("job not found: {id}")))?;
    let output = state
        .storage
        .get_job_logs(&id, None)?
        .into_iter()
        .map(|l| l.line)
        .collect();

    Ok(Json(JobSnapshot {
        status: job.status,
        output,
        elapsed: elapsed_ms(&job),
    }))
}

pub(super) async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job = state
        .storage
        .get_job(&id)?
        .ok_or_else(|| ApiError::not_found(format!("job not found: {id}")))?;
    debug!(job = %id, status = %job.status, "stream opened");

    // Heartbeats are `ping` events from the stream itself.
    let events = watch(Arc::clone(&state.storage), job, state.stream)
        .map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Ok(Sse::new(events))
}

fn to_sse(event: &JobEvent) -> Event {
    let data = event.data().unwrap_or_else(|e| {
        warn!(event = event.name(), error = %e, "failed to encode event");
        "{}".to_string()
    });
    Event::default().event(event.name()).data(data)
}

fn elapsed_ms(job: &Job) -> u64 {
    let end = job.end_time.unwrap_or_else(Timestamp::now);
    u64::try_from(end.as_millisecond() - job.start_time.as_millisecond()).unwrap_or_default()
}
