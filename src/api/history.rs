//! Past runs.

use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, QueryParams};
use crate::model::{HistoryPage, HistoryQuery, Job, JobStatus, LogLine, NodeStats};

const MAX_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub(super) struct HistoryParams {
    node: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl HistoryParams {
    fn into_query(self) -> Result<HistoryQuery, ApiError> {
        let status = self
            .status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse::<JobStatus>)
            .transpose()
            .map_err(ApiError::bad_request)?;
        let defaults = HistoryQuery::default();

        Ok(HistoryQuery {
            node_id: self.node.filter(|n| !n.is_empty()),
            status,
            limit: self.limit.unwrap_or(defaults.limit).min(MAX_LIMIT),
            offset: self.offset.unwrap_or(defaults.offset),
        })
    }
}

#[derive(Debug, Serialize)]
pub(super) struct JobLogs {
    job: Job,
    logs: Vec<LogLine>,
}

pub(super) async fn list(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<HistoryParams>,
) -> Result<Json<HistoryPage>, ApiError> {
    let query = params.into_query()?;
    Ok(Json(state.storage.get_history(&query)?))
}

pub(super) async fn counts(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, u64>>, ApiError> {
    Ok(Json(state.storage.get_history_count_by_node()?))
}

pub(super) async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobLogs>, ApiError> {
    let job = state
        .storage
        .get_job(&id)?
        .ok_or_else(|| ApiError::not_found(format!("job not found: {id}")))?;
    let logs = state.storage.get_job_logs(&id, None)?;
    Ok(Json(JobLogs { job, logs }))
}

/// Run counts for a node; the path id is a node id here.
pub(super) async fn stats(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeStats>, ApiError> {
    Ok(Json(state.storage.get_node_stats(&node_id)?))
}
