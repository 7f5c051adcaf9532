//! The graph and what its nodes left on disk.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;
use tracing::info;

use super::{ApiError, AppState, QueryParams};
use crate::{
    discover::{DEFAULT_PREVIEW_LIMIT, MAX_PREVIEW_LIMIT, NodeStatus, Preview, Visualizations},
    model::Graph,
};

pub(super) async fn graph(State(state): State<AppState>) -> Result<Json<Graph>, ApiError> {
    let graph = state.introspector.introspect().await?;
    info!(
        nodes = graph.nodes.len(),
        links = graph.links.len(),
        "introspected graph"
    );
    state.remember_graph(graph.clone());
    Ok(Json(graph))
}

#[derive(Debug, Deserialize)]
pub(super) struct StatusParams {
    /// Comma-separated node ids.
    nodes: Option<String>,
}

/// Badge data for the requested nodes, or for every node of the last graph.
pub(super) async fn status(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<StatusParams>,
) -> Result<Json<BTreeMap<String, NodeStatus>>, ApiError> {
    let nodes: Vec<(String, Option<String>)> = match params.nodes.as_deref() {
        Some(list) if !list.trim().is_empty() => list
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| (id.to_string(), state.declared_output(id)))
            .collect(),
        _ => state.declared_outputs(),
    };

    let discovery = Arc::clone(&state.discovery);
    let statuses: BTreeMap<String, NodeStatus> = tokio::task::spawn_blocking(move || {
        nodes
            .into_iter()
            .map(|(id, declared)| {
                let status = discovery.status(&id, declared.as_deref());
                (id, status)
            })
            .collect()
    })
    .await
    .map_err(ApiError::internal)?;
    Ok(Json(statuses))
}

pub(super) async fn visualizations(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<Visualizations>, ApiError> {
    let declared = state.declared_output(&node_id);
    let discovery = Arc::clone(&state.discovery);
    let found = tokio::task::spawn_blocking(move || {
        discovery.find_visualizations(&node_id, declared.as_deref())
    })
    .await
    .map_err(ApiError::internal)?;
    Ok(Json(found))
}

#[derive(Debug, Deserialize)]
pub(super) struct PreviewParams {
    limit: Option<usize>,
}

pub(super) async fn preview(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    QueryParams(params): QueryParams<PreviewParams>,
) -> Result<Json<Preview>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PREVIEW_LIMIT)
        .min(MAX_PREVIEW_LIMIT);
    let discovery = Arc::clone(&state.discovery);
    let preview = tokio::task::spawn_blocking(move || discovery.preview_cached_table(&node_id, limit))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(preview))
}
