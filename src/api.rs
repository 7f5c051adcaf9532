//! HTTP surface over the runner, the store and the artifact lookups.
//!
//! Handlers stay thin: they parse the request, call one component and map
//! its error onto a status code. Errors render as `{"error": message}`.

mod artifacts;
mod history;
mod jobs;

use std::{
    fmt, io,
    sync::{Arc, PoisonError, RwLock},
};

use axum::{
    Json, Router,
    extract::{
        FromRequest, FromRequestParts,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::{error, info};

use crate::{
    discover::Discovery,
    introspect::{IntrospectError, Introspector},
    model::Graph,
    runner::{JobRunner, RunError},
    storage::{Storage, StorageError},
    stream::StreamSettings,
};

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    storage: Arc<Storage>,
    runner: JobRunner,
    introspector: Arc<Introspector>,
    discovery: Arc<Discovery>,
    stream: StreamSettings,

    /// The graph last served by `/api/graph`, for routes that need node
    /// declarations without re-running introspection.
    last_graph: Arc<RwLock<Option<Graph>>>,
}

impl AppState {
    pub fn new(
        storage: Arc<Storage>,
        runner: JobRunner,
        introspector: Introspector,
        discovery: Discovery,
        stream: StreamSettings,
    ) -> Self {
        Self {
            storage,
            runner,
            introspector: Arc::new(introspector),
            discovery: Arc::new(discovery),
            stream,
            last_graph: Arc::new(RwLock::new(None)),
        }
    }

    fn remember_graph(&self, graph: Graph) {
        *self
            .last_graph
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(graph);
    }

    /// Every node of the last graph with its declared image directory.
    fn declared_outputs(&self) -> Vec<(String, Option<String>)> {
        let graph = self.last_graph.read().unwrap_or_else(PoisonError::into_inner);
        graph
            .iter()
            .flat_map(|g| &g.nodes)
            .map(|n| (n.id.clone(), n.viz_output.clone()))
            .collect()
    }

    fn declared_output(&self, node_id: &str) -> Option<String> {
        let graph = self.last_graph.read().unwrap_or_else(PoisonError::into_inner);
        graph.as_ref()?.node(node_id)?.viz_output.clone()
    }
}

pub fn router(state: AppState) -> Router {
    let results = ServeDir::new(state.discovery.results_dir());

    Router::new()
        .route("/health", get(health))
        .route("/api/graph", get(artifacts::graph))
        .route("/api/run", post(jobs::run))
        .route("/api/job/{id}", get(jobs::job))
        .route("/api/job/{id}/stream", get(jobs::stream))
        .route("/api/history", get(history::list))
        .route("/api/history/counts", get(history::counts))
        .route("/api/history/{id}", get(history::job_logs))
        .route("/api/history/{id}/logs", get(history::job_logs))
        .route("/api/history/{id}/stats", get(history::stats))
        .route("/api/status", get(artifacts::status))
        .route("/api/visualizations/{node_id}", get(artifacts::visualizations))
        .route("/api/preview/{node_id}", get(artifacts::preview))
        .nest_service("/results", results)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves, then drain open connections.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok"
    }))
}

/// `Json` whose rejections render through [`ApiError`].
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct JsonBody<T>(T);

/// `Query` whose rejections render through [`ApiError`].
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
struct QueryParams<T>(T);

/// A failed request, rendered as `{"error": message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(error: impl fmt::Display) -> Self {
        error!(error = %error, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": self.message
        }));
        (self.status, body).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::JobNotFound(_) => Self::not_found(e.to_string()),
            other => Self::internal(other),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::NoOutputs => Self::bad_request(e.to_string()),
            RunError::ShuttingDown => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: e.to_string(),
            },
            RunError::Storage(e) => e.into(),
            RunError::EmptyCommand => Self::internal(e),
        }
    }
}

impl From<IntrospectError> for ApiError {
    fn from(e: IntrospectError) -> Self {
        Self::internal(e)
    }
}
