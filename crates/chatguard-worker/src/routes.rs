//! HTTP routes and handlers

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chatguard_broker::Broker;
use chatguard_telemetry::PipelineMetrics;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tracing::{debug, error, info};

use crate::ingest::{IngestOutcome, IngestRequest, Ingestor};

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub metrics: PipelineMetrics,
    pub metrics_handle: PrometheusHandle,
}

pub fn create_router(state: AppState, max_concurrent_requests: usize) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/v1/messages", post(submit_message))
        .route("/v1/stats", get(stats))
        .fallback(fallback)
        .layer(ConcurrencyLimitLayer::new(max_concurrent_requests.max(1)))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

async fn submit_message(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Response, AppError> {
    validate(&req)?;
    let message_id = req.message.message_id.clone();
    let request_id = uuid::Uuid::new_v4();
    debug!(%request_id, message_id = %message_id, "Received message");

    match state.ingestor.submit(req).await? {
        IngestOutcome::Queued { topics } => {
            let body = json!({
                "status": "queued",
                "message_id": message_id,
                "request_id": request_id.to_string(),
                "stages": topics.len(),
            });
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
        IngestOutcome::AlreadyDecided => {
            info!(%request_id, message_id = %message_id, "Duplicate submission of a decided message");
            let body = json!({
                "status": "already_decided",
                "message_id": message_id,
            });
            Ok((StatusCode::OK, Json(body)).into_response())
        }
    }
}

fn validate(req: &IngestRequest) -> Result<(), AppError> {
    if req.message.message_id.trim().is_empty() {
        return Err(AppError::InvalidRequest("message_id must not be empty".to_string()));
    }
    if req.message.link.trim().is_empty() {
        return Err(AppError::InvalidRequest("link must not be empty".to_string()));
    }
    Ok(())
}

async fn stats(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let snapshot = state.metrics.snapshot();
    let broker = state.ingestor.broker();

    let mut queues = BTreeMap::new();
    for topic in state.ingestor.watched_topics() {
        let depth = broker.len(&topic).await?;
        queues.insert(topic, depth);
    }

    Ok(Json(json!({
        "backend": broker.name(),
        "stages": state.ingestor.stage_names(),
        "pipeline": snapshot,
        "avg_stage_latency_us": snapshot.avg_stage_latency_us(),
        "violation_rate": snapshot.violation_rate(),
        "queues": queues,
    })))
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Error handling
#[derive(Debug)]
enum AppError {
    InvalidRequest(String),
    Unavailable(String),
    InternalError(String),
}

impl From<chatguard_core::Error> for AppError {
    fn from(err: chatguard_core::Error) -> Self {
        if err.is_transient() || matches!(err, chatguard_core::Error::BrokerUnavailable(_)) {
            AppError::Unavailable(err.to_string())
        } else {
            AppError::InternalError(err.to_string())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            AppError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable_error", msg),
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };
        if status.is_server_error() {
            error!(status = %status, error = %message, "Request failed");
        }

        let body = json!({
            "error": {
                "message": message,
                "type": kind,
            }
        });

        (status, Json(body)).into_response()
    }
}
