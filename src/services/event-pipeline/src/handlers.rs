//! # HTTP Handlers
//!
//! Request handlers for the service's HTTP surface: health, Prometheus
//! metrics, the status report, manual interventions and fraud webhook
//! ingestion.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::adapters::WebhookPayload;
use crate::error::PipelineError;
use crate::pipeline::{ManualIntervention, SystemStatusReport};
use crate::server::EventPipelineService;
use crate::types::ComponentHealth;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub components: Vec<ComponentHealth>,
}

/// Acknowledgement for accepted webhook payloads
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub accepted: String,
}

/// Error response for failed operations
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&PipelineError> for ErrorResponse {
    fn from(error: &PipelineError) -> Self {
        Self {
            error: error.category().to_string(),
            message: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

fn error_status(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::Validation { .. } | PipelineError::Data { .. } => StatusCode::BAD_REQUEST,
        PipelineError::QueueFull { .. } | PipelineError::LoadShed { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `GET /health`
pub async fn health(
    State(service): State<Arc<EventPipelineService>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: service.overall_health().to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        components: service.component_health(),
    })
}

/// `GET /metrics` in the Prometheus text format
pub async fn metrics(
    State(service): State<Arc<EventPipelineService>>,
) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    service
        .pipeline()
        .metrics()
        .export()
        .map_err(|err| (error_status(&err), Json(ErrorResponse::from(&err))))
}

/// `GET /api/v1/status`
pub async fn status(
    State(service): State<Arc<EventPipelineService>>,
) -> Json<SystemStatusReport> {
    Json(service.pipeline().status_report())
}

/// `POST /api/v1/interventions`
pub async fn intervention(
    State(service): State<Arc<EventPipelineService>>,
    Json(intervention): Json<ManualIntervention>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorResponse>)> {
    debug!(?intervention, "manual intervention requested");
    service
        .pipeline()
        .handle_manual_intervention(intervention)
        .await
        .map(Json)
        .map_err(|err| (error_status(&err), Json(ErrorResponse::from(&err))))
}

/// `POST /api/v1/webhooks/fraud`
pub async fn fraud_webhook(
    State(service): State<Arc<EventPipelineService>>,
    Json(payload): Json<WebhookPayload>,
) -> Result<(StatusCode, Json<WebhookAck>), (StatusCode, Json<ErrorResponse>)> {
    let id = payload.id.clone();
    service
        .fraud_adapter()
        .ingest(payload)
        .map(|()| (StatusCode::ACCEPTED, Json(WebhookAck { accepted: id })))
        .map_err(|err| (error_status(&err), Json(ErrorResponse::from(&err))))
}
