//! REST API for IP triage

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::enrichment::EnrichmentAggregator;
use crate::models::{EnrichmentReport, TriageRequest, TriageResult};
use crate::triage::{TriageError, TriageOrchestrator};

/// Application state shared across handlers
pub struct AppState {
    pub triage: TriageOrchestrator,
    pub enrichment: Arc<EnrichmentAggregator>,
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Triage
        .route("/triage", post(triage_ip))

        // Standalone enrichment
        .route("/api/v1/enrich/:ip", get(enrich_ip))

        .with_state(state)
}

impl IntoResponse for TriageError {
    fn into_response(self) -> Response {
        let status = match self {
            TriageError::Validation(_) => StatusCode::BAD_REQUEST,
            TriageError::Playbook { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::debug!(kind = self.kind(), ip = ?self.ip(), status = %status, "Triage request failed");

        (status, Json(self.to_json())).into_response()
    }
}

// ==================== Handlers ====================

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "triageforge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn triage_ip(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TriageRequest>, JsonRejection>,
) -> Result<Json<TriageResult>, Response> {
    let Json(request) = payload.map_err(|rejection| {
        tracing::debug!(error = %rejection, "Rejected triage request body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("Invalid JSON body: {}", rejection.body_text()) })),
        )
            .into_response()
    })?;

    state
        .triage
        .triage(request)
        .await
        .map(Json)
        .map_err(IntoResponse::into_response)
}

async fn enrich_ip(
    State(state): State<Arc<AppState>>,
    Path(ip): Path<String>,
) -> Json<EnrichmentReport> {
    Json(state.enrichment.enrich(&ip).await)
}
