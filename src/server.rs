//! Summarization REST API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/summaries` | Submit a text; `202` with the job, `204` for empty text |
//! | `GET`  | `/summaries/{request_id}` | Poll a job; `404` when unknown |
//! | `POST` | `/language-detection` | Detect the language of a raw text body |
//! | `GET`  | `/healthz` | Liveness check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one shape:
//!
//! ```json
//! { "error": { "code": "unsupported_language", "message": "language 'fr' is not supported; available: en" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unsupported_model`,
//! `unsupported_language` and `invalid_request_id` (422), `unavailable`
//! (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front ends
//! can poll directly.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use synopsis_core::capability::LanguageDetector;
use synopsis_core::models::{DetectedLanguage, Params, Summary, SummaryStatus, Warnings};
use synopsis_core::store::{Store, StoreError};

use crate::config::Config;
use crate::coordinator::{open_store, Coordinator, Submission};
use crate::error::ServiceError;
use crate::pipeline::Capabilities;
use crate::text::StopwordDetector;

/// Starts the HTTP server with the built-in capabilities and the store
/// selected in `[store]`.
///
/// Binds to `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    run_server_with(
        config,
        store,
        Capabilities::builtin(config.pipeline.max_chunk_tokens),
        Arc::new(StopwordDetector::new()),
    )
    .await
}

/// Starts the HTTP server with caller-supplied store and capabilities.
///
/// This is how a deployment plugs in a real model: build a
/// [`Capabilities`] whose summarizer talks to the model server and pass it
/// here.
pub async fn run_server_with(
    config: &Config,
    store: Arc<dyn Store>,
    caps: Capabilities,
    detector: Arc<dyn LanguageDetector>,
) -> anyhow::Result<()> {
    let (coordinator, dispatcher) = Coordinator::start(config, store, caps, detector);
    coordinator.recover().await?;
    let app = router(coordinator);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(addr = %listener.local_addr()?, "summarization API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    // The router owned the last coordinator; the dispatcher now drains.
    let _ = dispatcher.await;
    Ok(())
}

/// Build the API router around a coordinator.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/summaries", post(handle_submit))
        .route("/summaries/{request_id}", get(handle_fetch))
        .route("/language-detection", post(handle_detect))
        .route("/healthz", get(handle_health))
        .layer(cors)
        .with_state(coordinator)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::EmptySource => bad_request(message),
            ServiceError::UnsupportedModel { .. } => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "unsupported_model", message)
            }
            ServiceError::UnsupportedLanguage { .. } => AppError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "unsupported_language",
                message,
            ),
            ServiceError::InvalidRequestId(_) => AppError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "invalid_request_id",
                message,
            ),
            ServiceError::NotFound(_) => not_found(message),
            ServiceError::QueueClosed
            | ServiceError::QueueFull
            | ServiceError::Store(StoreError::Contention { .. }) => {
                warn!(error = %message, "service unavailable");
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
            ServiceError::Detection(_) | ServiceError::Store(_) => {
                error!(error = %message, "internal error");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

// ============ Summaries ============

/// Client-facing projection of a summary. `summary_id` is the request id.
#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub summary_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SummaryStatus,
    pub output: Option<String>,
    pub output_length: Option<usize>,
    pub model: String,
    pub params: Params,
    pub language: String,
    pub warnings: Warnings,
    pub error: Option<String>,
}

impl SummaryResponse {
    pub fn new(summary: Summary, warnings: Warnings) -> Self {
        Self {
            summary_id: summary.id,
            started_at: summary.started_at,
            ended_at: summary.ended_at,
            status: summary.status,
            output: summary.output,
            output_length: summary.output_length,
            model: summary.model,
            params: summary.params,
            language: summary.language,
            warnings,
            error: summary.error,
        }
    }
}

/// Handler for `POST /summaries`.
async fn handle_submit(
    State(coordinator): State<Arc<Coordinator>>,
    body: Result<Json<Submission>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(submission) = body.map_err(|e| bad_request(e.body_text()))?;

    match coordinator.submit(submission).await {
        Ok((summary, warnings)) => Ok((
            StatusCode::ACCEPTED,
            Json(SummaryResponse::new(summary, warnings)),
        )
            .into_response()),
        Err(ServiceError::EmptySource) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(e) => Err(e.into()),
    }
}

/// Handler for `GET /summaries/{request_id}`.
async fn handle_fetch(
    State(coordinator): State<Arc<Coordinator>>,
    Path(request_id): Path<String>,
) -> Result<Json<SummaryResponse>, AppError> {
    let (summary, warnings) = coordinator
        .fetch(&request_id)
        .await?
        .ok_or_else(|| not_found(format!("no summary found for request {}", request_id)))?;
    Ok(Json(SummaryResponse::new(summary, warnings)))
}

// ============ POST /language-detection ============

/// Handler for `POST /language-detection`. The body is the raw text.
async fn handle_detect(
    State(coordinator): State<Arc<Coordinator>>,
    body: String,
) -> Result<Response, AppError> {
    match coordinator.detect_language(&body).await? {
        Some(found) => Ok(Json::<DetectedLanguage>(found).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

// ============ GET /healthz ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"alive"` when the server is running.
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "alive".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: ServiceError) -> (StatusCode, String) {
        let app: AppError = err.into();
        (app.status, app.code)
    }

    #[test]
    fn test_service_errors_map_to_statuses() {
        assert_eq!(
            status_of(ServiceError::UnsupportedLanguage {
                language: "fr".into(),
                available: "en".into()
            }),
            (StatusCode::UNPROCESSABLE_ENTITY, "unsupported_language".into())
        );
        assert_eq!(
            status_of(ServiceError::NotFound("x".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(ServiceError::Store(StoreError::Contention {
                operation: "update_summary",
                attempts: 5
            }))
            .0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(ServiceError::QueueFull),
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable".into())
        );
        assert_eq!(
            status_of(ServiceError::Store(StoreError::Poisoned)).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_projection_uses_request_id() {
        let now = Utc::now();
        let summary = Summary {
            id: "req".into(),
            source_id: "src".into(),
            source: "text".into(),
            output: None,
            output_length: None,
            model: "t5".into(),
            params: Params::new(),
            status: SummaryStatus::Encoding,
            error: None,
            started_at: now,
            ended_at: None,
            language: "en".into(),
            request_count: 1,
        };
        let json = serde_json::to_value(SummaryResponse::new(summary, Warnings::new())).unwrap();
        assert_eq!(json["summary_id"], "req");
        assert_eq!(json["status"], "encoding");
        assert!(json["output"].is_null());
        assert!(json.get("source").is_none());
    }
}
