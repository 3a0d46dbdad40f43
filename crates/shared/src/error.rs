use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::eval::RunStatus;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("provider not found: {provider_id}")]
    ProviderNotFound {
        provider_id: String,
        supported_providers: Vec<String>,
    },
    #[error("benchmark {benchmark_id} is not offered by provider {provider_id}")]
    BenchmarkNotFound {
        provider_id: String,
        benchmark_id: String,
        supported_benchmarks: Vec<String>,
    },
    #[error("invalid transition: cannot {action} run {run_id} while {from}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        action: &'static str,
    },
    #[error("job submission failed: {0}")]
    JobSubmissionFailed(String),
    #[error("job execution failed: {0}")]
    JobExecutionFailed(String),
    #[error("tracking write failed: {0}")]
    TrackingWriteFailed(String),
    #[error("validation failed: {0}")]
    Validation(String),
}

impl DomainError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DomainError::NotFound(_)
            | DomainError::ProviderNotFound { .. }
            | DomainError::BenchmarkNotFound { .. } => StatusCode::NOT_FOUND,
            DomainError::InvalidTransition { .. } => StatusCode::CONFLICT,
            DomainError::Validation(_) => StatusCode::BAD_REQUEST,
            DomainError::JobSubmissionFailed(_) | DomainError::TrackingWriteFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            DomainError::JobExecutionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DomainError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            DomainError::ProviderNotFound {
                provider_id,
                supported_providers,
            } => json!({
                "message": "Provider not found",
                "provider_id": provider_id,
                "supported_providers": supported_providers,
            }),
            DomainError::BenchmarkNotFound {
                provider_id,
                benchmark_id,
                supported_benchmarks,
            } => json!({
                "message": "Benchmark not found",
                "provider_id": provider_id,
                "benchmark_id": benchmark_id,
                "supported_benchmarks": supported_benchmarks,
            }),
            other => json!({ "message": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
