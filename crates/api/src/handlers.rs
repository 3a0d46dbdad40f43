use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use evalhub_domain::coordinator::RunRequest;
use evalhub_domain::runs::Run;
use evalhub_shared::error::DomainError;
use evalhub_shared::providers::{ProviderResource, ProviderResourceList};
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct RunList {
    pub total_count: usize,
    pub items: Vec<Run>,
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn list_providers(State(state): State<AppState>) -> Json<ProviderResourceList> {
    let items: Vec<ProviderResource> = state
        .coordinator
        .catalog()
        .list()
        .iter()
        .map(|provider| provider.as_ref().clone())
        .collect();
    Json(ProviderResourceList {
        total_count: items.len(),
        items,
    })
}

pub async fn get_provider(
    State(state): State<AppState>,
    Path(provider_id): Path<String>,
) -> Result<Json<ProviderResource>, DomainError> {
    let catalog = state.coordinator.catalog();
    match catalog.get(&provider_id) {
        Some(provider) => Ok(Json(provider.as_ref().clone())),
        None => Err(DomainError::ProviderNotFound {
            provider_id,
            supported_providers: catalog.ids(),
        }),
    }
}

pub async fn create_run(
    State(state): State<AppState>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Run>), DomainError> {
    let Json(request) = body.map_err(|rejection| DomainError::Validation(rejection.body_text()))?;
    let run = state.coordinator.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

pub async fn list_runs(State(state): State<AppState>) -> Json<RunList> {
    let items = state.coordinator.tracker().list();
    Json(RunList {
        total_count: items.len(),
        items,
    })
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, DomainError> {
    let run_id = parse_run_id(&run_id)?;
    Ok(Json(state.coordinator.tracker().get(run_id)?))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, DomainError> {
    let run_id = parse_run_id(&run_id)?;
    Ok(Json(state.coordinator.cancel(run_id).await?))
}

/// A malformed id cannot name a run, so it reads as not found.
fn parse_run_id(value: &str) -> Result<Uuid, DomainError> {
    Uuid::parse_str(value).map_err(|_| DomainError::NotFound(format!("run {value}")))
}
