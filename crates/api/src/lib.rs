pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use evalhub_domain::coordinator::RunCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RunCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<RunCoordinator>) -> Self {
        Self { coordinator }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health_check))
        .route("/providers", get(handlers::list_providers))
        .route("/providers/:provider_id", get(handlers::get_provider))
        .route("/runs", get(handlers::list_runs).post(handlers::create_run))
        .route("/runs/:run_id", get(handlers::get_run))
        .route("/runs/:run_id/cancel", post(handlers::cancel_run))
        .with_state(state)
}
