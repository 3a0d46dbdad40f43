#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use evalhub_domain::catalog::ProviderCatalog;
use evalhub_domain::runs::{Run, RunTracker};
use evalhub_domain::sync::TrackingSync;
use evalhub_domain::tracking::TrackingClient;
use evalhub_shared::providers::{BenchmarkResource, EnvVar, ProviderResource, ProviderRuntime};
use evalhub_shared::settings::{RetrySettings, TrackingSettings};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

/// In-process stand-in for an MLflow tracking server.
#[derive(Default)]
pub struct MockTracking {
    experiments: Mutex<HashMap<String, String>>,
    experiment_creations: AtomicUsize,
    run_creations: AtomicUsize,
    requests: Mutex<Vec<String>>,
    fail_with: Mutex<Option<u16>>,
    batches: Mutex<Vec<Value>>,
    updates: Mutex<Vec<Value>>,
}

impl MockTracking {
    /// Answers every subsequent request with `status`; `None` restores service.
    pub fn fail_with(&self, status: Option<u16>) {
        *self.fail_with.lock() = status;
    }

    pub fn experiment_creations(&self) -> usize {
        self.experiment_creations.load(Ordering::SeqCst)
    }

    pub fn run_creations(&self) -> usize {
        self.run_creations.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn batches(&self) -> Vec<Value> {
        self.batches.lock().clone()
    }

    pub fn updates(&self) -> Vec<Value> {
        self.updates.lock().clone()
    }

    fn record(&self, path: &str) -> Option<Response> {
        self.requests.lock().push(path.to_string());
        let status = (*self.fail_with.lock())?;
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        Some((status, r#"{"error_code":"TEMPORARILY_UNAVAILABLE"}"#).into_response())
    }
}

type Mock = State<Arc<MockTracking>>;

async fn get_by_name(State(mock): Mock, Query(q): Query<HashMap<String, String>>) -> Response {
    if let Some(failure) = mock.record("experiments/get-by-name") {
        return failure;
    }
    let name = q.get("experiment_name").cloned().unwrap_or_default();
    let id = mock.experiments.lock().get(&name).cloned();
    match id {
        Some(id) => Json(json!({
            "experiment": {
                "experiment_id": id,
                "name": name,
                "artifact_location": format!("mlflow-artifacts:/{id}"),
                "lifecycle_stage": "active",
                "creation_time": 1_700_000_000_000i64,
                "last_update_time": 1_700_000_000_000i64
            }
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            r#"{"error_code":"RESOURCE_DOES_NOT_EXIST"}"#,
        )
            .into_response(),
    }
}

async fn create_experiment(State(mock): Mock, Json(body): Json<Value>) -> Response {
    if let Some(failure) = mock.record("experiments/create") {
        return failure;
    }
    let name = body["name"].as_str().unwrap_or_default().to_string();
    // widen the window for concurrent creators
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut experiments = mock.experiments.lock();
    if experiments.contains_key(&name) {
        return (
            StatusCode::BAD_REQUEST,
            r#"{"error_code":"RESOURCE_ALREADY_EXISTS"}"#,
        )
            .into_response();
    }
    let id = (experiments.len() + 1).to_string();
    experiments.insert(name, id.clone());
    mock.experiment_creations.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "experiment_id": id })).into_response()
}

async fn create_run(State(mock): Mock, Json(body): Json<Value>) -> Response {
    if let Some(failure) = mock.record("runs/create") {
        return failure;
    }
    let n = mock.run_creations.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "run": {
            "info": {
                "run_id": format!("tracked-{n}"),
                "experiment_id": body["experiment_id"],
                "status": "RUNNING"
            }
        }
    }))
    .into_response()
}

async fn log_batch(State(mock): Mock, Json(body): Json<Value>) -> Response {
    if let Some(failure) = mock.record("runs/log-batch") {
        return failure;
    }
    mock.batches.lock().push(body);
    Json(json!({})).into_response()
}

async fn update_run(State(mock): Mock, Json(body): Json<Value>) -> Response {
    if let Some(failure) = mock.record("runs/update") {
        return failure;
    }
    mock.updates.lock().push(body.clone());
    Json(json!({ "run_info": { "run_id": body["run_id"], "status": body["status"] } }))
        .into_response()
}

/// Starts the mock on an ephemeral port and returns its base URL.
pub async fn start_mock_tracking() -> (Arc<MockTracking>, String) {
    let mock = Arc::new(MockTracking::default());
    let app = Router::new()
        .route("/api/2.0/mlflow/experiments/get-by-name", get(get_by_name))
        .route("/api/2.0/mlflow/experiments/create", post(create_experiment))
        .route("/api/2.0/mlflow/runs/create", post(create_run))
        .route("/api/2.0/mlflow/runs/log-batch", post(log_batch))
        .route("/api/2.0/mlflow/runs/update", post(update_run))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (mock, format!("http://{addr}"))
}

pub fn tracking_settings(base_url: &str, max_attempts: u32) -> TrackingSettings {
    TrackingSettings {
        enabled: true,
        base_url: base_url.to_string(),
        experiment_name: "evalhub-tests".into(),
        artifact_location: None,
        request_timeout_secs: 5,
        retry: RetrySettings {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
    }
}

pub fn tracking_sync(tracker: Arc<RunTracker>, settings: &TrackingSettings) -> Arc<TrackingSync> {
    let client = TrackingClient::new(
        &settings.base_url,
        Duration::from_secs(settings.request_timeout_secs),
    )
    .unwrap();
    Arc::new(TrackingSync::new(client, tracker, settings))
}

pub fn catalog() -> Arc<ProviderCatalog> {
    let benchmark = |id: &str, name: &str| BenchmarkResource {
        benchmark_id: id.into(),
        name: Some(name.into()),
        description: None,
        category: Some("knowledge".into()),
        metrics: vec!["accuracy".into()],
        env: vec![EnvVar::new("NUM_FEWSHOT", "5")],
    };
    Arc::new(
        ProviderCatalog::new(vec![ProviderResource {
            provider_id: "openai".into(),
            provider_name: "OpenAI Evals".into(),
            description: "OpenAI evals adapter".into(),
            provider_type: "builtin".into(),
            base_url: None,
            benchmarks: vec![benchmark("mmlu", "MMLU"), benchmark("gsm8k", "GSM8K")],
            runtime: ProviderRuntime {
                image: "quay.io/eval-hub/openai:latest".into(),
                entrypoint: "/app/run".into(),
                cpu_request: "250m".into(),
                memory_request: "512Mi".into(),
                cpu_limit: "1".into(),
                memory_limit: "2Gi".into(),
                env: vec![EnvVar::new("LOG_LEVEL", "info")],
            },
        }])
        .unwrap(),
    )
}

/// Polls the tracker until `done` holds for the run.
pub async fn wait_for<F>(tracker: &RunTracker, run_id: Uuid, done: F) -> Run
where
    F: Fn(&Run) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let run = tracker.get(run_id).unwrap();
            if done(&run) {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run did not reach the expected state in time")
}
