//! REST client for an MLflow-compatible experiment tracking service.

use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

const API_PREFIX: &str = "/api/2.0/mlflow";

/// Non-2xx answer from the tracking service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status_code: u16,
    pub response_body: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("API error")?;
        if !self.response_body.is_empty() {
            write!(f, " with response body: {}", self.response_body)?;
        }
        write!(f, " with status code: {}", self.status_code)
    }
}

impl std::error::Error for ApiError {}

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("tracking service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

impl TrackingError {
    /// Server-side and transport failures are worth retrying; client errors
    /// and undecodable responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TrackingError::Api(api) => {
                api.status_code >= 500 || api.status_code == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            TrackingError::Transport(err) => !err.is_decode() && !err.is_builder(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            TrackingError::Api(api) => {
                api.status_code == StatusCode::CONFLICT.as_u16()
                    || api.response_body.contains("RESOURCE_ALREADY_EXISTS")
            }
            TrackingError::Transport(_) => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            TrackingError::Api(api) => Some(api.status_code),
            TrackingError::Transport(err) => err.status().map(|status| status.as_u16()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    #[serde(default)]
    pub artifact_location: String,
    #[serde(default)]
    pub lifecycle_stage: String,
    #[serde(default, deserialize_with = "epoch_millis")]
    pub last_update_time: i64,
    #[serde(default, deserialize_with = "epoch_millis")]
    pub creation_time: i64,
    #[serde(default)]
    pub tags: Vec<ExperimentTag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateExperimentRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_location: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<ExperimentTag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateExperimentResponse {
    pub experiment_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetExperimentResponse {
    pub experiment: Experiment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTag {
    pub key: String,
    pub value: String,
}

impl RunTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRunRequest {
    pub experiment_id: String,
    pub run_name: String,
    pub start_time: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<RunTag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRunResponse {
    pub run: TrackedRun,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackedRun {
    pub info: TrackedRunInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackedRunInfo {
    pub run_id: String,
    #[serde(default)]
    pub experiment_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    pub timestamp: i64,
    pub step: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Param {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogBatchRequest {
    pub run_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<RunTag>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateRunRequest {
    pub run_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

pub struct TrackingClient {
    http: reqwest::Client,
    base_url: String,
}

impl TrackingClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TrackingError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn create_experiment(
        &self,
        request: &CreateExperimentRequest,
    ) -> Result<CreateExperimentResponse, TrackingError> {
        self.post("/experiments/create", request).await
    }

    pub async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment, TrackingError> {
        let response: GetExperimentResponse = self
            .get("/experiments/get", &[("experiment_id", experiment_id)])
            .await?;
        Ok(response.experiment)
    }

    pub async fn get_experiment_by_name(&self, name: &str) -> Result<Experiment, TrackingError> {
        let response: GetExperimentResponse = self
            .get("/experiments/get-by-name", &[("experiment_name", name)])
            .await?;
        Ok(response.experiment)
    }

    pub async fn create_run(
        &self,
        request: &CreateRunRequest,
    ) -> Result<TrackedRunInfo, TrackingError> {
        let response: CreateRunResponse = self.post("/runs/create", request).await?;
        Ok(response.run.info)
    }

    pub async fn log_batch(&self, request: &LogBatchRequest) -> Result<(), TrackingError> {
        self.post_discarding("/runs/log-batch", request).await
    }

    pub async fn update_run(&self, request: &UpdateRunRequest) -> Result<(), TrackingError> {
        self.post_discarding("/runs/update", request).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    async fn get<R: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<R, TrackingError> {
        let resp = self.http.get(self.url(path)).query(query).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, TrackingError> {
        let resp = self.http.post(self.url(path)).json(body).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn post_discarding<B: Serialize>(&self, path: &str, body: &B) -> Result<(), TrackingError> {
        let resp = self.http.post(self.url(path)).json(body).send().await?;
        check(resp).await?;
        Ok(())
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TrackingError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status_code = resp.status().as_u16();
    let response_body = resp.text().await.unwrap_or_default();
    Err(ApiError {
        status_code,
        response_body,
    }
    .into())
}

/// Accepts epoch millis as a JSON number or, as protobuf JSON renders int64, a string.
fn epoch_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Number(i64),
        Text(String),
    }

    match Millis::deserialize(deserializer)? {
        Millis::Number(n) => Ok(n),
        Millis::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    async fn start_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn client(base_url: &str) -> TrackingClient {
        TrackingClient::new(base_url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn api_error_display() {
        let with_body = ApiError {
            status_code: 404,
            response_body: r#"{"error_code":"RESOURCE_DOES_NOT_EXIST"}"#.into(),
        };
        assert_eq!(
            with_body.to_string(),
            r#"API error with response body: {"error_code":"RESOURCE_DOES_NOT_EXIST"} with status code: 404"#
        );

        let bare = ApiError {
            status_code: 503,
            response_body: String::new(),
        };
        assert_eq!(bare.to_string(), "API error with status code: 503");
    }

    #[test]
    fn classifies_api_errors() {
        let err = |status_code: u16, body: &str| {
            TrackingError::from(ApiError {
                status_code,
                response_body: body.into(),
            })
        };
        assert!(err(503, "").is_transient());
        assert!(err(429, "").is_transient());
        assert!(!err(400, "").is_transient());
        assert!(err(409, "").is_already_exists());
        assert!(err(400, r#"{"error_code":"RESOURCE_ALREADY_EXISTS"}"#).is_already_exists());
        assert!(!err(404, "").is_already_exists());
        assert_eq!(err(404, "").status_code(), Some(404));
    }

    #[test]
    fn experiment_accepts_string_timestamps() {
        let experiment: Experiment = serde_json::from_value(json!({
            "experiment_id": "7",
            "name": "evalhub",
            "creation_time": "1700000000000",
            "last_update_time": 1700000000001i64
        }))
        .unwrap();
        assert_eq!(experiment.creation_time, 1_700_000_000_000);
        assert_eq!(experiment.last_update_time, 1_700_000_000_001);
        assert!(experiment.tags.is_empty());
    }

    #[tokio::test]
    async fn create_and_fetch_experiment() {
        let app = Router::new()
            .route(
                "/api/2.0/mlflow/experiments/create",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["name"], "exp-a");
                    assert!(body.get("tags").is_none());
                    Json(json!({ "experiment_id": "42" }))
                }),
            )
            .route(
                "/api/2.0/mlflow/experiments/get-by-name",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    Json(json!({
                        "experiment": {
                            "experiment_id": "42",
                            "name": q["experiment_name"],
                            "artifact_location": "s3://bucket/42",
                            "lifecycle_stage": "active",
                            "tags": [{ "key": "team", "value": "eval" }]
                        }
                    }))
                }),
            );
        let client = client(&start_server(app).await);

        let created = client
            .create_experiment(&CreateExperimentRequest {
                name: "exp-a".into(),
                artifact_location: None,
                tags: vec![],
            })
            .await
            .unwrap();
        assert_eq!(created.experiment_id, "42");

        let fetched = client.get_experiment_by_name("exp-a").await.unwrap();
        assert_eq!(fetched.name, "exp-a");
        assert_eq!(fetched.lifecycle_stage, "active");
        assert_eq!(fetched.tags[0].key, "team");
    }

    #[tokio::test]
    async fn non_success_status_becomes_api_error() {
        let app = Router::new().route(
            "/api/2.0/mlflow/experiments/get",
            get(|| async {
                (
                    HttpStatus::NOT_FOUND,
                    r#"{"error_code":"RESOURCE_DOES_NOT_EXIST"}"#,
                )
            }),
        );
        let client = client(&start_server(app).await);

        match client.get_experiment("1").await {
            Err(TrackingError::Api(api)) => {
                assert_eq!(api.status_code, 404);
                assert!(api.response_body.contains("RESOURCE_DOES_NOT_EXIST"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_service_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(&format!("http://{addr}"))
            .get_experiment("1")
            .await
            .unwrap_err();
        assert!(matches!(err, TrackingError::Transport(_)));
        assert!(err.is_transient());
    }
}
