use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use evalhub_shared::error::DomainError;
use evalhub_shared::eval::{ErrorCode, ErrorMessage, RunStatus, ValueMap};
use evalhub_shared::settings::{RetrySettings, TrackingSettings};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::runs::{Run, RunTracker};
use crate::tracking::{
    CreateExperimentRequest, CreateRunRequest, LogBatchRequest, Metric, Param, RunTag,
    TrackingClient, TrackingError, UpdateRunRequest,
};

/// Upper bound on metrics + params + tags in one log-batch call.
pub const MAX_BATCH_ENTRIES: usize = 1000;
/// Longest tag value the tracking service accepts.
pub const MAX_TAG_VALUE: usize = 5000;
/// Longest metric key the tracking service accepts.
pub const MAX_METRIC_KEY: usize = 250;

pub const TAG_RUN_ID: &str = "evalhub.run_id";
pub const TAG_STATUS: &str = "evalhub.status";
pub const TAG_METRICS: &str = "evalhub.metrics";
pub const TAG_ARTIFACTS: &str = "evalhub.artifacts";
pub const TAG_ERROR: &str = "evalhub.error";

/// Bounded exponential backoff: `min(base * 2^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(31);
        let scaled = self.base_delay.saturating_mul(1u32 << exp);
        scaled.min(self.max_delay)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

/// Mirrors runs into the tracking service.
///
/// Runs are read through snapshots, so no run lock is held while a request is
/// in flight. Writes for the same run are serialized so only one tracking run
/// is ever created for it. A failed write is recorded on the run as
/// `tracking_error` and never alters its status.
pub struct TrackingSync {
    client: TrackingClient,
    tracker: Arc<RunTracker>,
    experiment_name: String,
    artifact_location: Option<String>,
    retry: RetryPolicy,
    experiments: RwLock<HashMap<String, String>>,
    writers: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl TrackingSync {
    pub fn new(client: TrackingClient, tracker: Arc<RunTracker>, settings: &TrackingSettings) -> Self {
        Self {
            client,
            tracker,
            experiment_name: settings.experiment_name.clone(),
            artifact_location: settings.artifact_location.clone(),
            retry: RetryPolicy::from(&settings.retry),
            experiments: RwLock::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the id of the named experiment, creating it if needed.
    ///
    /// Concurrent callers may both try to create it; the loser sees a conflict
    /// and falls back to lookup by name, so both end up with the same id.
    pub async fn ensure_experiment(&self, name: &str) -> Result<String, TrackingError> {
        let cached = self.experiments.read().get(name).cloned();
        if let Some(id) = cached {
            return Ok(id);
        }

        let experiment_id = match self
            .with_retry("get_experiment_by_name", || self.client.get_experiment_by_name(name))
            .await
        {
            Ok(experiment) => experiment.experiment_id,
            Err(err) if err.status_code() == Some(404) => self.create_experiment(name).await?,
            Err(err) => return Err(err),
        };

        self.experiments
            .write()
            .insert(name.to_string(), experiment_id.clone());
        Ok(experiment_id)
    }

    async fn create_experiment(&self, name: &str) -> Result<String, TrackingError> {
        let request = CreateExperimentRequest {
            name: name.to_string(),
            artifact_location: self.artifact_location.clone(),
            tags: vec![],
        };
        match self
            .with_retry("create_experiment", || self.client.create_experiment(&request))
            .await
        {
            Ok(created) => {
                tracing::info!(
                    experiment = name,
                    experiment_id = %created.experiment_id,
                    "created tracking experiment"
                );
                Ok(created.experiment_id)
            }
            Err(err) if err.is_already_exists() => {
                tracing::debug!(experiment = name, "experiment created concurrently, looking it up");
                let experiment = self
                    .with_retry("get_experiment_by_name", || {
                        self.client.get_experiment_by_name(name)
                    })
                    .await?;
                Ok(experiment.experiment_id)
            }
            Err(err) => Err(err),
        }
    }

    /// Writes the run's current state to the tracking service.
    ///
    /// On failure the run is annotated with a `tracking_write_failed` error and
    /// `TrackingWriteFailed` is returned; a later successful write clears the
    /// annotation.
    pub async fn log_run(&self, run_id: Uuid) -> Result<(), DomainError> {
        let writer = self.writers.lock().entry(run_id).or_default().clone();
        let result = {
            let _turn = writer.lock().await;
            self.log_snapshot(run_id).await
        };
        self.release_writer(run_id, writer);
        result
    }

    /// Forgets the run's writer lock once nobody else holds it and the run
    /// can no longer change.
    fn release_writer(&self, run_id: Uuid, writer: Arc<AsyncMutex<()>>) {
        let mut writers = self.writers.lock();
        // one reference in the map, one here
        if Arc::strong_count(&writer) > 2 {
            return;
        }
        let finished = self
            .tracker
            .get(run_id)
            .map(|run| run.status.is_terminal())
            .unwrap_or(true);
        if finished {
            writers.remove(&run_id);
        }
    }

    async fn log_snapshot(&self, run_id: Uuid) -> Result<(), DomainError> {
        let run = self.tracker.get(run_id)?;

        match self.write_run(&run).await {
            Ok(tracking_run_id) => {
                if run.tracking_error.is_some() {
                    self.tracker.annotate_tracking_error(run_id, None)?;
                }
                tracing::info!(
                    run_id = %run_id,
                    tracking_run_id = %tracking_run_id,
                    status = %run.status,
                    "run logged to tracking service"
                );
                Ok(())
            }
            Err(SyncFailure::Tracking(err)) => {
                let message = err.to_string();
                tracing::warn!(run_id = %run_id, "failed to log run to tracking service: {message}");
                self.tracker.annotate_tracking_error(
                    run_id,
                    Some(ErrorMessage::new(ErrorCode::TrackingWriteFailed, message.clone())),
                )?;
                Err(DomainError::TrackingWriteFailed(message))
            }
            Err(SyncFailure::Domain(err)) => Err(err),
        }
    }

    async fn write_run(&self, run: &Run) -> Result<String, SyncFailure> {
        let tracking_run_id = match &run.tracking_run_id {
            Some(id) => id.clone(),
            None => {
                let experiment_id = self.ensure_experiment(&self.experiment_name).await?;
                let request = CreateRunRequest {
                    experiment_id,
                    run_name: format!("{}-{}", run.benchmark_id, run.run_id),
                    start_time: run.started_at.unwrap_or_else(Utc::now).timestamp_millis(),
                    tags: vec![RunTag::new(TAG_RUN_ID, run.run_id.to_string())],
                };
                let info = self
                    .with_retry("create_run", || self.client.create_run(&request))
                    .await?;
                self.tracker
                    .assign_tracking_run_id(run.run_id, &info.run_id)?;
                info.run_id
            }
        };

        let timestamp = run.completed_at.unwrap_or_else(Utc::now).timestamp_millis();
        for batch in build_batches(run, &tracking_run_id, timestamp) {
            self.with_retry("log_batch", || self.client.log_batch(&batch))
                .await?;
        }

        let update = UpdateRunRequest {
            run_id: tracking_run_id.clone(),
            status: tracking_status(run.status).to_string(),
            end_time: run.completed_at.map(|at| at.timestamp_millis()),
        };
        self.with_retry("update_run", || self.client.update_run(&update))
            .await?;

        Ok(tracking_run_id)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, TrackingError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TrackingError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "tracking request failed, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

enum SyncFailure {
    Tracking(TrackingError),
    Domain(DomainError),
}

impl From<TrackingError> for SyncFailure {
    fn from(err: TrackingError) -> Self {
        SyncFailure::Tracking(err)
    }
}

impl From<DomainError> for SyncFailure {
    fn from(err: DomainError) -> Self {
        SyncFailure::Domain(err)
    }
}

pub fn tracking_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "SCHEDULED",
        RunStatus::Running => "RUNNING",
        RunStatus::Succeeded => "FINISHED",
        RunStatus::Failed => "FAILED",
        RunStatus::Cancelled => "KILLED",
    }
}

/// Numeric leaves of `metrics`, nested keys joined with `.`, sorted by key.
pub fn flatten_metrics(metrics: &ValueMap) -> Vec<(String, f64)> {
    fn walk(prefix: &str, value: &Value, out: &mut Vec<(String, f64)>) {
        match value {
            Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    out.push((prefix.to_string(), v));
                }
            }
            Value::Object(map) => {
                for (key, nested) in map {
                    walk(&format!("{prefix}.{key}"), nested, out);
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    for (key, value) in metrics {
        walk(key, value, &mut out);
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

/// Splits the run's params, tags and metrics into log-batch requests of at
/// most [`MAX_BATCH_ENTRIES`] entries. Params and tags ride in the first one.
pub fn build_batches(run: &Run, tracking_run_id: &str, timestamp: i64) -> Vec<LogBatchRequest> {
    let params = vec![
        Param {
            key: "provider_id".into(),
            value: run.provider_id.clone(),
        },
        Param {
            key: "benchmark_id".into(),
            value: run.benchmark_id.clone(),
        },
    ];

    let mut tags = vec![
        RunTag::new(TAG_RUN_ID, run.run_id.to_string()),
        RunTag::new(TAG_STATUS, run.status.as_str()),
    ];
    for (key, map) in [(TAG_METRICS, &run.metrics), (TAG_ARTIFACTS, &run.artifacts)] {
        if map.is_empty() {
            continue;
        }
        let text = json_text(map);
        if text.len() > MAX_TAG_VALUE {
            tracing::warn!(
                run_id = %run.run_id,
                tag = key,
                length = text.len(),
                "tag value too long for the tracking service, omitting it"
            );
            continue;
        }
        tags.push(RunTag::new(key, text));
    }
    if let Some(error) = &run.error {
        tags.push(RunTag::new(TAG_ERROR, truncate(&error.message, MAX_TAG_VALUE)));
    }

    let mut metrics = flatten_metrics(&run.metrics)
        .into_iter()
        .map(|(key, value)| Metric {
            key: metric_key(&key),
            value,
            timestamp,
            step: 0,
        });

    let first_room = MAX_BATCH_ENTRIES.saturating_sub(params.len() + tags.len());
    let mut batches = vec![LogBatchRequest {
        run_id: tracking_run_id.to_string(),
        metrics: metrics.by_ref().take(first_room).collect(),
        params,
        tags,
    }];
    loop {
        let chunk: Vec<Metric> = metrics.by_ref().take(MAX_BATCH_ENTRIES).collect();
        if chunk.is_empty() {
            break;
        }
        batches.push(LogBatchRequest {
            run_id: tracking_run_id.to_string(),
            metrics: chunk,
            ..Default::default()
        });
    }
    batches
}

fn json_text(map: &ValueMap) -> String {
    serde_json::to_string(map).unwrap_or_default()
}

/// Rewrites `key` into the tracking service's key alphabet: alphanumerics,
/// `_`, `-`, `.`, ` ` and `/`. Anything else becomes `_`.
pub fn metric_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c,
            '_' | '-' | '.' | ' ' | '/' => c,
            _ => '_',
        })
        .collect();
    truncate(&cleaned, MAX_METRIC_KEY)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
