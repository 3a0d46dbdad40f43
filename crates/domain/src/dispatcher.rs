use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use evalhub_shared::error::DomainError;
use evalhub_shared::eval::{ErrorCode, ErrorMessage, ValueMap};
use evalhub_shared::providers::{BenchmarkResource, EnvVar, ProviderResource, ProviderRuntime};
use integration_core::{BackendStatus, JobBackend, JobSpec, ResourceSpec};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub const JOB_NAME_PREFIX: &str = "evalhub-";

/// Benchmark-side inputs to a job, layered over the provider's runtime template.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkParams {
    pub provider_id: String,
    pub benchmark_id: String,
    pub benchmark_name: Option<String>,
    /// Wins over the runtime's env on name collision.
    pub env: Vec<EnvVar>,
}

impl BenchmarkParams {
    /// Catalog-level benchmark env first, then per-request overrides on top.
    pub fn new(
        provider: &ProviderResource,
        benchmark: &BenchmarkResource,
        overrides: &[EnvVar],
    ) -> Self {
        Self {
            provider_id: provider.provider_id.clone(),
            benchmark_id: benchmark.benchmark_id.clone(),
            benchmark_name: benchmark.name.clone(),
            env: merge_env(&benchmark.env, overrides),
        }
    }
}

/// Layers `overrides` over `base`; names are unique in the result, which is
/// sorted by name.
pub fn merge_env(base: &[EnvVar], overrides: &[EnvVar]) -> Vec<EnvVar> {
    let mut merged: BTreeMap<&str, &str> = BTreeMap::new();
    for var in base.iter().chain(overrides) {
        merged.insert(var.name.as_str(), var.value.as_str());
    }
    merged
        .into_iter()
        .map(|(name, value)| EnvVar::new(name, value))
        .collect()
}

pub fn job_name(run_id: Uuid) -> String {
    format!("{JOB_NAME_PREFIX}{run_id}")
}

pub fn build_job_spec(runtime: &ProviderRuntime, params: &BenchmarkParams, run_id: Uuid) -> JobSpec {
    let identity = [
        EnvVar::new("EVALHUB_RUN_ID", run_id.to_string()),
        EnvVar::new("EVALHUB_PROVIDER_ID", params.provider_id.clone()),
        EnvVar::new("EVALHUB_BENCHMARK_ID", params.benchmark_id.clone()),
    ];
    let env = merge_env(&merge_env(&runtime.env, &params.env), &identity);

    JobSpec {
        name: job_name(run_id),
        run_id,
        image: runtime.image.clone(),
        entrypoint: runtime.entrypoint.clone(),
        resources: ResourceSpec {
            cpu_request: runtime.cpu_request.clone(),
            memory_request: runtime.memory_request.clone(),
            cpu_limit: runtime.cpu_limit.clone(),
            memory_limit: runtime.memory_limit.clone(),
        },
        env,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Started,
    Progress { message: String },
    Succeeded { metrics: ValueMap, artifacts: ValueMap },
    Failed { error: ErrorMessage },
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Succeeded { .. } | JobEvent::Failed { .. })
    }
}

pub struct JobDispatcher {
    backend: Arc<dyn JobBackend>,
}

impl JobDispatcher {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self { backend }
    }

    /// Submits one job. Failures are reported once and never retried.
    pub async fn submit(
        &self,
        runtime: &ProviderRuntime,
        params: &BenchmarkParams,
        run_id: Uuid,
    ) -> Result<JobHandle, DomainError> {
        let spec = build_job_spec(runtime, params, run_id);

        let submitted = self.backend.submit(&spec).await.map_err(|err| {
            tracing::warn!(
                run_id = %run_id,
                backend = self.backend.name(),
                "job submission failed: {err}"
            );
            DomainError::JobSubmissionFailed(err.to_string())
        })?;

        tracing::info!(
            run_id = %run_id,
            job = %submitted.job_name,
            backend = self.backend.name(),
            "job submitted"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        Ok(JobHandle {
            control: JobControl {
                job_name: submitted.job_name,
                backend: self.backend.clone(),
                cancel: Arc::new(cancel_tx),
            },
            events: JobEvents {
                statuses: submitted.statuses,
                cancelled: cancel_rx,
                watch_cancel: true,
                started: false,
                pending: None,
                finished: false,
            },
        })
    }
}

pub struct JobHandle {
    pub control: JobControl,
    pub events: JobEvents,
}

/// The steering half of a submitted job, kept by the run tracker.
#[derive(Clone)]
pub struct JobControl {
    job_name: String,
    backend: Arc<dyn JobBackend>,
    cancel: Arc<watch::Sender<bool>>,
}

impl JobControl {
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Stops event consumption; the paired [`JobEvents`] ends without a terminal event.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn terminate(&self) -> anyhow::Result<()> {
        self.backend.terminate(&self.job_name).await
    }
}

impl fmt::Debug for JobControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobControl")
            .field("job_name", &self.job_name)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Lazy, finite sequence of job events.
///
/// Yields at most one terminal event and nothing after it; once exhausted it
/// stays exhausted. `Started` always precedes `Succeeded`.
pub struct JobEvents {
    statuses: mpsc::Receiver<BackendStatus>,
    cancelled: watch::Receiver<bool>,
    watch_cancel: bool,
    started: bool,
    pending: Option<JobEvent>,
    finished: bool,
}

impl JobEvents {
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            if self.finished {
                return None;
            }
            if *self.cancelled.borrow() {
                self.finished = true;
                return None;
            }
            if let Some(event) = self.pending.take() {
                self.finished = event.is_terminal();
                return Some(event);
            }

            let status = if self.watch_cancel {
                tokio::select! {
                    biased;
                    changed = self.cancelled.changed() => {
                        if changed.is_err() {
                            self.watch_cancel = false;
                        }
                        continue;
                    }
                    status = self.statuses.recv() => status,
                }
            } else {
                self.statuses.recv().await
            };

            let event = match status {
                None => failed(
                    ErrorCode::JobLost,
                    "backend stopped reporting before the job finished",
                ),
                Some(BackendStatus::Scheduled) => continue,
                Some(BackendStatus::Running) => {
                    if self.started {
                        continue;
                    }
                    JobEvent::Started
                }
                Some(BackendStatus::Progress { message }) => JobEvent::Progress { message },
                Some(BackendStatus::Exited {
                    exit_code: 0,
                    output,
                }) => JobEvent::Succeeded {
                    metrics: output.metrics,
                    artifacts: output.artifacts,
                },
                Some(BackendStatus::Exited { exit_code, .. }) => failed(
                    ErrorCode::WorkloadFailed,
                    format!("job exited with status {exit_code}"),
                ),
                Some(BackendStatus::Failed { reason }) => failed(ErrorCode::WorkloadFailed, reason),
                Some(BackendStatus::Rejected { reason }) => failed(
                    ErrorCode::SchedulingRejected,
                    format!("job could not be scheduled: {reason}"),
                ),
                Some(BackendStatus::Lost { reason }) => {
                    failed(ErrorCode::InfrastructureFailure, reason)
                }
            };

            // failures may arrive before start; anything else implies the job ran
            let needs_start = !self.started && !matches!(event, JobEvent::Failed { .. });
            if needs_start && event != JobEvent::Started {
                self.started = true;
                self.pending = Some(event);
                return Some(JobEvent::Started);
            }
            if event == JobEvent::Started {
                self.started = true;
            }
            self.finished = event.is_terminal();
            return Some(event);
        }
    }
}

fn failed(code: ErrorCode, message: impl Into<String>) -> JobEvent {
    JobEvent::Failed {
        error: ErrorMessage::new(code, message),
    }
}
