use std::collections::HashSet;
use std::sync::Arc;

use evalhub_shared::error::DomainError;
use evalhub_shared::eval::{ErrorCode, ErrorMessage};
use evalhub_shared::providers::EnvVar;
use serde::Deserialize;
use uuid::Uuid;

use crate::catalog::ProviderCatalog;
use crate::dispatcher::{BenchmarkParams, JobDispatcher, JobEvent, JobEvents, JobHandle};
use crate::runs::{Run, RunTracker};
use crate::sync::TrackingSync;

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub provider_id: String,
    pub benchmark_id: String,
    /// Layered over the benchmark's catalog env.
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

/// Drives runs from submission to their terminal state.
///
/// Each accepted run gets one monitoring task that feeds job events into the
/// tracker. After the terminal transition the run is handed to
/// [`TrackingSync`]; its outcome never changes the run's status.
pub struct RunCoordinator {
    catalog: Arc<ProviderCatalog>,
    tracker: Arc<RunTracker>,
    dispatcher: JobDispatcher,
    sync: Option<Arc<TrackingSync>>,
}

impl RunCoordinator {
    pub fn new(
        catalog: Arc<ProviderCatalog>,
        tracker: Arc<RunTracker>,
        dispatcher: JobDispatcher,
        sync: Option<Arc<TrackingSync>>,
    ) -> Self {
        Self {
            catalog,
            tracker,
            dispatcher,
            sync,
        }
    }

    pub fn catalog(&self) -> &Arc<ProviderCatalog> {
        &self.catalog
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    /// Creates a run and submits its job.
    ///
    /// When submission fails the run is kept as Failed with code
    /// `job_submission_failed` and the submission error is returned. A run
    /// cancelled while the submission was in flight stays Cancelled.
    pub async fn submit(&self, request: RunRequest) -> Result<Run, DomainError> {
        validate_env(&request.env)?;
        let (provider, benchmark) = self
            .catalog
            .resolve_benchmark(&request.provider_id, &request.benchmark_id)?;
        let run = self.tracker.create(&request.provider_id, &request.benchmark_id)?;
        let run_id = run.run_id;

        let params = BenchmarkParams::new(&provider, &benchmark, &request.env);
        let JobHandle { control, events } =
            match self.dispatcher.submit(&provider.runtime, &params, run_id).await {
                Ok(handle) => handle,
                Err(err) => {
                    let error = ErrorMessage::new(ErrorCode::JobSubmissionFailed, err.to_string());
                    match self.tracker.fail(run_id, error) {
                        Ok(_) => self.spawn_sync(run_id),
                        Err(DomainError::InvalidTransition { from, .. }) => {
                            tracing::info!(
                                run_id = %run_id,
                                status = %from,
                                "run ended while its submission was in flight"
                            );
                        }
                        Err(other) => return Err(other),
                    }
                    return Err(err);
                }
            };

        if let Err(err) = self.tracker.attach_job(run_id, control.clone()) {
            // cancelled while the submission was in flight
            tracing::info!(run_id = %run_id, "run ended before job attached: {err}");
            control.cancel();
            if let Err(err) = control.terminate().await {
                tracing::warn!(
                    run_id = %run_id,
                    job = control.job_name(),
                    "failed to terminate job: {err:#}"
                );
            }
            return self.tracker.get(run_id);
        }

        self.spawn_monitor(run_id, events);
        self.tracker.get(run_id)
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<Run, DomainError> {
        let run = self.tracker.cancel(run_id).await?;
        self.spawn_sync(run_id);
        Ok(run)
    }

    fn spawn_monitor(&self, run_id: Uuid, events: JobEvents) {
        let tracker = self.tracker.clone();
        let sync = self.sync.clone();
        tokio::spawn(monitor_run(tracker, sync, run_id, events));
    }

    fn spawn_sync(&self, run_id: Uuid) {
        if let Some(sync) = self.sync.clone() {
            tokio::spawn(async move { log_to_tracking(&sync, run_id).await });
        }
    }
}

async fn monitor_run(
    tracker: Arc<RunTracker>,
    sync: Option<Arc<TrackingSync>>,
    run_id: Uuid,
    mut events: JobEvents,
) {
    while let Some(event) = events.next().await {
        let terminal = event.is_terminal();
        let applied = match event {
            JobEvent::Started => tracker.start(run_id).map(drop),
            JobEvent::Progress { message } => {
                tracing::debug!(run_id = %run_id, %message, "job progress");
                Ok(())
            }
            JobEvent::Succeeded { metrics, artifacts } => {
                tracker.complete(run_id, metrics, artifacts).map(drop)
            }
            JobEvent::Failed { error } => {
                let failure = DomainError::JobExecutionFailed(error.message.clone());
                tracing::debug!(run_id = %run_id, code = error.message_code.as_str(), "{failure}");
                tracker.fail(run_id, error).map(drop)
            }
        };

        if let Err(err) = applied {
            tracing::warn!(run_id = %run_id, "stopped monitoring run: {err}");
            return;
        }
        if terminal {
            if let Some(sync) = &sync {
                log_to_tracking(sync, run_id).await;
            }
            return;
        }
    }
    tracing::debug!(run_id = %run_id, "job event stream closed");
}

async fn log_to_tracking(sync: &TrackingSync, run_id: Uuid) {
    match sync.log_run(run_id).await {
        Ok(()) => {}
        // already recorded on the run as tracking_error
        Err(DomainError::TrackingWriteFailed(message)) => {
            tracing::debug!(run_id = %run_id, "tracking write failed: {message}");
        }
        Err(err) => tracing::warn!(run_id = %run_id, "could not log run to tracking service: {err}"),
    }
}

fn validate_env(env: &[EnvVar]) -> Result<(), DomainError> {
    let mut names = HashSet::new();
    for var in env {
        if var.name.trim().is_empty() {
            return Err(DomainError::Validation("env var name must not be empty".into()));
        }
        if !names.insert(var.name.as_str()) {
            return Err(DomainError::Validation(format!(
                "duplicate env var {}",
                var.name
            )));
        }
    }
    Ok(())
}
