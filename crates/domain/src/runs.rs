use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use evalhub_shared::error::DomainError;
use evalhub_shared::eval::{ErrorMessage, RunStatus, Timestamp, ValueMap};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::ProviderCatalog;
use crate::dispatcher::JobControl;

/// Status record of one benchmark execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub run_id: Uuid,
    pub provider_id: String,
    pub benchmark_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark_name: Option<String>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "ValueMap::is_empty")]
    pub metrics: ValueMap,
    #[serde(skip_serializing_if = "ValueMap::is_empty")]
    pub artifacts: ValueMap,
    #[serde(rename = "error_message", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_error: Option<ErrorMessage>,
}

impl Run {
    fn new(provider_id: &str, benchmark_id: &str, benchmark_name: Option<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            provider_id: provider_id.to_string(),
            benchmark_id: benchmark_id.to_string(),
            benchmark_name,
            status: RunStatus::Pending,
            metrics: ValueMap::new(),
            artifacts: ValueMap::new(),
            error: None,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            tracking_run_id: None,
            tracking_error: None,
        }
    }

    fn invalid(&self, action: &'static str) -> DomainError {
        DomainError::InvalidTransition {
            run_id: self.run_id,
            from: self.status,
            action,
        }
    }

    /// Returns whether the run actually moved; a second start is a no-op.
    fn start(&mut self, now: Timestamp) -> Result<bool, DomainError> {
        match self.status {
            RunStatus::Pending => {
                self.status = RunStatus::Running;
                self.started_at = Some(now);
                Ok(true)
            }
            RunStatus::Running => Ok(false),
            _ => Err(self.invalid("start")),
        }
    }

    fn complete(
        &mut self,
        metrics: ValueMap,
        artifacts: ValueMap,
        now: Timestamp,
    ) -> Result<(), DomainError> {
        if self.status != RunStatus::Running {
            return Err(self.invalid("complete"));
        }
        self.metrics = metrics;
        self.artifacts = artifacts;
        self.finish(RunStatus::Succeeded, now);
        Ok(())
    }

    fn fail(&mut self, error: ErrorMessage, now: Timestamp) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(self.invalid("fail"));
        }
        self.error = Some(error);
        self.finish(RunStatus::Failed, now);
        Ok(())
    }

    fn cancel(&mut self, now: Timestamp) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.finish(RunStatus::Cancelled, now);
        Ok(())
    }

    fn finish(&mut self, status: RunStatus, now: Timestamp) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_seconds = self
            .started_at
            .map(|started| (now - started).num_seconds());
    }
}

struct RunEntry {
    run: Run,
    job: Option<JobControl>,
}

#[derive(Default)]
struct RunIndex {
    by_id: HashMap<Uuid, Arc<Mutex<RunEntry>>>,
    order: Vec<Uuid>,
}

/// Owner of every run's state machine.
///
/// Each run sits behind its own lock. A transition checks its precondition
/// under that lock, so of two racing terminal transitions exactly one wins and
/// the other gets `InvalidTransition`. Locks are never held across an await.
pub struct RunTracker {
    catalog: Arc<ProviderCatalog>,
    runs: RwLock<RunIndex>,
}

impl RunTracker {
    pub fn new(catalog: Arc<ProviderCatalog>) -> Self {
        Self {
            catalog,
            runs: RwLock::new(RunIndex::default()),
        }
    }

    pub fn create(&self, provider_id: &str, benchmark_id: &str) -> Result<Run, DomainError> {
        let (_, benchmark) = self.catalog.resolve_benchmark(provider_id, benchmark_id)?;
        let run = Run::new(provider_id, benchmark_id, benchmark.name);

        let mut runs = self.runs.write();
        runs.by_id.insert(
            run.run_id,
            Arc::new(Mutex::new(RunEntry {
                run: run.clone(),
                job: None,
            })),
        );
        runs.order.push(run.run_id);
        drop(runs);

        tracing::info!(
            run_id = %run.run_id,
            provider_id,
            benchmark_id,
            "run created"
        );
        Ok(run)
    }

    pub fn get(&self, run_id: Uuid) -> Result<Run, DomainError> {
        Ok(self.entry(run_id)?.lock().run.clone())
    }

    /// Snapshots of every run, oldest first.
    pub fn list(&self) -> Vec<Run> {
        let entries: Vec<_> = {
            let runs = self.runs.read();
            runs.order
                .iter()
                .filter_map(|id| runs.by_id.get(id).cloned())
                .collect()
        };
        entries.iter().map(|entry| entry.lock().run.clone()).collect()
    }

    pub fn start(&self, run_id: Uuid) -> Result<Run, DomainError> {
        self.transition(run_id, |entry| {
            if entry.run.start(Utc::now())? {
                tracing::info!(run_id = %run_id, "run started");
            }
            Ok(())
        })
    }

    pub fn complete(
        &self,
        run_id: Uuid,
        metrics: ValueMap,
        artifacts: ValueMap,
    ) -> Result<Run, DomainError> {
        self.transition(run_id, |entry| {
            entry.run.complete(metrics, artifacts, Utc::now())?;
            entry.job = None;
            tracing::info!(
                run_id = %run_id,
                duration_seconds = ?entry.run.duration_seconds,
                "run succeeded"
            );
            Ok(())
        })
    }

    pub fn fail(&self, run_id: Uuid, error: ErrorMessage) -> Result<Run, DomainError> {
        self.transition(run_id, |entry| {
            let code = error.message_code;
            entry.run.fail(error, Utc::now())?;
            entry.job = None;
            tracing::warn!(
                run_id = %run_id,
                code = code.as_str(),
                infrastructure = code.is_infrastructure(),
                "run failed"
            );
            Ok(())
        })
    }

    /// Moves the run to Cancelled, then asks the backend to kill its job.
    /// A failed kill is logged; the run stays Cancelled.
    pub async fn cancel(&self, run_id: Uuid) -> Result<Run, DomainError> {
        let mut job = None;
        let run = self.transition(run_id, |entry| {
            entry.run.cancel(Utc::now())?;
            job = entry.job.take();
            Ok(())
        })?;
        tracing::info!(run_id = %run_id, "run cancelled");

        if let Some(job) = job {
            job.cancel();
            if let Err(err) = job.terminate().await {
                tracing::warn!(
                    run_id = %run_id,
                    job = job.job_name(),
                    "failed to terminate job: {err:#}"
                );
            }
        }
        Ok(run)
    }

    /// Registers the job steering a run. Fails if the run already ended, in
    /// which case the caller owns stopping the job.
    pub fn attach_job(&self, run_id: Uuid, job: JobControl) -> Result<(), DomainError> {
        self.transition(run_id, |entry| {
            if entry.run.status.is_terminal() {
                return Err(entry.run.invalid("attach job to"));
            }
            entry.job = Some(job);
            Ok(())
        })
        .map(|_| ())
    }

    /// Records the tracking-service run id. Set once; repeating the same id is
    /// accepted, a different id is rejected.
    pub fn assign_tracking_run_id(
        &self,
        run_id: Uuid,
        tracking_run_id: &str,
    ) -> Result<Run, DomainError> {
        self.transition(run_id, |entry| match &entry.run.tracking_run_id {
            Some(existing) if existing == tracking_run_id => Ok(()),
            Some(_) => Err(entry.run.invalid("reassign tracking run id of")),
            None => {
                entry.run.tracking_run_id = Some(tracking_run_id.to_string());
                Ok(())
            }
        })
    }

    /// Sets or clears the tracking failure annotation. Never touches status.
    pub fn annotate_tracking_error(
        &self,
        run_id: Uuid,
        error: Option<ErrorMessage>,
    ) -> Result<Run, DomainError> {
        self.transition(run_id, |entry| {
            entry.run.tracking_error = error;
            Ok(())
        })
    }

    fn entry(&self, run_id: Uuid) -> Result<Arc<Mutex<RunEntry>>, DomainError> {
        self.runs
            .read()
            .by_id
            .get(&run_id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("run {run_id}")))
    }

    fn transition<F>(&self, run_id: Uuid, apply: F) -> Result<Run, DomainError>
    where
        F: FnOnce(&mut RunEntry) -> Result<(), DomainError>,
    {
        let entry = self.entry(run_id)?;
        let mut entry = entry.lock();
        apply(&mut entry)?;
        Ok(entry.run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use evalhub_shared::eval::ErrorCode;
    use evalhub_shared::providers::{BenchmarkResource, ProviderResource, ProviderRuntime};
    use serde_json::json;

    fn catalog() -> Arc<ProviderCatalog> {
        Arc::new(
            ProviderCatalog::new(vec![ProviderResource {
                provider_id: "openai".into(),
                provider_name: "OpenAI Evals".into(),
                description: String::new(),
                provider_type: "builtin".into(),
                base_url: None,
                benchmarks: vec![BenchmarkResource {
                    benchmark_id: "mmlu".into(),
                    name: Some("MMLU".into()),
                    description: None,
                    category: None,
                    metrics: vec!["accuracy".into()],
                    env: vec![],
                }],
                runtime: ProviderRuntime {
                    image: "quay.io/eval-hub/openai:latest".into(),
                    ..Default::default()
                },
            }])
            .unwrap(),
        )
    }

    fn assert_invariants(run: &Run) {
        assert_eq!(run.completed_at.is_some(), run.status.is_terminal());
        assert_eq!(run.error.is_some(), run.status == RunStatus::Failed);
        match (run.started_at, run.completed_at) {
            (Some(started), Some(completed)) => assert_eq!(
                run.duration_seconds,
                Some((completed - started).num_seconds())
            ),
            _ => assert_eq!(run.duration_seconds, None),
        }
    }

    fn failure() -> ErrorMessage {
        ErrorMessage::new(ErrorCode::WorkloadFailed, "job exited with status 1")
    }

    #[test]
    fn happy_path_scenario() {
        let tracker = RunTracker::new(catalog());

        let run = tracker.create("openai", "mmlu").unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.benchmark_name.as_deref(), Some("MMLU"));
        assert!(run.started_at.is_none() && run.completed_at.is_none());
        assert_invariants(&run);

        let running = tracker.start(run.run_id).unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert!(running.started_at.is_some());
        assert_invariants(&running);

        let metrics: ValueMap = [("accuracy".to_string(), json!(0.81))].into();
        let done = tracker
            .complete(run.run_id, metrics.clone(), ValueMap::new())
            .unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.metrics, metrics);
        assert!(done.completed_at.is_some());
        assert_invariants(&done);
    }

    #[test]
    fn unknown_benchmark_is_not_found() {
        let tracker = RunTracker::new(catalog());
        assert!(matches!(
            tracker.create("openai", "unknown-bench"),
            Err(DomainError::BenchmarkNotFound { .. })
        ));
        assert!(matches!(
            tracker.create("nope", "mmlu"),
            Err(DomainError::ProviderNotFound { .. })
        ));
        assert!(tracker.list().is_empty());
        assert!(matches!(
            tracker.get(Uuid::new_v4()),
            Err(DomainError::NotFound(_))
        ));
    }

    #[test]
    fn second_complete_is_rejected() {
        let tracker = RunTracker::new(catalog());
        let run = tracker.create("openai", "mmlu").unwrap();
        tracker.start(run.run_id).unwrap();
        tracker
            .complete(run.run_id, ValueMap::new(), ValueMap::new())
            .unwrap();

        let err = tracker
            .complete(run.run_id, ValueMap::new(), ValueMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::InvalidTransition {
                from: RunStatus::Succeeded,
                ..
            }
        ));
    }

    #[test]
    fn complete_requires_running() {
        let tracker = RunTracker::new(catalog());
        let run = tracker.create("openai", "mmlu").unwrap();
        assert!(matches!(
            tracker.complete(run.run_id, ValueMap::new(), ValueMap::new()),
            Err(DomainError::InvalidTransition { .. })
        ));
        assert_eq!(tracker.get(run.run_id).unwrap().status, RunStatus::Pending);
    }

    #[test]
    fn start_is_idempotent_but_not_after_terminal() {
        let tracker = RunTracker::new(catalog());
        let run = tracker.create("openai", "mmlu").unwrap();
        let first = tracker.start(run.run_id).unwrap();
        let second = tracker.start(run.run_id).unwrap();
        assert_eq!(first.started_at, second.started_at);

        tracker.fail(run.run_id, failure()).unwrap();
        assert!(matches!(
            tracker.start(run.run_id),
            Err(DomainError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn fail_from_pending_has_no_duration() {
        let tracker = RunTracker::new(catalog());
        let run = tracker.create("openai", "mmlu").unwrap();
        let failed = tracker.fail(run.run_id, failure()).unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error, Some(failure()));
        assert_invariants(&failed);

        assert!(matches!(
            tracker.fail(run.run_id, failure()),
            Err(DomainError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_after_success_is_rejected() {
        let tracker = RunTracker::new(catalog());
        let run = tracker.create("openai", "mmlu").unwrap();
        tracker.start(run.run_id).unwrap();
        tracker
            .complete(run.run_id, ValueMap::new(), ValueMap::new())
            .unwrap();

        assert!(matches!(
            tracker.cancel(run.run_id).await,
            Err(DomainError::InvalidTransition {
                from: RunStatus::Succeeded,
                ..
            })
        ));
        assert_eq!(
            tracker.get(run.run_id).unwrap().status,
            RunStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn cancel_pending_and_running() {
        let tracker = RunTracker::new(catalog());

        let pending = tracker.create("openai", "mmlu").unwrap();
        let cancelled = tracker.cancel(pending.run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_invariants(&cancelled);

        let running = tracker.create("openai", "mmlu").unwrap();
        tracker.start(running.run_id).unwrap();
        let cancelled = tracker.cancel(running.run_id).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert!(cancelled.duration_seconds.is_some());
        assert_invariants(&cancelled);
    }

    #[test]
    fn concurrent_terminal_transitions_have_one_winner() {
        let tracker = Arc::new(RunTracker::new(catalog()));
        let run = tracker.create("openai", "mmlu").unwrap();
        tracker.start(run.run_id).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        tracker
                            .complete(run.run_id, ValueMap::new(), ValueMap::new())
                            .is_ok()
                    } else {
                        tracker.fail(run.run_id, failure()).is_ok()
                    }
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_invariants(&tracker.get(run.run_id).unwrap());
    }

    #[test]
    fn tracking_run_id_is_set_once() {
        let tracker = RunTracker::new(catalog());
        let run = tracker.create("openai", "mmlu").unwrap();

        tracker.assign_tracking_run_id(run.run_id, "abc").unwrap();
        tracker.assign_tracking_run_id(run.run_id, "abc").unwrap();
        assert!(matches!(
            tracker.assign_tracking_run_id(run.run_id, "def"),
            Err(DomainError::InvalidTransition { .. })
        ));
        assert_eq!(
            tracker.get(run.run_id).unwrap().tracking_run_id.as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn duration_uses_start_and_completion() {
        let mut run = Run::new("openai", "mmlu", None);
        let started = Utc::now();
        run.start(started).unwrap();
        run.complete(ValueMap::new(), ValueMap::new(), started + Duration::seconds(42))
            .unwrap();
        assert_eq!(run.duration_seconds, Some(42));
    }

    #[test]
    fn json_omits_absent_fields() {
        let tracker = RunTracker::new(catalog());
        let run = tracker.create("openai", "mmlu").unwrap();
        let value = serde_json::to_value(&run).unwrap();
        let object = value.as_object().unwrap();

        assert_eq!(object["status"], "pending");
        assert_eq!(object["benchmark_name"], "MMLU");
        for absent in [
            "metrics",
            "artifacts",
            "error_message",
            "started_at",
            "completed_at",
            "duration_seconds",
            "tracking_run_id",
            "tracking_error",
        ] {
            assert!(!object.contains_key(absent), "{absent} should be omitted");
        }

        let failed = tracker.fail(run.run_id, failure()).unwrap();
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["error_message"]["message_code"], "workload_failed");
    }
}
