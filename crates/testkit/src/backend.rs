//! Scriptable in-process [`JobBackend`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use integration_core::{BackendError, BackendStatus, JobBackend, JobSpec, SubmittedJob};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Replays a fixed status script for every submitted job.
///
/// With [`hold_open`](Self::hold_open) the status channel stays open after the
/// script, so a test can drive the job with [`push`](Self::push) or end it
/// through `terminate`.
#[derive(Default)]
pub struct InMemoryBackend {
    script: Vec<BackendStatus>,
    hold_open: bool,
    reject_with: Mutex<Option<String>>,
    submit_delay: Mutex<Option<Duration>>,
    fail_termination_with: Mutex<Option<String>>,
    attempts: AtomicUsize,
    submitted: Mutex<Vec<JobSpec>>,
    terminated: Mutex<Vec<String>>,
    open: Mutex<HashMap<String, mpsc::Sender<BackendStatus>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<BackendStatus>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn reject_submissions(&self, reason: impl Into<String>) {
        *self.reject_with.lock() = Some(reason.into());
    }

    /// Makes every later `submit` take `delay` before answering.
    pub fn delay_submissions(&self, delay: Duration) {
        *self.submit_delay.lock() = Some(delay);
    }

    pub fn fail_termination(&self, reason: impl Into<String>) {
        *self.fail_termination_with.lock() = Some(reason.into());
    }

    pub fn submit_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.submitted.lock().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().clone()
    }

    /// Sends a status to a held-open job. Returns false if the job is not open
    /// or nobody is listening any more.
    pub async fn push(&self, job_name: &str, status: BackendStatus) -> bool {
        let sender = self.open.lock().get(job_name).cloned();
        match sender {
            Some(sender) => sender.send(status).await.is_ok(),
            None => false,
        }
    }

    /// Closes a held-open job's status channel without a final status.
    pub fn close(&self, job_name: &str) {
        self.open.lock().remove(job_name);
    }
}

#[async_trait]
impl JobBackend for InMemoryBackend {
    async fn submit(&self, spec: &JobSpec) -> Result<SubmittedJob, BackendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.submit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.reject_with.lock().clone() {
            return Err(BackendError::Rejected(reason));
        }
        self.submitted.lock().push(spec.clone());

        let (tx, rx) = mpsc::channel(self.script.len() + 16);
        for status in &self.script {
            // capacity covers the whole script
            let _ = tx.try_send(status.clone());
        }
        if self.hold_open {
            self.open.lock().insert(spec.name.clone(), tx);
        }

        Ok(SubmittedJob {
            job_name: spec.name.clone(),
            statuses: rx,
        })
    }

    async fn terminate(&self, job_name: &str) -> anyhow::Result<()> {
        if let Some(reason) = self.fail_termination_with.lock().clone() {
            return Err(anyhow!("terminate {job_name}: {reason}"));
        }
        self.terminated.lock().push(job_name.to_string());
        if let Some(sender) = self.open.lock().remove(job_name) {
            let _ = sender.try_send(BackendStatus::Lost {
                reason: "terminated".into(),
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}
