//! Contract between the job dispatcher and a container execution platform.
//!
//! A backend accepts a fully-resolved [`JobSpec`] and reports raw
//! [`BackendStatus`] updates over a channel. Interpreting those updates
//! (failure classification, terminal-once semantics) is the dispatcher's job,
//! not the backend's.

use anyhow::Result;
use async_trait::async_trait;
use evalhub_shared::eval::ValueMap;
use evalhub_shared::providers::EnvVar;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub run_id: Uuid,
    pub image: String,
    pub entrypoint: String,
    pub resources: ResourceSpec,
    /// Sorted by name, names unique.
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_request: String,
    pub memory_request: String,
    pub cpu_limit: String,
    pub memory_limit: String,
}

/// What the workload wrote as its result document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    #[serde(default)]
    pub metrics: ValueMap,
    #[serde(default)]
    pub artifacts: ValueMap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendStatus {
    Scheduled,
    /// The platform refused to place the job.
    Rejected { reason: String },
    Running,
    Progress { message: String },
    Exited { exit_code: i32, output: JobOutput },
    /// The workload finished but left something the backend could not accept,
    /// such as an unreadable result document.
    Failed { reason: String },
    /// The job disappeared underneath us (eviction, OOM kill, node loss).
    Lost { reason: String },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("job spec rejected: {0}")]
    Rejected(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct SubmittedJob {
    pub job_name: String,
    pub statuses: mpsc::Receiver<BackendStatus>,
}

#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn submit(&self, spec: &JobSpec) -> Result<SubmittedJob, BackendError>;
    async fn terminate(&self, job_name: &str) -> Result<()>;
    fn name(&self) -> &'static str;
}
