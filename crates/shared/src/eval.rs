use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Benchmark-dependent payload keyed by metric or artifact name.
///
/// Values keep whatever shape the workload reported (number, string, list,
/// nested object) so nothing is lost on the way to the tracking service.
pub type ValueMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable failure classification carried in `message_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The backend refused the job spec at submission time.
    JobSubmissionFailed,
    /// The job was accepted but could not be scheduled.
    SchedulingRejected,
    /// The job was scheduled but its infrastructure went away (eviction, OOM kill).
    InfrastructureFailure,
    /// The workload ran and exited non-zero.
    WorkloadFailed,
    /// The backend stopped reporting before a terminal status.
    JobLost,
    TrackingWriteFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::JobSubmissionFailed => "job_submission_failed",
            ErrorCode::SchedulingRejected => "scheduling_rejected",
            ErrorCode::InfrastructureFailure => "infrastructure_failure",
            ErrorCode::WorkloadFailed => "workload_failed",
            ErrorCode::JobLost => "job_lost",
            ErrorCode::TrackingWriteFailed => "tracking_write_failed",
        }
    }

    /// Infrastructure-side failures, as opposed to the workload itself failing.
    pub fn is_infrastructure(self) -> bool {
        matches!(
            self,
            ErrorCode::JobSubmissionFailed
                | ErrorCode::SchedulingRejected
                | ErrorCode::InfrastructureFailure
                | ErrorCode::JobLost
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
    pub message_code: ErrorCode,
}

impl ErrorMessage {
    pub fn new(message_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            message_code,
        }
    }
}
