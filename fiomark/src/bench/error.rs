//! Benchmark error classification.
//!
//! One error type for every way a run can go wrong, with methods that tell
//! the controller whether a failure ends the run or only the current job.

use crate::bench::profile::ProfileError;

/// Errors that can occur while running a benchmark.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BenchmarkError {
    #[error("fio not found: {0}")]
    ToolNotFound(String),

    #[error("failed to launch fio for {label}: {reason}")]
    LaunchFailed { label: String, reason: String },

    #[error("{label} failed: {reason}")]
    JobFailed { label: String, reason: String },

    #[error("failed to prepare test file: {0}")]
    PrepareFailed(String),

    #[error("invalid profile: {0}")]
    InvalidProfile(#[from] ProfileError),

    #[error("a benchmark is already running")]
    AlreadyRunning,
}

impl BenchmarkError {
    /// Whether the error is scoped to a single job rather than the run.
    pub fn is_job_level(&self) -> bool {
        matches!(self, Self::LaunchFailed { .. } | Self::JobFailed { .. })
    }

    /// Whether the error was raised before any job could start.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound(_) | Self::PrepareFailed(_) | Self::InvalidProfile(_)
        )
    }
}
