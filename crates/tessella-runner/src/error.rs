//! Error taxonomy for task submission and execution.
//!
//! Every terminal failure a caller can observe is classified as one of the
//! [`RunnerError`] variants. Errors that cross the worker process boundary
//! travel as a type-tagged [`proxy`](crate::command::UnitOutcome) and are
//! reconstructed into a local [`RunnerError`] on the submitting side; the
//! remote error type itself is never transported.

use std::path::PathBuf;

/// Paths attached to a job-level failure for postmortem inspection.
///
/// These reference the submission script and the job's captured output so a
/// failed unit can be diagnosed without re-running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDiagnostics {
    /// The path to the submission script for the job.
    pub script: PathBuf,
    /// The path to the job's standard output file.
    pub stdout: PathBuf,
    /// The path to the job's standard error file.
    pub stderr: PathBuf,
}

impl std::fmt::Display for JobDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "script `{script}`, stdout `{stdout}`, stderr `{stderr}`",
            script = self.script.display(),
            stdout = self.stdout.display(),
            stderr = self.stderr.display(),
        )
    }
}

/// An error produced by a runner for one unit of work.
///
/// The variants follow the propagation policy of the engine:
///
/// * `Validation` errors are raised synchronously out of `submit` and
///   `multisubmit` before any job is prepared and before any status update.
/// * `Submission` errors occur before a scheduler job id was obtained; they
///   are terminal for the affected units and never retried.
/// * `TaskExecution` errors mean the task's own code failed inside the worker.
/// * `JobExecution` errors are infrastructure failures: a declared-finished
///   job with no output artifact, an unparsable scheduler response, or a
///   failed artifact transfer.
/// * `Shutdown` errors classify operations rejected or results cancelled
///   because the runner has begun shutting down.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    /// Input validation failed before any job was prepared.
    #[error("validation error: {message}")]
    Validation {
        /// A description of the violated requirement.
        message: String,
    },

    /// Submission failed before a scheduler job id was obtained.
    #[error("job submission failed: {message}")]
    Submission {
        /// A description of the submission failure.
        message: String,
    },

    /// The task's own code failed inside the worker process.
    #[error("task execution failed: {message}")]
    TaskExecution {
        /// A description of the task failure.
        message: String,
        /// The traceback captured on the execution host, if any.
        traceback: Option<String>,
    },

    /// An infrastructure failure occurred while executing or collecting a job.
    #[error("job execution failed: {message}")]
    JobExecution {
        /// A description of the infrastructure failure.
        message: String,
        /// Diagnostic file paths for the affected job, if known.
        diagnostics: Option<JobDiagnostics>,
    },

    /// The operation was rejected or the result cancelled by shutdown.
    #[error("runner is shutting down: {message}")]
    Shutdown {
        /// A description of the cancelled operation.
        message: String,
    },
}

impl RunnerError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a submission error.
    pub fn submission(message: impl Into<String>) -> Self {
        Self::Submission {
            message: message.into(),
        }
    }

    /// Creates a task execution error without a traceback.
    pub fn task_execution(message: impl Into<String>) -> Self {
        Self::TaskExecution {
            message: message.into(),
            traceback: None,
        }
    }

    /// Creates a job execution error without diagnostics.
    pub fn job_execution(message: impl Into<String>) -> Self {
        Self::JobExecution {
            message: message.into(),
            diagnostics: None,
        }
    }

    /// Creates a shutdown error.
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }

    /// Returns `true` if the error classifies a shutdown cancellation.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }

    /// Returns `true` if the error is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
