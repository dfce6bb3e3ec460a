//! Execution of one task unit and its serialized call protocol.
//!
//! A task executable is always invoked as
//! `<command line> --args-json <path> --out-json <path>` with its stdout and
//! stderr captured to a log file for postmortem. For cluster execution the
//! invocation is described by a [`UnitInput`] blob written at prepare time and
//! consumed by the `tessella-unit-worker` entrypoint on the execution host;
//! the worker reports back through a [`UnitOutcome`] blob. Failures cross the
//! process boundary as a type-tagged proxy, never as a transported error
//! type, since the two processes may not share type definitions.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::error::RunnerError;

/// The maximum number of log lines attached to a failure message.
const LOG_TAIL_LINES: usize = 20;

/// The serialized description of one task unit execution.
///
/// This is the call blob transferred to the execution host; every path in it
/// refers to the filesystem of the host that runs the unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct UnitInput {
    /// The fully-qualified command line of the task executable.
    pub command: String,
    /// The path of the JSON arguments file passed via `--args-json`.
    pub args_file: PathBuf,
    /// The path of the JSON output file passed via `--out-json`.
    pub out_file: PathBuf,
    /// The path of the file capturing the task's stdout and stderr.
    pub log_file: PathBuf,
}

/// The classification tag of a failure that crossed the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    /// The task's own code failed.
    Task,
    /// The execution infrastructure failed around the task.
    Job,
}

/// The serialized outcome of one task unit execution.
///
/// Exactly one outcome blob is written per unit; its existence doubles as the
/// completion sentinel for file-watching backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// The task completed successfully.
    Success {
        /// The metadata diff produced by the task, if any.
        ///
        /// A task that produces no output metadata is still successful.
        metadiff: Option<Value>,
    },
    /// The task or its surrounding infrastructure failed.
    Failure {
        /// The failure classification.
        kind: ProxyKind,
        /// A description of the failure.
        message: String,
        /// The traceback or log tail captured on the execution host, if any.
        traceback: Option<String>,
    },
}

impl UnitOutcome {
    /// Creates a task-failure outcome.
    pub fn task_failure(message: impl Into<String>, traceback: Option<String>) -> Self {
        Self::Failure {
            kind: ProxyKind::Task,
            message: message.into(),
            traceback,
        }
    }

    /// Creates an infrastructure-failure outcome.
    pub fn job_failure(message: impl Into<String>) -> Self {
        Self::Failure {
            kind: ProxyKind::Job,
            message: message.into(),
            traceback: None,
        }
    }

    /// Reconstructs a local result from the outcome, discriminating on the
    /// proxy kind.
    pub fn into_result(self) -> Result<Option<Value>, RunnerError> {
        match self {
            Self::Success { metadiff } => Ok(metadiff),
            Self::Failure {
                kind: ProxyKind::Task,
                message,
                traceback,
            } => Err(RunnerError::TaskExecution { message, traceback }),
            Self::Failure {
                kind: ProxyKind::Job,
                message,
                ..
            } => Err(RunnerError::job_execution(message)),
        }
    }
}

/// Reads the last [`LOG_TAIL_LINES`] lines of a log file.
///
/// Returns `None` if the log cannot be read or is empty.
pub(crate) fn log_tail(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim_end();
    if trimmed.is_empty() {
        return None;
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    Some(lines[start..].join("\n"))
}

/// Executes one task unit on the current host.
///
/// Any failure is captured into the returned outcome; this function never
/// errors so that the worker entrypoint always has an outcome to report.
pub async fn execute_unit(input: &UnitInput) -> UnitOutcome {
    let Some(argv) = shlex::split(&input.command) else {
        return UnitOutcome::job_failure(format!(
            "task command line `{command}` cannot be tokenized",
            command = input.command,
        ));
    };
    let Some((program, args)) = argv.split_first() else {
        return UnitOutcome::job_failure("task command line is empty");
    };

    // Both streams go to the same log file to preserve interleaving.
    let log = match std::fs::File::create(&input.log_file) {
        Ok(log) => log,
        Err(e) => {
            return UnitOutcome::job_failure(format!(
                "failed to create log file `{path}`: {e}",
                path = input.log_file.display(),
            ));
        }
    };
    let stderr_log = match log.try_clone() {
        Ok(clone) => clone,
        Err(e) => return UnitOutcome::job_failure(format!("failed to clone log handle: {e}")),
    };

    debug!(
        command = %input.command,
        args_file = %input.args_file.display(),
        "executing task unit",
    );

    let mut command = Command::new(program);
    command
        .args(args)
        .arg("--args-json")
        .arg(&input.args_file)
        .arg("--out-json")
        .arg(&input.out_file)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr_log))
        .kill_on_drop(true);

    let status = match command.status().await {
        Ok(status) => status,
        Err(e) => {
            return UnitOutcome::job_failure(format!(
                "failed to spawn task command `{program}`: {e}",
            ));
        }
    };

    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "terminated by signal".to_string());
        warn!(
            command = %input.command,
            %code,
            log = %input.log_file.display(),
            "task unit failed",
        );
        return UnitOutcome::task_failure(
            format!(
                "task exited with status {code}; see log `{path}`",
                path = input.log_file.display(),
            ),
            log_tail(&input.log_file),
        );
    }

    // A missing output file is not an error: the task may legitimately
    // produce no metadata.
    if !input.out_file.exists() {
        return UnitOutcome::Success { metadiff: None };
    }

    match std::fs::read_to_string(&input.out_file)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str::<Value>(&s).map_err(|e| e.to_string()))
    {
        Ok(metadiff) => UnitOutcome::Success {
            metadiff: Some(metadiff),
        },
        Err(e) => UnitOutcome::job_failure(format!(
            "task reported success but its output file `{path}` is unreadable: {e}",
            path = input.out_file.display(),
        )),
    }
}
