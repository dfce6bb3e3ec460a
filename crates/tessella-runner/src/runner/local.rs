//! The local execution backend.
//!
//! Tasks run directly on the server host as child processes; no scheduler,
//! no live-jobs table, and no polling loop are involved. Concurrency is
//! bounded by a semaphore sized at construction time, and shutdown is a
//! cancellation token observed between and during unit executions.

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::command::UnitInput;
use crate::command::execute_unit;
use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::files::TaskFiles;
use crate::runner::MultiOutcome;
use crate::runner::MultisubmitRequest;
use crate::runner::SubmitRequest;
use crate::runner::WorkflowRunner;
use crate::runner::terminal_status;
use crate::runner::validate_multisubmit;
use crate::runner::validate_submit;
use crate::runner::write_args;
use crate::status::StatusTracker;
use crate::status::UnitStatus;
use crate::task::HistoryUnitId;
use crate::task::TaskType;

/// The default number of task units allowed to run concurrently.
pub const DEFAULT_LOCAL_PARALLELISM: usize = 4;

/// A runner executing task units as local child processes.
pub struct LocalRunner {
    /// The status-tracking collaborator.
    status: Arc<dyn StatusTracker>,
    /// Bounds the number of concurrently running units.
    semaphore: Arc<Semaphore>,
    /// Cancelled when shutdown begins.
    token: CancellationToken,
}

impl LocalRunner {
    /// Creates a local runner with the given concurrency bound.
    pub fn new(
        config: &RunnerConfig,
        status: Arc<dyn StatusTracker>,
        parallelism: usize,
    ) -> Result<Self> {
        config.validate().context("invalid runner configuration")?;
        if parallelism == 0 {
            anyhow::bail!("local parallelism must be greater than zero");
        }
        Ok(Self {
            status,
            semaphore: Arc::new(Semaphore::new(parallelism)),
            token: CancellationToken::new(),
        })
    }

    /// Prepares one invocation for local execution: ensures the subfolder
    /// exists, writes the arguments file, and builds the call description.
    fn prepare_unit(
        files: &TaskFiles,
        command_line: &str,
        parameters: &serde_json::Map<String, Value>,
    ) -> Result<UnitInput, RunnerError> {
        std::fs::create_dir_all(files.subfolder()).map_err(|e| {
            RunnerError::submission(format!(
                "failed to create the task subfolder `{path}`: {e}",
                path = files.subfolder().display(),
            ))
        })?;
        write_args(files, parameters)?;
        Ok(UnitInput {
            command: command_line.to_string(),
            args_file: files.args_json(),
            out_file: files.metadiff_json(),
            log_file: files.log_file(),
        })
    }

    /// Runs one prepared unit under the concurrency bound, honouring
    /// shutdown.
    async fn run_unit(
        semaphore: Arc<Semaphore>,
        token: CancellationToken,
        input: UnitInput,
    ) -> Result<Option<Value>, RunnerError> {
        let shutdown =
            || RunnerError::shutdown("the unit was cancelled before it could complete");

        let permit = tokio::select! {
            _ = token.cancelled() => return Err(shutdown()),
            permit = semaphore.acquire_owned() => permit.map_err(|_| shutdown())?,
        };
        let _permit = permit;

        tokio::select! {
            _ = token.cancelled() => Err(shutdown()),
            outcome = execute_unit(&input) => outcome.into_result(),
        }
    }

    /// Records one unit's terminal status based on its result.
    async fn record_status(
        &self,
        unit: HistoryUnitId,
        task_type: TaskType,
        result: &Result<Option<Value>, RunnerError>,
    ) -> Result<(), RunnerError> {
        let Some(status) = terminal_status(task_type, result.is_ok()) else {
            return Ok(());
        };
        self.status
            .update_status(unit, status)
            .await
            .map_err(|e| RunnerError::job_execution(format!("failed to update unit status: {e:#}")))
    }
}

#[async_trait::async_trait]
impl WorkflowRunner for LocalRunner {
    async fn submit(&self, request: SubmitRequest) -> Result<Option<Value>, RunnerError> {
        validate_submit(&request)?;
        if self.token.is_cancelled() {
            return Err(RunnerError::shutdown("cannot submit after shutdown"));
        }

        debug!(label = request.files.prefix(), "running task unit locally");
        let result = match Self::prepare_unit(
            &request.files,
            &request.command_line,
            &request.parameters,
        ) {
            Ok(input) => {
                Self::run_unit(self.semaphore.clone(), self.token.clone(), input).await
            }
            Err(e) => Err(e),
        };

        self.record_status(request.history_unit, request.task_type, &result)
            .await?;
        result
    }

    async fn multisubmit(
        &self,
        request: MultisubmitRequest,
    ) -> Result<MultiOutcome, RunnerError> {
        validate_multisubmit(&request)?;
        if request.list_parameters.is_empty() {
            return Ok(MultiOutcome::default());
        }
        if self.token.is_cancelled() {
            return Err(RunnerError::shutdown("cannot submit after shutdown"));
        }

        let mut outcome = MultiOutcome::default();
        let mut tasks: JoinSet<(usize, Result<Option<Value>, RunnerError>)> = JoinSet::new();
        for (index, (parameters, files)) in request
            .list_parameters
            .iter()
            .zip(&request.files_list)
            .enumerate()
        {
            match Self::prepare_unit(files, &request.command_line, parameters) {
                Ok(input) => {
                    let semaphore = self.semaphore.clone();
                    let token = self.token.clone();
                    tasks.spawn(async move {
                        (index, Self::run_unit(semaphore, token, input).await)
                    });
                }
                Err(e) => {
                    self.record_status(request.history_units[index], request.task_type, &Err(e.clone()))
                        .await?;
                    outcome.errors.insert(index, e);
                }
            }
        }

        // Statuses are recorded in completion order, so early finishers are
        // observable before slow siblings resolve.
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    return Err(RunnerError::job_execution(format!(
                        "a local execution task panicked: {e}",
                    )));
                }
            };
            self.record_status(request.history_units[index], request.task_type, &result)
                .await?;
            match result {
                Ok(metadiff) => {
                    outcome.results.insert(index, metadiff);
                }
                Err(e) => {
                    outcome.errors.insert(index, e);
                }
            }
        }

        Ok(outcome)
    }

    async fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutting down the local runner");
        }
        self.token.cancel();
    }
}
