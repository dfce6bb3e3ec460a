//! The SLURM execution backend.
//!
//! One runner instance serves one workflow execution. Submission prepares a
//! job's artifacts on disk, stages them to the execution host when a remote
//! working directory is configured, submits the script through the scheduler
//! client, and parks the pending result in the live-jobs table. A background
//! polling loop (spawned at construction) detects completions and resolves
//! the parked results; `submit` and `multisubmit` only await them.
//!
//! The same type covers both cluster deployments: with a
//! [`LocalhostTransport`] and an impersonation user it is the `sudo`-based
//! backend sharing a filesystem with the scheduler, while with an SSH-style
//! transport and a remote working directory it drives a scheduler on another
//! host.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::batch::BatchingPlan;
use crate::batch::ResourceBudget;
use crate::batch::compute_batching;
use crate::batch::partition;
use crate::command::UnitInput;
use crate::config::RunnerConfig;
use crate::config::SlurmDirectives;
use crate::error::RunnerError;
use crate::job::SlurmJob;
use crate::pending::JobTable;
use crate::pending::ResultCell;
use crate::pending::ResultHandle;
use crate::pending::SubmittedJob;
use crate::poll::SlurmCompletionStrategy;
use crate::poll::drain_and_cancel;
use crate::poll::run_poll_loop;
use crate::resolve::ResolveContext;
use crate::runner::MultiOutcome;
use crate::runner::MultisubmitRequest;
use crate::runner::SubmitRequest;
use crate::runner::WorkflowRunner;
use crate::runner::terminal_status;
use crate::runner::validate_multisubmit;
use crate::runner::validate_submit;
use crate::runner::write_args;
use crate::script;
use crate::slurm::SlurmClient;
use crate::status::StatusTracker;
use crate::status::UnitStatus;
use crate::task::HistoryUnitId;
use crate::task::TaskInvocation;
use crate::transport::LocalhostTransport;
use crate::transport::Transport;

/// A runner placing task units on a SLURM cluster.
pub struct SlurmRunner<T: Transport> {
    /// The runner configuration.
    config: Arc<RunnerConfig>,
    /// Scheduler directives rendered into every submission script.
    directives: SlurmDirectives,
    /// The status-tracking collaborator.
    status: Arc<dyn StatusTracker>,
    /// The transport towards the execution host.
    transport: Arc<T>,
    /// The scheduler client.
    client: Arc<SlurmClient<T>>,
    /// The live-jobs table shared with the polling loop.
    table: Arc<JobTable>,
    /// Cancelled when shutdown begins.
    token: CancellationToken,
    /// Set exactly once by whichever path initiates shutdown first.
    shutdown_requested: Arc<AtomicBool>,
    /// The polling loop, joined at shutdown.
    poller: Mutex<Option<JoinHandle<()>>>,
    /// Monotonic counter feeding job labels.
    next_job: AtomicU64,
    /// The remote working directory, if the scheduler is on another host.
    remote_workdir: Option<PathBuf>,
}

impl SlurmRunner<LocalhostTransport> {
    /// Creates a runner for a scheduler reachable from this host, optionally
    /// impersonating another user for every scheduler command.
    ///
    /// Job completion is detected by watching output files in addition to
    /// the periodic scheduler query, since the server shares a filesystem
    /// with the compute nodes.
    pub fn sudo_impersonation(
        config: RunnerConfig,
        directives: SlurmDirectives,
        status: Arc<dyn StatusTracker>,
        impersonate: Option<String>,
        workdir: PathBuf,
    ) -> Result<Self> {
        Self::new(
            config,
            directives,
            status,
            LocalhostTransport,
            impersonate,
            workdir,
            None,
        )
    }
}

impl<T: Transport> SlurmRunner<T> {
    /// Creates a runner and spawns its polling loop.
    ///
    /// Must be called within a Tokio runtime. When `remote_workdir` is set,
    /// every job's artifacts are staged through the transport and completion
    /// relies on the scheduler query alone; otherwise the transport's host
    /// is assumed to share the local working directory.
    pub fn new(
        config: RunnerConfig,
        directives: SlurmDirectives,
        status: Arc<dyn StatusTracker>,
        transport: T,
        impersonate: Option<String>,
        workdir: PathBuf,
        remote_workdir: Option<PathBuf>,
    ) -> Result<Self> {
        config.validate().context("invalid runner configuration")?;
        std::fs::create_dir_all(&workdir).with_context(|| {
            format!(
                "failed to create the working directory `{}`",
                workdir.display(),
            )
        })?;

        let config = Arc::new(config);
        let transport = Arc::new(transport);
        let client = Arc::new(SlurmClient::new(transport.clone(), impersonate));
        let table = Arc::new(JobTable::new());
        let token = CancellationToken::new();
        let shutdown_requested = Arc::new(AtomicBool::new(false));

        let strategy = Arc::new(SlurmCompletionStrategy::new(
            client.clone(),
            remote_workdir.is_none(),
            config.absence_grace(),
        ));
        let ctx = ResolveContext {
            transport: transport.clone(),
            remote: remote_workdir.is_some(),
            grace: config.missing_output_grace(),
        };
        let poller = tokio::spawn(run_poll_loop(
            table.clone(),
            strategy,
            client.clone(),
            ctx,
            config.clone(),
            workdir.join(&config.shutdown_sentinel),
            token.clone(),
            shutdown_requested.clone(),
        ));

        Ok(Self {
            config,
            directives,
            status,
            transport,
            client,
            table,
            token,
            shutdown_requested,
            poller: Mutex::new(Some(poller)),
            next_job: AtomicU64::new(0),
            remote_workdir,
        })
    }

    /// Rejects new submissions once shutdown has begun.
    fn ensure_accepting(&self) -> Result<(), RunnerError> {
        if self.shutdown_requested.load(Ordering::SeqCst) || self.token.is_cancelled() {
            return Err(RunnerError::shutdown("cannot submit after shutdown"));
        }
        Ok(())
    }

    /// Allocates the next job label.
    fn next_label(&self) -> String {
        format!(
            "batch-{:06}",
            self.next_job.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Prepares, stages, and submits one job, parking its pending result in
    /// the live-jobs table.
    ///
    /// Any error here happens before the job has a scheduler id (or before
    /// its result was parked), so the affected units are terminal and the
    /// caller records their failure.
    async fn submit_job(
        &self,
        label: String,
        invocations: Vec<TaskInvocation>,
        budget: &ResourceBudget,
        plan: &BatchingPlan,
    ) -> Result<ResultHandle, RunnerError> {
        let mut job = SlurmJob::new(label, invocations)?;

        self.stage_job(&job, budget, plan)
            .await
            .map_err(|e| RunnerError::submission(format!("{e:#}")))?;

        let script_path = job.remote_script().unwrap_or_else(|| job.script().to_path_buf());
        let id = self
            .client
            .submit(&script_path)
            .await
            .map_err(|e| RunnerError::submission(format!("{e:#}")))?;
        job.assign_id(id);

        let (cell, handle) = ResultCell::new(job.label().to_string(), job.invocations().len());
        self.table.insert(
            id,
            SubmittedJob {
                job,
                cell,
                registered_at: Instant::now(),
            },
        );

        // A submission that passed `ensure_accepting` may reach this insert
        // after shutdown has already drained the table and stopped the
        // polling loop. Shutdown raises its flag before draining, so
        // re-checking after the insert closes the window: either the drain
        // saw the entry, or this pop resolves it.
        if self.shutdown_requested.load(Ordering::SeqCst)
            && let Some(entry) = self.table.pop(id)
        {
            entry
                .cell
                .resolve_all_with(RunnerError::shutdown("runner shutdown requested"));
            if let Err(e) = self.client.cancel(&[id]).await {
                warn!(id, error = %e, "failed to cancel a job submitted during shutdown");
            }
        }
        Ok(handle)
    }

    /// Writes a job's artifacts and transfers them to the execution host if
    /// a remote working directory is configured.
    async fn stage_job(
        &self,
        job: &SlurmJob,
        budget: &ResourceBudget,
        plan: &BatchingPlan,
    ) -> Result<()> {
        std::fs::create_dir_all(job.subfolder()).with_context(|| {
            format!(
                "failed to create the task subfolder `{}`",
                job.subfolder().display(),
            )
        })?;

        for invocation in job.invocations() {
            let files = invocation.files();
            write_args(files, invocation.parameters())?;

            // Paths in the call blob refer to the host that runs the unit.
            let input = UnitInput {
                command: invocation.command_line().to_string(),
                args_file: files
                    .to_remote(&files.args_json())
                    .unwrap_or_else(|| files.args_json()),
                out_file: files
                    .to_remote(&files.metadiff_json())
                    .unwrap_or_else(|| files.metadiff_json()),
                log_file: files
                    .to_remote(&files.log_file())
                    .unwrap_or_else(|| files.log_file()),
            };
            let blob = serde_json::to_string_pretty(&input)
                .context("failed to serialize a call blob")?;
            std::fs::write(files.input_blob(), blob).with_context(|| {
                format!(
                    "failed to write the call blob `{}`",
                    files.input_blob().display(),
                )
            })?;
        }

        let rendered = script::render(
            job,
            budget,
            plan,
            &self.directives,
            &self.config.worker_command,
        );
        std::fs::write(job.script(), rendered).with_context(|| {
            format!(
                "failed to write the submission script `{}`",
                job.script().display(),
            )
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(job.script(), std::fs::Permissions::from_mode(0o755))
                .context("failed to mark the submission script executable")?;
        }

        if self.remote_workdir.is_some() {
            self.push_job_payload(job).await?;
        }
        Ok(())
    }

    /// Transfers a prepared job's artifacts to the remote working directory
    /// as one archive per job.
    async fn push_job_payload(&self, job: &SlurmJob) -> Result<()> {
        let remote_subfolder = job
            .remote_subfolder()
            .context("job has no remote subfolder")?;
        self.transport
            .mkdir(remote_subfolder, true)
            .await
            .context("failed to create the remote task subfolder")?;

        let archive_name = format!("{label}-payload.tar", label = job.label());
        let local_archive = job.subfolder().join(&archive_name);
        let archive = std::fs::File::create(&local_archive)
            .with_context(|| format!("failed to create `{}`", local_archive.display()))?;
        let mut builder = tar::Builder::new(archive);
        let mut members: Vec<PathBuf> = vec![job.script().to_path_buf()];
        for invocation in job.invocations() {
            members.push(invocation.files().args_json());
            members.push(invocation.files().input_blob());
        }
        for member in &members {
            let name = member
                .file_name()
                .context("archive member has no file name")?;
            builder
                .append_path_with_name(member, Path::new(name))
                .with_context(|| format!("failed to archive `{}`", member.display()))?;
        }
        builder
            .into_inner()
            .and_then(|f| f.sync_all())
            .context("failed to finish the payload archive")?;

        let remote_archive = remote_subfolder.join(&archive_name);
        self.transport
            .send_file(&local_archive, &remote_archive)
            .await
            .context("failed to send the payload archive")?;
        self.transport
            .run_command(&format!(
                "tar -xf {archive} -C {folder} && rm {archive}",
                archive = remote_archive.display(),
                folder = remote_subfolder.display(),
            ))
            .await
            .context("failed to unpack the payload archive on the execution host")?;
        let _ = std::fs::remove_file(&local_archive);

        debug!(label = job.label(), "staged job payload");
        Ok(())
    }

    /// Records terminal statuses for a set of units, partitioned by outcome.
    async fn record_statuses(
        &self,
        done: &[HistoryUnitId],
        failed: &[HistoryUnitId],
    ) -> Result<(), RunnerError> {
        if !done.is_empty() {
            self.status
                .bulk_update_status(done, UnitStatus::Done)
                .await
                .map_err(|e| {
                    RunnerError::job_execution(format!("failed to update unit statuses: {e:#}"))
                })?;
        }
        if !failed.is_empty() {
            self.status
                .bulk_update_status(failed, UnitStatus::Failed)
                .await
                .map_err(|e| {
                    RunnerError::job_execution(format!("failed to update unit statuses: {e:#}"))
                })?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: Transport> WorkflowRunner for SlurmRunner<T> {
    async fn submit(&self, request: SubmitRequest) -> Result<Option<Value>, RunnerError> {
        validate_submit(&request)?;
        request
            .budget
            .validate()
            .map_err(|e| RunnerError::validation(format!("{e:#}")))?;
        self.ensure_accepting()?;

        let plan = BatchingPlan {
            tasks_per_job: 1,
            parallel_tasks_per_job: 1,
        };
        let invocation = TaskInvocation::new(
            request.command_line,
            request.parameters,
            request.files,
            request.history_unit,
        );

        let result = match self
            .submit_job(self.next_label(), vec![invocation], &request.budget, &plan)
            .await
        {
            Ok(handle) => handle.wait().await.into_iter().next().unwrap_or_else(|| {
                Err(RunnerError::job_execution(
                    "the job resolved without an outcome for its only unit",
                ))
            }),
            Err(e) => Err(e),
        };

        match terminal_status(request.task_type, result.is_ok()) {
            Some(UnitStatus::Done) => self.record_statuses(&[request.history_unit], &[]).await?,
            Some(UnitStatus::Failed) => self.record_statuses(&[], &[request.history_unit]).await?,
            None => {}
        }
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
        self.ensure_accepting()?;

        let n = request.list_parameters.len();
        let plan = compute_batching(n, &request.budget)
            .map_err(|e| RunnerError::validation(format!("{e:#}")))?;
        debug!(
            invocations = n,
            tasks_per_job = plan.tasks_per_job,
            parallel_tasks_per_job = plan.parallel_tasks_per_job,
            "computed batching plan",
        );

        let MultisubmitRequest {
            command_line,
            task_type,
            list_parameters,
            history_units,
            files_list,
            budget,
        } = request;
        let indexed: Vec<(usize, TaskInvocation)> = list_parameters
            .into_iter()
            .zip(files_list)
            .zip(&history_units)
            .enumerate()
            .map(|(index, ((parameters, files), unit))| {
                (
                    index,
                    TaskInvocation::new(command_line.clone(), parameters, files, *unit),
                )
            })
            .collect();

        let mut outcome = MultiOutcome::default();
        let mut pending = Vec::new();
        for chunk in partition(indexed, plan.tasks_per_job) {
            let (indices, invocations): (Vec<usize>, Vec<TaskInvocation>) =
                chunk.into_iter().unzip();
            match self
                .submit_job(self.next_label(), invocations, &budget, &plan)
                .await
            {
                Ok(handle) => pending.push((indices, handle)),
                Err(e) => {
                    // One chunk failing to submit does not abort its
                    // siblings; the affected units are terminal now.
                    let failed: Vec<HistoryUnitId> =
                        indices.iter().map(|i| history_units[*i]).collect();
                    self.record_statuses(&[], &failed).await?;
                    for index in indices {
                        outcome.errors.insert(index, e.clone());
                    }
                }
            }
        }

        // Await the jobs in completion order so fast batches surface early.
        let mut waiting: FuturesUnordered<_> = pending
            .into_iter()
            .map(|(indices, handle)| async move { (indices, handle.wait().await) })
            .collect();
        while let Some((indices, results)) = waiting.next().await {
            let mut done = Vec::new();
            let mut failed = Vec::new();
            for (index, result) in indices.into_iter().zip(results) {
                let unit = history_units[index];
                match terminal_status(task_type, result.is_ok()) {
                    Some(UnitStatus::Done) => done.push(unit),
                    Some(UnitStatus::Failed) => failed.push(unit),
                    None => {}
                }
                match result {
                    Ok(metadiff) => {
                        outcome.results.insert(index, metadiff);
                    }
                    Err(e) => {
                        outcome.errors.insert(index, e);
                    }
                }
            }
            self.record_statuses(&done, &failed).await?;
        }

        Ok(outcome)
    }

    async fn shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            info!("shutting down the SLURM runner");
            self.token.cancel();
            drain_and_cancel(&self.table, &self.client, "runner shutdown requested").await;
        } else {
            self.token.cancel();
        }

        let poller = self
            .poller
            .lock()
            .expect("lock should not be poisoned")
            .take();
        if let Some(poller) = poller {
            // The loop observes the cancelled token on its next select point.
            let _ = poller.await;
        }
    }
}
