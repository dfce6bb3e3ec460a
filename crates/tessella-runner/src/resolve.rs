//! Resolution of finished jobs into per-invocation results.
//!
//! Invoked by the polling engine once per finished job. Resolution fetches
//! the job's remote artifacts if applicable (one archive per job, symmetric
//! to the submission-side transfer), classifies each invocation's outcome
//! blob, and resolves the job's pending result. No result handle is ever
//! abandoned: any failure along the way still resolves every unit of the
//! job with that failure.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tracing::debug;
use tracing::warn;

use crate::command::UnitOutcome;
use crate::command::log_tail;
use crate::error::RunnerError;
use crate::job::SlurmJob;
use crate::pending::JobOutcome;
use crate::pending::SubmittedJob;
use crate::pending::UnitResult;
use crate::transport::Transport;

/// Shared context for resolving finished jobs.
#[derive(Debug)]
pub(crate) struct ResolveContext<T: Transport> {
    /// The transport used to fetch remote artifacts.
    pub transport: Arc<T>,
    /// Whether jobs execute against a remote working directory.
    pub remote: bool,
    /// The grace interval before a missing outcome blob is treated as an
    /// infrastructure failure.
    pub grace: Duration,
}

/// Resolves one finished job, consuming its table entry.
pub(crate) async fn resolve_job<T: Transport>(entry: SubmittedJob, ctx: &ResolveContext<T>) {
    let SubmittedJob { job, cell, .. } = entry;

    if ctx.remote {
        if let Err(e) = fetch_job_artifacts(&job, ctx.transport.as_ref()).await {
            warn!(
                label = job.label(),
                error = %e,
                "failed to fetch job artifacts",
            );
            cell.resolve_all_with(RunnerError::JobExecution {
                message: format!("failed to fetch the job's artifacts: {e:#}"),
                diagnostics: Some(job.diagnostics()),
            });
            return;
        }
    }

    let outcome = collect_outcomes(&job, ctx.grace).await;
    cleanup_artifacts(&job);
    cell.resolve(outcome);
}

/// Fetches a finished job's artifacts from the remote working directory.
///
/// The outcome blobs and logs of every contained invocation are packed into
/// one archive on the remote side, transferred, and unpacked over the local
/// subfolder, amortizing the transfer overhead over the whole batch.
async fn fetch_job_artifacts<T: Transport>(job: &SlurmJob, transport: &T) -> Result<()> {
    let remote_subfolder = job
        .remote_subfolder()
        .context("job has no remote subfolder")?;
    let archive_name = format!("{label}-results.tar", label = job.label());
    let remote_archive = remote_subfolder.join(&archive_name);

    let mut members = Vec::new();
    for invocation in job.invocations() {
        let files = invocation.files();
        for path in [files.outcome_blob(), files.log_file(), files.metadiff_json()] {
            if let Some(name) = path.file_name() {
                members.push(name.to_string_lossy().into_owned());
            }
        }
    }

    // Some members may legitimately be missing (a crashed worker writes no
    // outcome blob), so the archive tolerates failed reads.
    transport
        .run_command(&format!(
            "tar --ignore-failed-read -cf {archive} -C {folder} {members}",
            archive = remote_archive.display(),
            folder = remote_subfolder.display(),
            members = members.join(" "),
        ))
        .await
        .context("failed to pack the job's artifacts on the remote host")?;

    let local_archive = job.subfolder().join(&archive_name);
    transport
        .fetch_file(&remote_archive, &local_archive)
        .await
        .context("failed to fetch the job's artifact archive")?;

    let archive = std::fs::File::open(&local_archive)
        .with_context(|| format!("failed to open `{}`", local_archive.display()))?;
    tar::Archive::new(archive)
        .unpack(job.subfolder())
        .context("failed to unpack the job's artifact archive")?;
    let _ = std::fs::remove_file(&local_archive);

    debug!(label = job.label(), "fetched job artifacts");
    Ok(())
}

/// Classifies the outcome blob of every invocation of a finished job.
///
/// A missing blob is re-checked once after the grace interval (filesystem
/// propagation can lag the scheduler's completion report); if still missing,
/// the affected invocation and every not-yet-processed sibling within the
/// job resolve to a job-execution error carrying the job's diagnostic paths.
async fn collect_outcomes(job: &SlurmJob, grace: Duration) -> JobOutcome {
    let mut results: JobOutcome = Vec::with_capacity(job.invocations().len());
    let mut grace_spent = false;

    for invocation in job.invocations() {
        let path = invocation.files().outcome_blob();

        if !path.exists() && !grace_spent {
            grace_spent = true;
            tokio::time::sleep(grace).await;
        }
        if !path.exists() {
            warn!(
                label = invocation.label(),
                path = %path.display(),
                "job finished without producing an outcome blob",
            );
            let error = RunnerError::JobExecution {
                message: format!(
                    "job finished but the outcome of `{label}` never appeared; the worker likely \
                     crashed (log tail: {tail})",
                    label = invocation.label(),
                    tail = log_tail(&invocation.files().log_file())
                        .unwrap_or_else(|| "<empty>".to_string()),
                ),
                diagnostics: Some(job.diagnostics()),
            };
            // Stop processing this job, but leave no handle unresolved.
            while results.len() < job.invocations().len() {
                results.push(Err(error.clone()));
            }
            break;
        }

        results.push(read_outcome(&path));
    }

    results
}

/// Reads and classifies one outcome blob.
fn read_outcome(path: &Path) -> UnitResult {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        RunnerError::job_execution(format!(
            "failed to read the outcome blob `{path}`: {e}",
            path = path.display(),
        ))
    })?;
    let outcome: UnitOutcome = serde_json::from_str(&contents).map_err(|e| {
        RunnerError::job_execution(format!(
            "failed to parse the outcome blob `{path}`: {e}",
            path = path.display(),
        ))
    })?;
    outcome.into_result()
}

/// Removes the serialized call blobs of a resolved job.
///
/// Logs, metadiff files, and the submission script are kept for postmortem;
/// removal failures are logged and otherwise ignored, since cleanup must
/// proceed regardless of how resolution went.
fn cleanup_artifacts(job: &SlurmJob) {
    for invocation in job.invocations() {
        let files = invocation.files();
        for path in [files.input_blob(), files.outcome_blob()] {
            if let Err(e) = std::fs::remove_file(&path)
                && path.exists()
            {
                debug!(
                    path = %path.display(),
                    error = %e,
                    "failed to remove a resolved job artifact",
                );
            }
        }
    }
}
