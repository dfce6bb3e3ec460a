//! The completion-polling engine.
//!
//! One background task per cluster runner watches for finished jobs. The
//! engine is parameterized by a [`CompletionStrategy`] rather than
//! subclassed per backend: a cheap sentinel check runs on every tick, while
//! the expensive scheduler status query runs on its own, longer interval, so
//! responsiveness to shutdown and file sentinels is decoupled from the
//! scheduler API call budget.
//!
//! Detecting a finished job and removing it from the live-jobs table happen
//! as one atomic pop, so a completion can never be delivered twice even when
//! racing a concurrent shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::RunnerConfig;
use crate::error::RunnerError;
use crate::pending::JobTable;
use crate::pending::WaitEntry;
use crate::resolve::ResolveContext;
use crate::resolve::resolve_job;
use crate::slurm::SlurmClient;
use crate::slurm::is_terminal_state;
use crate::transport::Transport;

/// The completion-detection capability of a cluster backend.
///
/// Backends compose the two checks instead of subclassing the engine: a
/// shared-filesystem backend watches output files and may skip the scheduler
/// entirely, while an SSH backend relies on the scheduler query alone.
#[async_trait]
pub trait CompletionStrategy: Send + Sync + 'static {
    /// Checks output-file sentinels for the waiting jobs, returning the ids
    /// whose expected outputs all exist.
    ///
    /// Invoked on every polling tick; must be cheap.
    async fn check_sentinels(&self, waiting: &[WaitEntry]) -> Vec<u64>;

    /// Queries the scheduler for the waiting jobs, returning the ids that
    /// have reached a terminal state.
    ///
    /// Invoked on the status-poll interval only. An error here never aborts
    /// the poll loop: the jobs stay in the wait set and the query is retried
    /// on the next scheduled check.
    async fn check_scheduler(&self, waiting: &[WaitEntry]) -> Result<Vec<u64>>;
}

/// The completion strategy of the SLURM backends.
#[derive(Debug)]
pub struct SlurmCompletionStrategy<T: Transport> {
    /// The scheduler client used for status queries.
    client: Arc<SlurmClient<T>>,
    /// Whether the runner host shares a filesystem with the compute nodes
    /// and can watch output files directly.
    watch_files: bool,
    /// How long a job may be absent from a status query before absence is
    /// treated as completion.
    absence_grace: Duration,
}

impl<T: Transport> SlurmCompletionStrategy<T> {
    /// Creates a strategy for the given scheduler client.
    pub fn new(client: Arc<SlurmClient<T>>, watch_files: bool, absence_grace: Duration) -> Self {
        Self {
            client,
            watch_files,
            absence_grace,
        }
    }
}

#[async_trait]
impl<T: Transport> CompletionStrategy for SlurmCompletionStrategy<T> {
    async fn check_sentinels(&self, waiting: &[WaitEntry]) -> Vec<u64> {
        if !self.watch_files {
            return Vec::new();
        }
        waiting
            .iter()
            .filter(|entry| entry.sentinels.iter().all(|path| path.exists()))
            .map(|entry| entry.job_id)
            .collect()
    }

    async fn check_scheduler(&self, waiting: &[WaitEntry]) -> Result<Vec<u64>> {
        let ids: Vec<u64> = waiting.iter().map(|entry| entry.job_id).collect();
        let states = self.client.query(&ids).await?;

        let mut finished = Vec::new();
        for entry in waiting {
            match states.get(&entry.job_id) {
                Some(state) if is_terminal_state(state) => {
                    debug!(id = entry.job_id, %state, "job reached a terminal state");
                    finished.push(entry.job_id);
                }
                Some(_) => {}
                // The scheduler evicts records of old jobs, so absence means
                // completion once the job is old enough to have been seen.
                None if entry.registered_at.elapsed() >= self.absence_grace => {
                    debug!(id = entry.job_id, "job is absent from the queue; treating as finished");
                    finished.push(entry.job_id);
                }
                None => {}
            }
        }
        Ok(finished)
    }
}

/// Runs the polling loop until the cancellation token fires or the shutdown
/// sentinel file appears.
///
/// On an externally requested shutdown (sentinel file), the loop performs
/// the one-time drain itself: every pending result is resolved with a
/// shutdown error and a bulk cancel is issued for the outstanding jobs.
pub(crate) async fn run_poll_loop<T, S>(
    table: Arc<JobTable>,
    strategy: Arc<S>,
    client: Arc<SlurmClient<T>>,
    ctx: ResolveContext<T>,
    config: Arc<RunnerConfig>,
    shutdown_sentinel: PathBuf,
    token: CancellationToken,
    shutdown_requested: Arc<AtomicBool>,
) where
    T: Transport,
    S: CompletionStrategy,
{
    let status_every = config.status_poll_every_ticks();
    let mut tick: u64 = 0;

    loop {
        if token.is_cancelled() {
            break;
        }

        if shutdown_sentinel.exists() {
            info!(
                sentinel = %shutdown_sentinel.display(),
                "shutdown sentinel detected; draining pending jobs",
            );
            token.cancel();
            if !shutdown_requested.swap(true, Ordering::SeqCst) {
                drain_and_cancel(&table, &client, "shutdown sentinel detected").await;
            }
            break;
        }

        let waiting = table.wait_entries();
        if !waiting.is_empty() {
            let mut finished = strategy.check_sentinels(&waiting).await;

            if tick % status_every == 0 {
                match strategy.check_scheduler(&waiting).await {
                    Ok(ids) => finished.extend(ids),
                    Err(e) => {
                        // Transient polling failures are recovered locally:
                        // the jobs stay in the wait set and are retried on
                        // the next scheduled check.
                        warn!(error = %e, "scheduler status query failed; will retry");
                    }
                }
            }

            finished.sort_unstable();
            finished.dedup();
            for id in finished {
                // Popping under the table lock makes the completion callback
                // exactly-once, even racing shutdown.
                if let Some(entry) = table.pop(id) {
                    resolve_job(entry, &ctx).await;
                }
            }
        }

        tick += 1;
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(config.tick_interval()) => {}
        }
    }

    debug!("polling loop exited");
}

/// Resolves every pending result with a shutdown error and bulk-cancels the
/// outstanding jobs.
///
/// Used both by [`run_poll_loop`] for sentinel-initiated shutdowns and by
/// the runner's own shutdown path; the caller is responsible for invoking it
/// at most once.
pub(crate) async fn drain_and_cancel<T: Transport>(
    table: &JobTable,
    client: &SlurmClient<T>,
    reason: &str,
) {
    let drained = table.pop_all();
    if drained.is_empty() {
        return;
    }

    let ids: Vec<u64> = drained
        .iter()
        .filter_map(|entry| entry.job.slurm_id())
        .collect();
    info!(jobs = drained.len(), "cancelling pending results: {reason}");

    for entry in drained {
        entry
            .cell
            .resolve_all_with(RunnerError::shutdown(format!(
                "job `{label}` was cancelled: {reason}",
                label = entry.job.label(),
            )));
    }

    // Failing to reach the scheduler here must not mask the shutdown.
    if let Err(e) = client.cancel(&ids).await {
        warn!(error = %e, "failed to cancel outstanding jobs during shutdown");
    }
}
